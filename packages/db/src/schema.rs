//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    // Live jobs, eligible or leased
    db.query(JOB_SCHEMA).await?.check()?;

    // Terminal failures
    db.query(DEAD_LETTER_SCHEMA).await?.check()?;

    // Producer deduplication
    db.query(IDEMPOTENCY_KEY_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Timestamps are RFC 3339 text and the payload is JSON
/// text, so any JSON value round-trips unchanged.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON job TYPE string ASSERT $value IN ["jira", "slack", "metrics"];
DEFINE FIELD IF NOT EXISTS payload ON job TYPE string;
DEFINE FIELD IF NOT EXISTS attempt ON job TYPE int;
DEFINE FIELD IF NOT EXISTS max_attempts ON job TYPE int;
DEFINE FIELD IF NOT EXISTS not_before ON job TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE string;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE string;
DEFINE FIELD IF NOT EXISTS last_error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS idempotency_key ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS lease_worker_id ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS lease_expires_at ON job TYPE option<string>;

DEFINE INDEX IF NOT EXISTS job_queue ON job FIELDS queue;
DEFINE INDEX IF NOT EXISTS job_key ON job FIELDS idempotency_key;
"#;

/// Dead-letter table schema. Record ids are job ids, so one job has at most
/// one dead letter. The job snapshot is stored as JSON text.
const DEAD_LETTER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS dead_letter SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS job ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS final_error ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS reason ON dead_letter TYPE string ASSERT $value IN ["exhausted", "non_retryable"];
DEFINE FIELD IF NOT EXISTS failed_at ON dead_letter TYPE string;
DEFINE FIELD IF NOT EXISTS failed_at_ms ON dead_letter TYPE int;

DEFINE INDEX IF NOT EXISTS dead_letter_queue ON dead_letter FIELDS queue;
DEFINE INDEX IF NOT EXISTS dead_letter_failed ON dead_letter FIELDS failed_at_ms;
"#;

/// Idempotency key reservations, expired by `expires_at_ms`.
const IDEMPOTENCY_KEY_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS idempotency_key SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS key ON idempotency_key TYPE string;
DEFINE FIELD IF NOT EXISTS job_id ON idempotency_key TYPE string;
DEFINE FIELD IF NOT EXISTS expires_at_ms ON idempotency_key TYPE int;

DEFINE INDEX IF NOT EXISTS idempotency_expiry ON idempotency_key FIELDS expires_at_ms;
"#;
