//! Repository implementations for database operations.

mod dead_letter_repo;
mod job_repo;
mod key_repo;

pub use dead_letter_repo::DeadLetterRepository;
pub use job_repo::JobRepository;
pub use key_repo::IdempotencyKeyRepository;
