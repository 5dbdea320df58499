use thiserror::Error;

use procura_core::workflow::JournalError;

pub mod instance;

pub use instance::SqlInstanceJournal;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for JournalError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(error) => JournalError::Storage(error.to_string()),
            RepositoryError::Decode(message) => JournalError::Decode(message),
        }
    }
}
