use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("record already present")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store is shutting down")]
    Cancelled,
}

impl StoreError {
    /// Stable numeric code for callers that cross a language or process
    /// boundary. Codes are append-only.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::InvalidParameter(_) => 1,
            StoreError::Duplicate => 2,
            StoreError::NotFound => 3,
            StoreError::Io(_) => 4,
            StoreError::Corruption(_) => 5,
            StoreError::Database(_) => 6,
            StoreError::Cancelled => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(StoreError::InvalidParameter("x").code(), 1);
        assert_eq!(StoreError::Duplicate.code(), 2);
        assert_eq!(StoreError::NotFound.code(), 3);
        assert_eq!(StoreError::Corruption("x".into()).code(), 5);
        assert_eq!(StoreError::Cancelled.code(), 7);
    }
}
