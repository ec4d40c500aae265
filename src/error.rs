use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("import source has no data rows after the header")]
    EmptyImport,
    #[error("no ledger for quiz {quiz_id}")]
    NotFound { quiz_id: String },
    #[error("every code for quiz {quiz_id} is activated")]
    NoCodeAvailable { quiz_id: String },
    #[error("invalid quiz id {quiz_id:?}")]
    InvalidQuizId { quiz_id: String },
    #[error("io error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl LedgerError {
    /// Read or write of the backing file failed, as opposed to an expected
    /// condition like an exhausted pool.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, LedgerError::Storage(_) | LedgerError::Csv(_))
    }
}
