use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("Unauthorized family access")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("kv error: {0}")]
    Kv(#[from] kinpoint_kv::KvError),
    #[error("repository error: {0}")]
    Repository(#[from] kinpoint_db::RepoError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Message placed in the `error` field of a failed ack.
    pub fn ack_message(&self) -> String {
        match self {
            Self::Kv(_) => "temporary backend failure, retry".to_string(),
            Self::Repository(kinpoint_db::RepoError::NotConfigured) => {
                "record store unavailable".to_string()
            }
            Self::Repository(_) => "record store error".to_string(),
            other => other.to_string(),
        }
    }
}
