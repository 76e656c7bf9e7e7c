use thiserror::Error;

pub type KvResult<T> = std::result::Result<T, KvError>;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("KV backend error: {0}")]
    Backend(String),

    #[error("Failed to decode value stored at '{0}': {1} ({1:?})")]
    Decode(String, serde_json::Error),

    #[error("Failed to encode value for '{0}': {1} ({1:?})")]
    Encode(String, serde_json::Error),

    #[error("Lock on '{0}' is held by another owner")]
    LockBusy(String),
}
