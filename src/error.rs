use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid wallet configuration: {0}")]
    Configuration(String),

    #[error("Invalid derivation path: {0}")]
    Path(String),

    #[error("Cannot determine cosigner: {0}")]
    AmbiguousCosigner(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Transaction consistency check failed: {0}")]
    Consistency(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transaction: {0}")]
    Transaction(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Chain service error: {0}")]
    Network(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl From<secp256k1::Error> for WalletError {
    fn from(err: secp256k1::Error) -> Self {
        WalletError::Key(err.to_string())
    }
}

impl From<tokio::task::JoinError> for WalletError {
    fn from(err: tokio::task::JoinError) -> Self {
        WalletError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
