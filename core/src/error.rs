use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Repository already exists at {path}")]
    AlreadyExists { path: String },

    #[error("Unsupported repository version: {version}")]
    VersionMismatch { version: u32 },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Bad passphrase")]
    BadPassphrase,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
