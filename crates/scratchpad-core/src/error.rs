use thiserror::Error;

pub type ScratchpadResult<T> = Result<T, ScratchpadError>;

#[derive(Debug, Error)]
pub enum ScratchpadError {
    /// Remote public key is malformed or not on P-384. Fatal to the handshake attempt.
    #[error("key agreement error: {0}")]
    KeyAgreement(String),

    /// Authentication tag mismatch or malformed ciphertext. The message is dropped.
    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    /// Connection drop; handled by the reconnect policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unrecognized message shape. Logged, dropped, channel stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("push rejected: {0}")]
    PushRejected(PushRejection),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why an outbound push was refused. The caller keeps its dirty flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRejection {
    TransportNotOpen,
    NoSymmetricKey,
}

impl std::fmt::Display for PushRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushRejection::TransportNotOpen => f.write_str("transport is not open"),
            PushRejection::NoSymmetricKey => f.write_str("no symmetric key established"),
        }
    }
}

impl ScratchpadError {
    /// True for errors that only drop the current message and leave the channel up.
    pub fn is_message_local(&self) -> bool {
        matches!(
            self,
            ScratchpadError::Decryption(_) | ScratchpadError::Protocol(_)
        )
    }
}
