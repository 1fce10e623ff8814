use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The peer broke the extension protocol; aborts this connection only.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}
