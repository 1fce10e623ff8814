use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("invalid integer")]
    InvalidInt,

    #[error("invalid string length")]
    InvalidLength,

    #[error("nesting deeper than {0} levels")]
    DepthLimit(usize),

    #[error("non-string dictionary key")]
    NonStringKey,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}
