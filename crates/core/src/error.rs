use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("duplicate field name: {0}")]
    DuplicateName(String),

    #[error("field index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("feature id {0} exceeds the signed 64-bit range")]
    IdOutOfRange(u64),
}
