use thiserror::Error;

#[derive(Error, Debug)]
pub enum AesdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A positional seek named a command slot or byte that is not present.
    #[error("seek target out of range")]
    InvalidSeek,
    /// Fallible allocation failed while growing a command buffer.
    #[error("out of memory")]
    OutOfMemory,
    /// The wait for the device lock was interrupted; nothing was mutated.
    #[error("interrupted while waiting for the device")]
    Interrupted,
}

impl From<AesdError> for std::io::Error {
    fn from(err: AesdError) -> std::io::Error {
        use std::io::ErrorKind;
        match err {
            AesdError::Io(e) => e,
            AesdError::InvalidSeek => {
                std::io::Error::new(ErrorKind::InvalidInput, "seek target out of range")
            }
            AesdError::OutOfMemory => std::io::Error::from(ErrorKind::OutOfMemory),
            AesdError::Interrupted => std::io::Error::from(ErrorKind::Interrupted),
        }
    }
}
