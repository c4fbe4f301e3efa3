use std::fmt::Display;

/// A specialized error type for commit log operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CommitLogError {
    /// An I/O error occurred while talking to the block device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A buffer handed to the device layer was not a whole number of blocks,
    /// or was too small for the requested transfer.
    #[error("unaligned device transfer: {0}")]
    UnalignedTransfer(String),
    /// A framed record would not fit the destination buffer.
    #[error("record of {needed} blocks exceeds buffer of {capacity} blocks")]
    RecordTooLarge { needed: u64, capacity: u64 },
    /// On-flash data failed validation.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Mutation payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The append executor is no longer running.
    #[error("append executor stopped")]
    ExecutorStopped,
    /// The log has been shut down and accepts no further work.
    #[error("commit log is shut down")]
    Shutdown,
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CommitLogError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create a serialization error from a displayable value.
    pub fn serialization<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Serialization(msg.to_string())
    }
}

/// A Result type alias for commit log operations.
pub type CommitLogResult<T> = Result<T, CommitLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = CommitLogError::invalid_config("bad device list");
        assert!(matches!(err, CommitLogError::InvalidConfig(msg) if msg == "bad device list"));
    }

    #[test]
    fn io_errors_convert() {
        let err: CommitLogError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, CommitLogError::Io(_)));
    }
}
