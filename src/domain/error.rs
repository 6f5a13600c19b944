use thiserror::Error;

/// Failures surfaced by the printer link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("connection lost: {0}")]
    LinkLost(String),

    #[error("USB device exposes no bulk OUT endpoint")]
    NoEndpoint,

    #[error("not connected")]
    NotConnected,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("connect attempt cancelled")]
    Cancelled,

    #[error("printer link service stopped")]
    ServiceStopped,
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => LinkError::PermissionDenied(e.to_string()),
            _ => LinkError::IoFailure(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: LinkError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, LinkError::IoFailure(_)));

        let err: LinkError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, LinkError::PermissionDenied(_)));
    }
}
