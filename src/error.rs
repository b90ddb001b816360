//! Error types for the sketchlink client library.

use crate::transport::TransportError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while driving the job protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Transport-level failure from the broker connection.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload could not be encoded or decoded as JSON.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Encoded source was not valid base64.
    #[error("source encoding error: {0}")]
    SourceEncoding(#[from] base64::DecodeError),

    /// Decoded source was not valid UTF-8.
    #[error("source is not valid utf-8: {0}")]
    SourceUtf8(#[from] std::string::FromUtf8Error),

    /// A subscription already exists for the topic.
    #[error("topic already has an active subscription: {0}")]
    TopicInUse(String),
}

impl ProtocolError {
    /// Returns true if this is a transport-level failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Transport(_))
    }

    /// Returns true if this is a payload codec failure.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            ProtocolError::Codec(_)
                | ProtocolError::SourceEncoding(_)
                | ProtocolError::SourceUtf8(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = ProtocolError::Transport(TransportError::Publish("refused".to_string()));
        assert_eq!(err.to_string(), "transport error: publish failed: refused");
        assert!(err.is_transport());
        assert!(!err.is_codec());
    }

    #[test]
    fn test_topic_in_use_display() {
        let err = ProtocolError::TopicInUse("response/verify/abc".to_string());
        assert_eq!(
            err.to_string(),
            "topic already has an active subscription: response/verify/abc"
        );
    }

    #[test]
    fn test_codec_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(err.is_codec());
    }
}
