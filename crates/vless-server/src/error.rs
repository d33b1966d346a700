//! Server error types.

use vless_proto::ParseError;

/// Server error type.
///
/// The first four variants are pre-session rejections: they short-circuit
/// before the stream upgrade is accepted and never allocate a session.
/// Mid-session stream faults surface as `Io`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing handshake")]
    MissingHandshake,
    #[error("malformed handshake")]
    MalformedHandshake,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("malformed header: {0:?}")]
    MalformedHeader(ParseError),
    #[error("upstream unreachable")]
    UpstreamUnreachable,
    #[error("config: {0}")]
    Config(String),
}

impl ServerError {
    /// HTTP status used when rejecting a connection before the upgrade.
    ///
    /// Every client-side rejection maps to the same status: malformed and
    /// unauthenticated handshakes are deliberately indistinguishable from
    /// the outside.
    pub fn reject_status(&self) -> u16 {
        match self {
            ServerError::MissingHandshake
            | ServerError::MalformedHandshake
            | ServerError::AuthenticationFailed
            | ServerError::MalformedHeader(_) => 400,
            ServerError::UpstreamUnreachable => 502,
            ServerError::Io(_) | ServerError::Config(_) => 500,
        }
    }
}
