use std::time::Duration;

use thiserror::Error;

/// Errors returned to callers of [`EditorLink`](super::EditorLink).
///
/// Cloneable because a single transport failure fans out to every request
/// and every `connect()` caller waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// A command was issued while no connection is open.
    #[error("Not connected to the editor. Ensure the editor is running and its plugin is enabled")]
    NotConnected,

    /// No reply arrived within the per-command timeout.
    #[error("Command timed out: {kind} (after {}ms)", .after.as_millis())]
    CommandTimeout { kind: String, after: Duration },

    /// The editor replied with `status: "error"`.
    #[error("{0}")]
    RemoteError(String),

    /// The socket closed while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Opening the socket did not finish within the connect timeout.
    #[error("Connection attempt timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    /// The socket could not be opened.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Command parameters did not serialize to a JSON object.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// The reply's result did not match the expected type.
    #[error("Invalid result: {0}")]
    InvalidResult(String),

    /// The command envelope could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The link task is no longer running.
    #[error("Editor link has shut down")]
    Shutdown,
}

impl LinkError {
    /// Whether the failure came from the connection rather than the command.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LinkError::NotConnected
                | LinkError::ConnectionClosed
                | LinkError::ConnectTimeout(_)
                | LinkError::Transport(_)
                | LinkError::Shutdown
        )
    }
}
