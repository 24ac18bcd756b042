//! Editor link library
//!
//! Bridges automation clients to a running editor over one persistent
//! WebSocket connection:
//!
//! - `link` - connection manager, command correlation, timeouts, reconnection
//! - `protocol` - request and reply envelopes on the wire
//! - `config` - endpoint, timeouts and reconnection policy
//!
//! ```ignore
//! use editor_link::{EditorLink, LinkConfig};
//!
//! let link = EditorLink::new(LinkConfig::for_port(9080));
//! link.connect().await?;
//! let pong = link.send_command("ping", serde_json::json!({})).await?;
//! ```

pub mod config;
pub mod link;
pub mod protocol;

pub use config::{ConfigError, LinkConfig, ReconnectPolicy};
pub use link::{ConnectionState, EditorLink, LinkError, LinkStatus};
