//! Correlated command channel to the editor.
//!
//! This module owns the single WebSocket connection to the editor plugin and
//! turns it into request/response calls:
//!
//! ```text
//! ┌──────────────────┐        WebSocket (json)        ┌─────────────────┐
//! │ operation glue   │  send_command ─► {type, params, │  editor plugin  │
//! │  (EditorLink)    │                  commandId}  ──►│                 │
//! │                  │ ◄── {commandId, status, result} │                 │
//! └──────────────────┘                                 └─────────────────┘
//! ```
//!
//! - `client` - `EditorLink` handle and the task that owns the connection
//! - `pending` - in-flight commands keyed by correlation id
//! - `timer` - single-shot deadline and retry timers
//! - `backoff` - reconnection delays
//! - `transport` - opening the WebSocket
//!
//! # Usage
//!
//! ```ignore
//! use editor_link::{EditorLink, LinkConfig};
//! use serde_json::json;
//!
//! let link = EditorLink::new(LinkConfig::from_env()?);
//! link.connect().await?;
//! let props = link
//!     .send_command("get_node_properties", json!({"node_path": "/root/Main"}))
//!     .await?;
//! ```

mod backoff;
mod client;
mod error;
mod pending;
mod timer;
mod transport;

pub use backoff::Backoff;
pub use client::{ConnectionState, EditorLink, LinkStatus};
pub use error::LinkError;
