//! WebSocket transport to the editor plugin.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::error::LinkError;

/// Socket type owned by the link task once connected.
pub(crate) type EditorSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the WebSocket, failing with [`LinkError::ConnectTimeout`] if the TCP
/// connect and handshake do not finish within `timeout`.
pub(crate) async fn open(
    endpoint: &Url,
    subprotocol: Option<&str>,
    timeout: Duration,
) -> Result<EditorSocket, LinkError> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| LinkError::Transport(format!("Invalid request for {}: {}", endpoint, e)))?;

    if let Some(protocol) = subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| LinkError::Transport(format!("Invalid subprotocol '{}': {}", protocol, e)))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    debug!("Opening WebSocket to {}", endpoint);
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((socket, response))) => {
            debug!("WebSocket handshake completed ({})", response.status());
            Ok(socket)
        }
        Ok(Err(e)) => Err(LinkError::Transport(format!(
            "Failed to connect to {}: {}",
            endpoint, e
        ))),
        Err(_) => Err(LinkError::ConnectTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Bind then drop to obtain a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let result = open(&url, None, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(LinkError::Transport(_))), "{:?}", result.err());
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let timeout = Duration::from_millis(200);
        let result = open(&url, Some("json"), timeout).await;
        assert_eq!(result.err(), Some(LinkError::ConnectTimeout(timeout)));
    }
}
