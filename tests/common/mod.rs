//! In-process mock of the editor plugin's WebSocket listener.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use editor_link::{LinkConfig, ReconnectPolicy};

/// Upper bound on any single wait, so a broken test fails instead of hanging.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Answer the handshake with the subprotocol the client asked for.
fn echo_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol.clone());
    }
    Ok(response)
}

/// Listener that hands every accepted connection to the test.
pub struct MockEditor {
    addr: SocketAddr,
    sessions: mpsc::UnboundedReceiver<EditorSession>,
    task: JoinHandle<()>,
}

impl MockEditor {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock editor");
        let addr = listener.local_addr().expect("Listener has no address");
        let (tx, sessions) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol).await {
                        let _ = tx.send(EditorSession { ws });
                    }
                });
            }
        });

        Self {
            addr,
            sessions,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Fast timings suitable for tests against this editor.
    pub fn config(&self) -> LinkConfig {
        test_config(&self.url())
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> EditorSession {
        timeout(TEST_TIMEOUT, self.sessions.recv())
            .await
            .expect("Timed out waiting for a client connection")
            .expect("Mock editor stopped")
    }

    /// Wait up to `wait` for a client connection.
    pub async fn try_accept(&mut self, wait: Duration) -> Option<EditorSession> {
        timeout(wait, self.sessions.recv()).await.ok().flatten()
    }
}

impl Drop for MockEditor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Link configuration with short timeouts, no heartbeat and quick retries.
pub fn test_config(url: &str) -> LinkConfig {
    let endpoint = LinkConfig::parse_endpoint(url).expect("Test URL is valid");
    let mut config = LinkConfig::with_endpoint(endpoint);
    config.command_timeout = Duration::from_secs(2);
    config.connect_timeout = Duration::from_secs(2);
    config.heartbeat_interval = None;
    config.reconnect = ReconnectPolicy::Exponential {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(200),
        max_jitter: Duration::from_millis(10),
    };
    config
}

/// Editor side of one accepted connection.
pub struct EditorSession {
    ws: WebSocketStream<TcpStream>,
}

impl EditorSession {
    /// Next frame of any kind.
    pub async fn next_message(&mut self) -> Message {
        timeout(TEST_TIMEOUT, self.ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Client closed the connection")
            .expect("Socket error")
    }

    /// Next command envelope, skipping control frames.
    pub async fn recv_command(&mut self) -> Value {
        loop {
            match self.next_message().await {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).expect("Command is not JSON")
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Unexpected frame from client: {:?}", other),
            }
        }
    }

    /// Send a reply envelope as a text frame.
    pub async fn reply(&mut self, body: Value) {
        self.send_text(&body.to_string()).await;
    }

    /// Send a success reply for `command`.
    pub async fn reply_success(&mut self, command: &Value, result: Value) {
        self.reply(serde_json::json!({
            "commandId": command["commandId"],
            "status": "success",
            "result": result,
        }))
        .await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_binary(&mut self, body: &[u8]) {
        self.ws
            .send(Message::Binary(body.to_vec().into()))
            .await
            .expect("Failed to send frame");
    }

    /// Start the close handshake from the editor side and return the
    /// client's answering frame.
    pub async fn close_from_editor(&mut self) -> Message {
        self.ws.close(None).await.expect("Failed to send close frame");
        self.next_message().await
    }

    /// Wait until the client closes its side.
    pub async fn expect_closed(&mut self) {
        let closed = timeout(TEST_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "Client did not close the connection");
    }
}
