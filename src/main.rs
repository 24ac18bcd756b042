//! editor-link - relay newline-delimited JSON commands to the editor.
//!
//! Each stdin line is `{"type": "<operation>", "params": {...}}`; each reply
//! is written to stdout as one JSON line. Logs go to stderr.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use editor_link::{EditorLink, LinkConfig};

/// One relayed command as read from stdin.
#[derive(Debug, Deserialize)]
struct RelayRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (stdout carries replies)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "editor_link=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting editor-link v{}", env!("CARGO_PKG_VERSION"));

    let config = LinkConfig::from_env().context("Invalid editor link configuration")?;
    let link = EditorLink::new(config);

    if let Err(e) = link.connect().await {
        // Retries continue in the background; commands fail until then.
        tracing::warn!("Initial connection failed: {}", e);
    }

    let result = tokio::select! {
        result = relay(&link) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    link.disconnect();
    // Commands are handled in order, so this returns after the disconnect ran.
    let _ = link.status().await;

    if let Err(e) = &result {
        tracing::error!("Relay error: {}", e);
    }
    tracing::info!("editor-link exited");
    result
}

async fn relay(link: &EditorLink) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<RelayRequest>(line) {
            Ok(request) => match link.send_command(&request.kind, request.params).await {
                Ok(result) => json!({"status": "success", "result": result}),
                Err(e) => json!({"status": "error", "message": e.to_string()}),
            },
            Err(e) => json!({"status": "error", "message": format!("Invalid request: {}", e)}),
        };

        stdout
            .write_all(format!("{}\n", reply).as_bytes())
            .await
            .context("Failed to write reply")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }

    Ok(())
}
