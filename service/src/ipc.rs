//! Unix domain socket IPC listener.
//!
//! Accepts connections, reads newline-delimited JSON-RPC-lite messages,
//! hands them to the [`Dispatcher`] and writes one response line per request.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use crate::dispatch::Dispatcher;

/// Bind the listener at `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("Catalog service listening on {}", path.display());
    Ok(listener)
}

/// Serve connections until `shutdown` flips to true.
pub async fn serve(
    dispatcher: Arc<Dispatcher>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let d = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        d.connection_opened();
                        if let Err(e) = handle_connection(&d, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                        d.connection_closed();
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {e}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Listener shutting down");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Handle a single client connection.
///
/// Each request line is dispatched on its own task, so a slow mutation never
/// holds back later lines on the same connection. Responses go through one
/// writer task in completion order; clients pair them by `id`.
async fn handle_connection(dispatcher: &Arc<Dispatcher>, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut response_bytes =
                serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
            response_bytes.push(b'\n');
            writer.write_all(&response_bytes).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let read_result = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break Ok(()), // EOF
            Ok(_) => {}
            Err(e) => break Err(e),
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let d = Arc::clone(dispatcher);
        let tx = tx.clone();
        let request = trimmed.to_string();
        tokio::spawn(async move {
            let response = d.dispatch_message(&request).await;
            if tx.send(response).is_err() {
                tracing::debug!("Connection writer gone, dropping response");
            }
        });
    };

    // The writer drains until every in-flight request has answered.
    drop(tx);
    let write_result = writer_task
        .await
        .map_err(|e| std::io::Error::other(format!("writer task failed: {e}")))?;
    read_result.and(write_result)
}
