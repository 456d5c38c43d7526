//! In-process DevTools endpoint for integration tests
//!
//! A WebSocket server speaking just enough of the inspector protocol:
//! every command gets `{"result":{"param":1}}` back with the session id
//! echoed, and a few magic methods drive server-side behavior so tests can
//! provoke events and disconnects.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Mock DevTools server bound to an ephemeral local port.
pub struct DevToolsServer {
    url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl DevToolsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock devtools server");
        let addr = listener.local_addr().expect("local addr");
        let url = format!("ws://{}", addr);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _peer)) => {
                                tokio::spawn(Self::handle_connection(stream));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            url,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn handle_connection(stream: TcpStream) {
        let Ok(ws_stream) = accept_async(stream).await else {
            return;
        };
        let (mut sender, mut receiver) = ws_stream.split();

        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    let Ok(command) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let method = command
                        .get("method")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");

                    if method == "Connection.close" {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }

                    if method == "Event.emit" {
                        let event = json!({
                            "method": command["params"]["method"],
                            "params": { "emitted": true },
                        });
                        if sender
                            .send(Message::Text(event.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }

                    let mut response = json!({
                        "id": command["id"],
                        "result": { "param": 1 },
                    });
                    if let Some(session_id) = command.get("sessionId") {
                        response["sessionId"] = session_id.clone();
                    }
                    if sender
                        .send(Message::Text(response.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Message::Ping(data)) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

impl Drop for DevToolsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
