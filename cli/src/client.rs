//! WebSocket client for the khatm server

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use khatm::service::ApiResponse;
use khatm::websocket::{ClientEnvelope, ClientMessage, ServerMessage};

/// WebSocket client for khatm
pub struct KhatmClient {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<ServerMessage>,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
}

impl KhatmClient {
    /// Connect to a khatm server
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::debug!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Channel for outgoing messages
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);

        // Channel for incoming parsed messages
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(32);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = out_rx.recv() => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(result) = read.next() => {
                        match result {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(msg) => {
                                        if in_tx.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse message: {} - {}", e, text);
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(Self {
            tx: out_tx,
            rx: in_rx,
            handle,
        })
    }

    async fn send(&self, envelope: &ClientEnvelope) -> Result<()> {
        let json = serde_json::to_string(envelope)?;
        self.tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Send one request and wait for the response carrying its id
    pub async fn request(&mut self, message: ClientMessage) -> Result<ApiResponse<serde_json::Value>> {
        let request_id = Uuid::new_v4().to_string();
        self.send(&ClientEnvelope {
            request_id: Some(request_id.clone()),
            message,
        })
        .await?;

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ServerMessage::Response {
                    request_id: Some(id),
                    success,
                    data,
                    error,
                } if id == request_id => {
                    return Ok(ApiResponse {
                        success,
                        data,
                        error,
                    });
                }
                ServerMessage::Response { .. } => continue,
            }
        }

        Err(anyhow!("Connection closed"))
    }

    /// Like [`request`](Self::request), with a failed response turned into an error
    pub async fn call<T: DeserializeOwned>(&mut self, message: ClientMessage) -> Result<T> {
        let response = self.request(message).await?;
        decode(response)
    }
}

/// Payload of a successful response
pub fn decode<T: DeserializeOwned>(response: ApiResponse<serde_json::Value>) -> Result<T> {
    if !response.success {
        return Err(anyhow!(response
            .error
            .unwrap_or_else(|| "Request failed".to_string())));
    }
    let data = response.data.unwrap_or(serde_json::Value::Null);
    Ok(serde_json::from_value(data)?)
}
