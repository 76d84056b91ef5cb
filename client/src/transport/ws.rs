use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{Connection, Connector};
use crate::error::TransportError;

/// Connects to `ws://` and `wss://` roster endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, endpoint: &str) -> Result<WsConnection, TransportError> {
        let (stream, response) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(%endpoint, status = %response.status(), "websocket handshake complete");
        Ok(WsConnection { stream })
    }
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!(len = bytes.len(), "skipping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server closed websocket");
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close handshake failed");
        }
    }
}
