//! WebSocket transport backed by tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use super::{Connection, Connector};
use crate::domain::Credential;
use crate::shared::error::{RealtimeError, Result};

/// Opens WebSocket connections to a fixed endpoint, presenting the
/// credential as a bearer `Authorization` header on the upgrade request.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    max_frame_size: usize,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, max_frame_size: usize) -> Self {
        Self {
            url: url.into(),
            max_frame_size,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Connection>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Transport(format!("invalid endpoint: {}", e)))?;
        let header = HeaderValue::from_str(&credential.authorization_header())
            .map_err(|_| RealtimeError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(self.max_frame_size);
        config.max_message_size = Some(self.max_frame_size);

        let (stream, _) = connect_async_with_config(request, Some(config), false)
            .await
            .map_err(map_handshake_error)?;

        tracing::debug!(url = %self.url, "WebSocket connection established");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

fn map_handshake_error(err: WsError) -> RealtimeError {
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            RealtimeError::Auth(format!("handshake rejected with {}", response.status()))
        }
        other => RealtimeError::Transport(other.to_string()),
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(len = data.len(), "Dropping non-UTF-8 binary frame");
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Server closed connection");
                    return None;
                }
                // Pings are answered by tungstenite on the next write/flush.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(RealtimeError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
