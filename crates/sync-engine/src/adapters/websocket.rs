//! `tokio-tungstenite` implementation of the push channel ports.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::domain::{Credential, SyncError};
use crate::ports::{ChannelConnector, ChannelStream};

/// Opens WebSocket connections with the credential in a query parameter.
pub struct WsConnector {
    url: Url,
    token_param: String,
}

impl WsConnector {
    /// Connector for `ws_url`, sending the token as `?{token_param}=...`.
    pub fn new(ws_url: &str, token_param: impl Into<String>) -> Result<Self, SyncError> {
        let url = Url::parse(ws_url)
            .map_err(|e| SyncError::Config(format!("ws url {}: {}", ws_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::Config(format!(
                "ws url must use ws:// or wss://, got {}",
                ws_url
            )));
        }

        Ok(Self {
            url,
            token_param: token_param.into(),
        })
    }

    /// Connection URL for one credential.
    pub fn url_for(&self, credential: &Credential) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(&self.token_param, credential.token());
        url
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn ChannelStream>, SyncError> {
        let url = self.url_for(credential);

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::ChannelError(format!("connect {}: {}", self.url, e)))?;

        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(Box::new(WsStream { socket }))
    }
}

struct WsStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChannelStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<String, SyncError>> {
        while let Some(message) = self.socket.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                    }
                },
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.socket.send(Message::Pong(data)).await {
                        return Some(Err(SyncError::ChannelError(format!("pong: {}", e))));
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(SyncError::ChannelError(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_query_param() {
        let connector = WsConnector::new("wss://push.example.com/ws?v=2", "token").unwrap();
        let url = connector.url_for(&Credential::new("a b&c"));
        assert_eq!(url.as_str(), "wss://push.example.com/ws?v=2&token=a+b%26c");
    }

    #[test]
    fn test_rejects_http_scheme() {
        assert!(matches!(
            WsConnector::new("https://push.example.com/ws", "token"),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_channel_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let connector = WsConnector::new(&format!("ws://127.0.0.1:{}/ws", port), "token").unwrap();
        assert!(matches!(
            connector.connect(&Credential::new("t")).await,
            Err(SyncError::ChannelError(_))
        ));
    }
}
