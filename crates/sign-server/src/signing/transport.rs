use std::fmt;

use async_trait::async_trait;
use async_tungstenite::tokio::{ConnectStream, connect_async};
use async_tungstenite::tungstenite::{self, Message};
use async_tungstenite::WebSocketStream;
use futures::StreamExt;
use http::Uri;
use tracing::debug;

use super::backend::SigningError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for SigningError {
    fn from(error: TransportError) -> Self {
        SigningError::Connection(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    Plain,
    Tls,
}

/// Remote signer address. The scheme decides whether TLS is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    security: TransportSecurity,
}

impl Endpoint {
    /// Parses a `ws://`, `wss://`, `http://` or `https://` address.
    ///
    /// HTTP schemes are mapped onto their websocket equivalents.
    pub fn parse(address: &str) -> Result<Self, SigningError> {
        let uri: Uri = address
            .trim()
            .parse()
            .map_err(|e| {
                SigningError::Configuration(format!("invalid endpoint {address:?}: {e}"))
            })?;

        let (scheme, security) = match uri.scheme_str() {
            Some("ws") | Some("http") => ("ws", TransportSecurity::Plain),
            Some("wss") | Some("https") => ("wss", TransportSecurity::Tls),
            Some(other) => {
                return Err(SigningError::Configuration(format!(
                    "unsupported endpoint scheme {other:?}"
                )));
            }
            None => {
                return Err(SigningError::Configuration(format!(
                    "endpoint {address:?} has no scheme"
                )));
            }
        };

        let authority = uri.authority().ok_or_else(|| {
            SigningError::Configuration(format!("endpoint {address:?} has no host"))
        })?;
        let path = match uri.path_and_query().map(|p| p.as_str()) {
            Some(p) if !p.is_empty() => p,
            _ => "/",
        };

        Ok(Self {
            url: format!("{scheme}://{authority}{path}"),
            security,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn security(&self) -> TransportSecurity {
        self.security
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// One open, message-framed channel to the remote signer.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Waits for the next text message.
    async fn recv(&mut self) -> Result<String, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;
}

/// Websocket connector; TLS is negotiated for `wss` endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        debug!(endpoint = %endpoint, security = ?endpoint.security(), "opening websocket");
        let (stream, response) = connect_async(endpoint.url()).await?;
        debug!(status = %response.status(), "websocket upgraded");
        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: WebSocketStream<ConnectStream>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => return Ok(text),
                Message::Binary(bytes) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| {
                            TransportError::Other(format!("binary frame is not UTF-8: {e}"))
                        });
                }
                Message::Close(frame) => {
                    debug!(?frame, "peer sent close frame");
                    return Err(TransportError::Closed);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Err(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
