use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::backend::{Result, SigningBackend, SigningError, SigningRequest, SigningResult};
use super::protocol::{self, SignReply};
use super::transport::{Connection, Connector, Endpoint, WsConnector};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// First attempt plus one retry after a transport failure.
const MAX_ATTEMPTS: u32 = 2;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Handshaking,
    Ready,
}

/// The cached connection. `Ready` always comes with `Some(connection)`.
///
/// An exchange checks the connection out and only checks it back in once its
/// response has been read, so a cancelled exchange leaves the session
/// `Disconnected` and the next caller reconnects.
struct Session {
    state: ConnectionState,
    connection: Option<Box<dyn Connection>>,
}

impl Session {
    fn check_in(&mut self, connection: Box<dyn Connection>) {
        self.connection = Some(connection);
        self.state = ConnectionState::Ready;
    }
}

/// One outbound request waiting for its single response.
struct PendingExchange {
    id: String,
    started: Instant,
}

impl PendingExchange {
    fn new(id: String) -> Self {
        Self {
            id,
            started: Instant::now(),
        }
    }

    /// Fails when the response echoes an id other than ours.
    fn settle(self, reply: &SignReply) -> Result<()> {
        if let Some(reply_id) = reply.id.as_deref() {
            if reply_id != self.id {
                warn!(request_id = %self.id, reply_id, "response id does not match request id");
                return Err(SigningError::Protocol(format!(
                    "response id {reply_id:?} does not match request id {:?}",
                    self.id
                )));
            }
        }
        debug!(request_id = %self.id, elapsed = ?self.started.elapsed(), "exchange settled");
        Ok(())
    }
}

/// Signing backend talking to a remote signer over a reused websocket.
///
/// Callers are fully serialized: the session lock is held from connection
/// setup through the parsed response, so exchanges never overlap on the wire.
pub struct SocketBackend {
    endpoint: Endpoint,
    response_timeout: Duration,
    connector: Box<dyn Connector>,
    session: Mutex<Session>,
    next_id: AtomicU64,
}

impl SocketBackend {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_connector(endpoint, WsConnector)
    }

    pub fn with_connector(endpoint: Endpoint, connector: impl Connector + 'static) -> Self {
        Self {
            endpoint,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connector: Box::new(connector),
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                connection: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bounds connect, handshake and response waits.
    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Drops the cached connection. The backend reconnects on next use.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if session.connection.is_some() {
            info!(endpoint = %self.endpoint, "closing signer connection");
        }
        discard(&mut session).await;
    }

    async fn exchange_with_retry(
        &self,
        session: &mut Session,
        request: &SigningRequest,
    ) -> Result<SignReply> {
        let mut attempt = 1;
        loop {
            match self.exchange(session, request).await {
                Err(error) if error.is_transport() => {
                    discard(session).await;
                    if attempt >= MAX_ATTEMPTS {
                        warn!(attempt, %error, "signer unreachable, giving up");
                        return Err(error);
                    }
                    warn!(attempt, %error, "transport failure, reconnecting");
                    attempt += 1;
                }
                Err(error @ SigningError::Timeout(_)) => {
                    // a late response would desync the next exchange
                    discard(session).await;
                    return Err(error);
                }
                other => return other,
            }
        }
    }

    async fn exchange(&self, session: &mut Session, request: &SigningRequest) -> Result<SignReply> {
        let mut connection = self.check_out(session).await?;

        let pending =
            PendingExchange::new(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());
        let message = protocol::encode_sign_request(&pending.id, request)?;

        debug!(request_id = %pending.id, "sending sign request");
        connection.send(message).await?;

        let text = match timeout(self.response_timeout, connection.recv()).await {
            Ok(received) => received?,
            Err(_) => {
                warn!(
                    request_id = %pending.id,
                    timeout = ?self.response_timeout,
                    "sign response timed out"
                );
                close_quietly(connection.as_mut()).await;
                return Err(SigningError::Timeout(self.response_timeout));
            }
        };
        debug!(request_id = %pending.id, len = text.len(), "received sign response");

        let reply = match protocol::parse_sign_response(&text) {
            Ok(reply) => reply,
            Err(error) => {
                // the response was consumed, the wire is still in step
                session.check_in(connection);
                return Err(error);
            }
        };
        if let Err(error) = pending.settle(&reply) {
            close_quietly(connection.as_mut()).await;
            return Err(error);
        }

        session.check_in(connection);
        Ok(reply)
    }

    /// Takes the cached connection out of the session, opening one if needed.
    async fn check_out(&self, session: &mut Session) -> Result<Box<dyn Connection>> {
        let cached = session.connection.take();
        let ready = session.state == ConnectionState::Ready;
        session.state = ConnectionState::Disconnected;

        match cached {
            Some(connection) if ready => Ok(connection),
            stale => {
                if let Some(mut connection) = stale {
                    close_quietly(connection.as_mut()).await;
                }
                let connection = self.open(session).await?;
                session.state = ConnectionState::Disconnected;
                Ok(connection)
            }
        }
    }

    async fn open(&self, session: &mut Session) -> Result<Box<dyn Connection>> {
        info!(endpoint = %self.endpoint, "connecting to signer");
        let mut connection = timeout(self.response_timeout, self.connector.connect(&self.endpoint))
            .await
            .map_err(|_| {
                SigningError::Connection(format!("timed out connecting to {}", self.endpoint))
            })??;

        session.state = ConnectionState::Handshaking;
        match self.handshake(connection.as_mut()).await {
            Ok(()) => {
                info!(endpoint = %self.endpoint, "signer handshake accepted");
                Ok(connection)
            }
            Err(error) => {
                session.state = ConnectionState::Disconnected;
                close_quietly(connection.as_mut()).await;
                Err(error)
            }
        }
    }

    async fn handshake(&self, connection: &mut dyn Connection) -> Result<()> {
        let text = match timeout(self.response_timeout, connection.recv()).await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                return Err(SigningError::Handshake(format!(
                    "connection dropped before handshake: {error}"
                )));
            }
            Err(_) => {
                return Err(SigningError::Handshake(format!(
                    "no handshake within {:?}",
                    self.response_timeout
                )));
            }
        };
        debug!(len = text.len(), "received handshake");
        protocol::check_handshake(&text)
    }

    #[cfg(test)]
    async fn state(&self) -> ConnectionState {
        self.session.lock().await.state
    }
}

#[async_trait]
impl SigningBackend for SocketBackend {
    fn name(&self) -> &str {
        "socket"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn sign(&self, request: &SigningRequest) -> Result<SigningResult> {
        let mut session = self.session.lock().await;
        let reply = self.exchange_with_retry(&mut session, request).await?;
        drop(session);

        match reply.certificate_number {
            Some(certificate_number) => SigningResult::new(reply.signature, certificate_number),
            None => {
                warn!(
                    signature_len = reply.signature.len(),
                    "signer returned a signature without certificate number"
                );
                Err(SigningError::Incomplete("certificate number"))
            }
        }
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

async fn discard(session: &mut Session) {
    session.state = ConnectionState::Disconnected;
    if let Some(mut connection) = session.connection.take() {
        close_quietly(connection.as_mut()).await;
    }
}

async fn close_quietly(connection: &mut dyn Connection) {
    match timeout(CLOSE_TIMEOUT, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "ignoring error while closing connection"),
        Err(_) => debug!("connection close timed out"),
    }
}
