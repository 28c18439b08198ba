//! Connection manager.
//!
//! [`RedisConnector`] exclusively owns the Redis session. Everyone else sees
//! the connection through a read-only [`ConnectionState`] snapshot published
//! on a `watch` channel.

use crate::backoff::{retry_with_backoff, Backoff, Sleeper, TokioSleeper};
use crate::error::ConnectionError;
use async_trait::async_trait;
use core_config::redis::RedisConfig;
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the worker's Redis connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Opens sessions against a Redis endpoint.
#[async_trait]
pub trait Dial: Send + Sync {
    type Session: Send + Sync;

    /// Open and verify a new session
    async fn dial(&self) -> Result<Self::Session, ConnectionError>;

    /// One liveness round trip on an existing session
    async fn ping(&self, session: &mut Self::Session) -> Result<(), ConnectionError>;

    /// Endpoint description safe for logs
    fn endpoint(&self) -> String;
}

/// Real dialer backed by the `redis` client
#[derive(Clone)]
pub struct RedisDialer {
    client: Client,
    endpoint: String,
    timeout: Duration,
    response_timeout: Duration,
}

impl RedisDialer {
    /// Build a dialer from config. Fails only if the URL is malformed.
    pub fn new(config: &RedisConfig) -> Result<Self, ConnectionError> {
        let client = Client::open(config.url())?;

        Ok(Self {
            client,
            endpoint: config.redacted_url(),
            timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
        })
    }

    /// Bound for a single dial or PING round trip
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound for any reply on an established session. Must exceed the
    /// longest blocking fetch.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dial for RedisDialer {
    type Session = MultiplexedConnection;

    async fn dial(&self) -> Result<MultiplexedConnection, ConnectionError> {
        // AUTH and SELECT run as part of the handshake, so bad credentials or
        // a refused database index fail here.
        let mut session = tokio::time::timeout(
            self.timeout,
            self.client.get_multiplexed_async_connection_with_config(
                &AsyncConnectionConfig::new().set_response_timeout(Some(self.response_timeout)),
            ),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(self.timeout))??;

        self.ping(&mut session).await?;
        Ok(session)
    }

    async fn ping(&self, session: &mut MultiplexedConnection) -> Result<(), ConnectionError> {
        let reply: String = tokio::time::timeout(
            self.timeout,
            redis::cmd("PING").query_async::<String>(session),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(self.timeout))??;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(ConnectionError::UnexpectedReply(reply))
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// Owns the worker's Redis session and its lifecycle.
pub struct RedisConnector<D: Dial> {
    dialer: D,
    session: Option<D::Session>,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl<D: Dial> RedisConnector<D> {
    /// Create a connector in the `Disconnected` state. Nothing is dialed yet.
    pub fn new(dialer: D, backoff: Backoff) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            dialer,
            session: None,
            state,
            backoff,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used between reconnect attempts
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only view of the connection state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Single dial attempt, no retries.
    pub async fn connect(&mut self) -> Result<&mut D::Session, ConnectionError> {
        self.session = None;
        let session = self.dial_once().await?;
        self.mark_connected(session)
    }

    /// The current session, if any. Never dials.
    pub fn session(&mut self) -> Option<&mut D::Session> {
        self.session.as_mut()
    }

    /// Return the live session, reconnecting with backoff if needed.
    ///
    /// Idempotent while `Connected`. When the retry budget runs out the
    /// result is [`ConnectionError::Exhausted`] and the state stays `Failed`.
    pub async fn ensure_connected(&mut self) -> Result<&mut D::Session, ConnectionError> {
        if self.session.is_none() {
            let this: &Self = self;
            let session = retry_with_backoff(&this.backoff, this.sleeper.as_ref(), move || {
                this.dial_once()
            })
            .await;

            match session {
                Ok(session) => return self.mark_connected(session),
                Err(exhausted) => {
                    error!(
                        endpoint = %self.dialer.endpoint(),
                        attempts = exhausted.attempts,
                        error = %exhausted.last,
                        "Could not connect to Redis"
                    );
                    return Err(ConnectionError::Exhausted {
                        attempts: exhausted.attempts,
                        last: Box::new(exhausted.last),
                    });
                }
            }
        }

        self.session
            .as_mut()
            .ok_or_else(|| ConnectionError::Unavailable("no session".to_string()))
    }

    /// Liveness round trip on the current session.
    ///
    /// Never fails: any error (or having no session) yields `false`, and a
    /// failed round trip marks the connection `Failed`.
    pub async fn ping(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        match self.dialer.ping(session).await {
            Ok(()) => true,
            Err(e) => {
                self.invalidate(&e.to_string());
                false
            }
        }
    }

    /// Drop a session that is known to be broken. The next
    /// [`ensure_connected`](Self::ensure_connected) re-dials.
    pub fn invalidate(&mut self, reason: &str) {
        if self.session.take().is_some() {
            warn!(endpoint = %self.dialer.endpoint(), reason = %reason, "Redis connection lost");
        }
        self.state.send_replace(ConnectionState::Failed);
    }

    /// Close the session on shutdown
    pub fn disconnect(&mut self) {
        if self.session.take().is_some() {
            info!(endpoint = %self.dialer.endpoint(), "Disconnected from Redis");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn dial_once(&self) -> Result<D::Session, ConnectionError> {
        self.state.send_replace(ConnectionState::Connecting);
        debug!(endpoint = %self.dialer.endpoint(), "Connecting to Redis");

        match self.dialer.dial().await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.state.send_replace(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn mark_connected(&mut self, session: D::Session) -> Result<&mut D::Session, ConnectionError> {
        self.state.send_replace(ConnectionState::Connected);
        info!(endpoint = %self.dialer.endpoint(), "Connected to Redis");
        Ok(self.session.insert(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RecordingSleeper;
    use crate::test_support::FakeDial;

    fn connector(dial: FakeDial) -> (RedisConnector<FakeDial>, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let connector = RedisConnector::new(dial, Backoff::default()).with_sleeper(sleeper.clone());
        (connector, sleeper)
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let (connector, _) = connector(FakeDial::reachable());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_then_ping_reachable() {
        let dial = FakeDial::reachable();
        let (mut connector, _) = connector(dial.clone());

        connector.connect().await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Connected);
        assert!(connector.ping().await);
    }

    #[tokio::test]
    async fn test_ping_false_when_unreachable() {
        let dial = FakeDial::reachable();
        let (mut connector, _) = connector(dial.clone());

        // No session yet
        assert!(!connector.ping().await);

        connector.connect().await.unwrap();
        dial.set_up(false);

        assert!(!connector.ping().await);
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_single_attempt_failure() {
        let dial = FakeDial::unreachable();
        let (mut connector, sleeper) = connector(dial.clone());

        let err = connector.connect().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(dial.dials(), 1);
        assert!(sleeper.slept().is_empty());
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let dial = FakeDial::reachable();
        let (mut connector, _) = connector(dial.clone());

        connector.ensure_connected().await.unwrap();
        connector.ensure_connected().await.unwrap();
        connector.ensure_connected().await.unwrap();

        assert_eq!(dial.dials(), 1);
    }

    #[tokio::test]
    async fn test_ensure_connected_exhausts_with_backoff() {
        let dial = FakeDial::unreachable();
        let (mut connector, sleeper) = connector(dial.clone());

        let err = connector.ensure_connected().await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(dial.dials(), 4);
        assert_eq!(
            sleeper.slept(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_reconnects_after_invalidate() {
        let dial = FakeDial::reachable();
        let (mut connector, _) = connector(dial.clone());
        let states = connector.subscribe();

        connector.ensure_connected().await.unwrap();
        connector.invalidate("connection reset");
        assert_eq!(*states.borrow(), ConnectionState::Failed);

        connector.ensure_connected().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Connected);
        assert_eq!(dial.dials(), 2);
    }

    #[tokio::test]
    async fn test_session_never_dials() {
        let dial = FakeDial::reachable();
        let (mut connector, sleeper) = connector(dial.clone());

        assert!(connector.session().is_none());
        connector.ensure_connected().await.unwrap();
        assert!(connector.session().is_some());

        connector.invalidate("connection reset");
        assert!(connector.session().is_none());
        assert_eq!(dial.dials(), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_when_network_returns_mid_backoff() {
        let dial = FakeDial::unreachable().up_after(2);
        let (mut connector, sleeper) = connector(dial.clone());

        connector.ensure_connected().await.unwrap();

        assert_eq!(dial.dials(), 3);
        assert_eq!(sleeper.slept().len(), 2);
        assert_eq!(connector.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (mut connector, _) = connector(FakeDial::reachable());
        connector.connect().await.unwrap();
        connector.disconnect();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_redis_dialer_redacts_password() {
        let config = RedisConfig::new("localhost", 6379, 0).with_password("secret");
        let dialer = RedisDialer::new(&config).unwrap();
        assert_eq!(dialer.endpoint(), "redis://:***@localhost:6379/0");
    }

    #[tokio::test]
    async fn test_redis_dialer_unreachable_never_panics() {
        // Port 1 on loopback is not a Redis server; the dial must fail cleanly.
        let config = RedisConfig::new("127.0.0.1", 1, 0);
        let dialer = RedisDialer::new(&config)
            .unwrap()
            .with_timeout(Duration::from_millis(500));
        let sleeper = Arc::new(RecordingSleeper::new());
        let mut connector = RedisConnector::new(dialer, Backoff::default()).with_sleeper(sleeper.clone());

        assert!(connector.connect().await.is_err());
        assert!(!connector.ping().await);
        assert_eq!(connector.state(), ConnectionState::Failed);
    }
}
