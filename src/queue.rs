//! Queue operations over a Redis-like key-value backend.
//!
//! Each registered topic maps to exactly one backend key. Two storage shapes
//! are supported:
//!
//! - **FIFO**: a list at the topic key. Producers `LPUSH`, consumers `BRPOP`,
//!   so delivery order is insertion order.
//! - **Delay**: a sorted set at the topic key, member = payload and
//!   score = eligibility time (Unix epoch seconds). A message becomes
//!   consumable once its score is at or before the current wall clock.
//!
//! Dequeue on a delay topic uses delete-to-claim: a candidate is read with
//! `ZRANGEBYSCORE ... LIMIT 0 1` and then removed by value; only the caller
//! whose removal succeeds owns the payload. This gives at-most-one dispatch
//! across concurrent workers without a distributed lock, at the cost of an
//! occasional wasted read.
//!
//! # Reconnection
//!
//! Connections are opened lazily and owned per process; they are never shared
//! across a fork. Every operation retries once through a fresh connection on
//! a connection-level failure. If the fresh connection cannot even answer a
//! `PING`, the error is surfaced to the caller as [`QueueError::Unreachable`].

use std::time::Duration;

use redis::{Commands, Connection};
use thiserror::Error;
use tracing::{debug, warn};

/// Socket timeout applied when establishing a connection, and to reads and
/// writes on the established connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to open a connection to the backend.
    #[error("backend connection failed: {0}")]
    ConnectionFailed(String),

    /// The backend stayed unreachable after a reconnect attempt.
    #[error("backend unreachable after reconnect: {0}")]
    Unreachable(String),

    /// A backend command failed for a non-connection reason.
    #[error("backend command failed: {0}")]
    Command(#[from] redis::RedisError),
}

/// Storage shape of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Immediate work: list semantics, strict insertion order.
    Fifo,
    /// Scheduled work: sorted-set semantics, eligibility-time order.
    Delay,
}

/// Backend connection parameters for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Backend host name or address.
    pub host: String,
    /// Backend TCP port.
    pub port: u16,
    /// Database index selected after connecting.
    pub db: i64,
    /// Optional password sent on connect.
    pub password: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration for the given host and port with database 0
    /// and no authentication.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the database index.
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Sets the authentication password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Renders the connection URL understood by the backend client.
    fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Queue access for a single topic.
///
/// The handle is cheap to construct: no connection is opened until the first
/// operation runs. Masters and workers each construct their own handle; a
/// handle must never be carried across a fork (see
/// [`TopicQueue::disconnect`]).
pub struct TopicQueue {
    kind: QueueKind,
    config: QueueConfig,
    conn: Option<Connection>,
}

impl TopicQueue {
    /// Creates a disconnected queue handle.
    pub fn new(kind: QueueKind, config: QueueConfig) -> Self {
        Self {
            kind,
            config,
            conn: None,
        }
    }

    /// Returns the storage shape this handle operates on.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Drops the current connection, if any.
    ///
    /// Called in a freshly forked worker so the socket inherited from the
    /// parent is never written to by two processes.
    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    /// Enqueues a payload.
    ///
    /// For FIFO topics the payload is pushed to the head of the list and
    /// `eligible_at` is ignored. For delay topics the payload is added to the
    /// sorted set with `eligible_at` (epoch seconds) as its score.
    pub fn deliver(
        &mut self,
        topic: &str,
        payload: &str,
        eligible_at: i64,
    ) -> Result<(), QueueError> {
        match self.kind {
            QueueKind::Fifo => self.with_conn(|conn| conn.lpush(topic, payload)),
            QueueKind::Delay => self.with_conn(|conn| conn.zadd(topic, payload, eligible_at)),
        }
    }

    /// Removes a not-yet-consumed payload from a delay topic.
    ///
    /// Returns `true` if the payload was present and removed. FIFO topics do
    /// not support revocation; the call returns `false` without touching the
    /// backend.
    pub fn revoke(&mut self, topic: &str, payload: &str) -> Result<bool, QueueError> {
        if self.kind != QueueKind::Delay {
            return Ok(false);
        }
        let removed: i64 = self.with_conn(|conn| conn.zrem(topic, payload))?;
        Ok(removed > 0)
    }

    /// Dequeues one payload, waiting up to `timeout`.
    ///
    /// FIFO topics block server-side via `BRPOP`; a nil reply after the
    /// timeout yields `None`. Delay topics read the single oldest member with
    /// an eligibility time at or before now and claim it by removal; when the
    /// claim is lost to a concurrent worker, or no member is eligible, the
    /// call sleeps out the timeout client-side and yields `None`.
    pub fn pop(&mut self, topic: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        match self.kind {
            QueueKind::Fifo => {
                let reply: Option<(String, String)> = self.with_conn(|conn| {
                    redis::cmd("BRPOP")
                        .arg(topic)
                        .arg(timeout.as_secs().max(1))
                        .query(conn)
                })?;
                Ok(reply.map(|(_, payload)| payload))
            }
            QueueKind::Delay => {
                let now = chrono::Utc::now().timestamp();
                let candidates: Vec<String> =
                    self.with_conn(|conn| conn.zrangebyscore_limit(topic, 0, now, 0, 1))?;
                match candidates.into_iter().next() {
                    Some(payload) => {
                        // Claim by removal; losing the race is not an error.
                        let removed: i64 = self.with_conn(|conn| conn.zrem(topic, &payload))?;
                        if removed > 0 {
                            Ok(Some(payload))
                        } else {
                            debug!(topic, "delay claim lost to concurrent worker");
                            Ok(None)
                        }
                    }
                    None => {
                        std::thread::sleep(timeout);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Returns the consumable backlog of the topic.
    ///
    /// FIFO topics report the list length. Delay topics report only the
    /// members eligible now; future-dated messages are not work that a
    /// worker could pick up, so they do not count.
    pub fn size(&mut self, topic: &str) -> Result<u64, QueueError> {
        match self.kind {
            QueueKind::Fifo => self.with_conn(|conn| conn.llen(topic)),
            QueueKind::Delay => {
                let now = chrono::Utc::now().timestamp();
                self.with_conn(|conn| conn.zcount(topic, 0, now))
            }
        }
    }

    /// Runs `op`, connecting first if needed and retrying once through a
    /// fresh connection when the failure is connection-level.
    fn with_conn<T>(
        &mut self,
        op: impl Fn(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, QueueError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };

        match op(&mut conn) {
            Ok(value) => {
                self.conn = Some(conn);
                Ok(value)
            }
            Err(err) if is_connection_error(&err) => {
                warn!(error = %err, "backend connection lost, reconnecting");
                drop(conn);
                let mut fresh = self.connect()?;
                redis::cmd("PING")
                    .query::<String>(&mut fresh)
                    .map_err(|probe| QueueError::Unreachable(probe.to_string()))?;
                let value = op(&mut fresh)?;
                self.conn = Some(fresh);
                Ok(value)
            }
            Err(err) => Err(QueueError::Command(err)),
        }
    }

    /// Opens a connection with the configured timeout, database and
    /// credentials.
    fn connect(&self) -> Result<Connection, QueueError> {
        let client = redis::Client::open(self.config.url())
            .map_err(|err| QueueError::ConnectionFailed(err.to_string()))?;
        let conn = client
            .get_connection_with_timeout(CONNECT_TIMEOUT)
            .map_err(|err| QueueError::ConnectionFailed(err.to_string()))?;
        conn.set_read_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|err| QueueError::ConnectionFailed(err.to_string()))?;
        conn.set_write_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|err| QueueError::ConnectionFailed(err.to_string()))?;
        debug!(
            host = %self.config.host,
            port = self.config.port,
            db = self.config.db,
            "connected to queue backend"
        );
        Ok(conn)
    }
}

/// Whether a command failure means the connection itself is gone.
fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_connection_refusal() || err.is_io_error() || err.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.db, 0);
        assert!(config.password.is_none());
    }

    #[test]
    fn config_builder() {
        let config = QueueConfig::new("queue.internal", 6380)
            .with_db(3)
            .with_password("hunter2");
        assert_eq!(config.host, "queue.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.db, 3);
        assert_eq!(config.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn config_url_shapes() {
        let plain = QueueConfig::new("localhost", 6379).with_db(2);
        assert_eq!(plain.url(), "redis://localhost:6379/2");

        let authed = QueueConfig::new("localhost", 6379).with_password("secret");
        assert_eq!(authed.url(), "redis://:secret@localhost:6379/0");
    }

    #[test]
    fn revoke_is_rejected_for_fifo_without_backend() {
        // A FIFO handle never opens a connection for revoke, so this must
        // succeed even though nothing is listening on the configured port.
        let mut queue = TopicQueue::new(QueueKind::Fifo, QueueConfig::new("127.0.0.1", 1));
        let revoked = queue.revoke("orders", "payload").expect("no backend access");
        assert!(!revoked);
    }

    #[test]
    fn handles_start_disconnected() {
        let queue = TopicQueue::new(QueueKind::Delay, QueueConfig::default());
        assert!(queue.conn.is_none());
        assert_eq!(queue.kind(), QueueKind::Delay);
    }

    #[test]
    fn error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = QueueError::Unreachable("ping timed out".to_string());
        assert!(err.to_string().contains("reconnect"));
    }
}
