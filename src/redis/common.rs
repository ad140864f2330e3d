use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use redis::{Client, aio::ConnectionManager};

use crate::MeteringError;

/// Connections shared by [`RedisStore`](crate::RedisStore) and
/// [`RedisAnalyticsStore`](crate::RedisAnalyticsStore).
///
/// Request workers and flush rounds issue many small commands concurrently; each command takes
/// the next [`ConnectionManager`] in turn so that a slow flush script does not stall the hot
/// path behind it on the same pipelined connection. Clones share the connections.
pub struct RedisClient {
    connections: Arc<Vec<ConnectionManager>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("connections", &self.connections.len())
            .field("next", &self.next)
            .finish()
    }
}

impl RedisClient {
    /// Open `connection_count` managed connections from `client`.
    ///
    /// Metering and flushing from one process usually want at least two: one mostly busy with
    /// counter batches, one with bucket claims and reads.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, MeteringError> {
        if connection_count == 0 {
            return Err(MeteringError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connections = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connections.push(client.get_connection_manager().await?);
        }

        tracing::debug!(connection_count, "redis.client_connected");

        Ok(Self {
            connections: Arc::new(connections),
            next: AtomicUsize::new(0),
        })
    }

    /// Use an already connected manager for every command.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connections: Arc::new(vec![connection_manager]),
            next: AtomicUsize::new(0),
        }
    }

    /// Number of connections commands are spread over.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn get(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.connections[index % self.connections.len()].clone()
    } // end method get
} // end impl RedisClient

impl Clone for RedisClient {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            next: AtomicUsize::new(0),
        }
    }
}

/// A validated namespace prepended to every Redis key as `<prefix>:`.
///
/// - Must not be empty
/// - Must not be longer than 64 bytes
/// - Must not contain `:`, `{` or `}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedisPrefix(Arc<str>);

impl RedisPrefix {
    pub(crate) fn apply(&self, key: &str) -> String {
        format!("{}:{key}", self.0)
    }

    pub(crate) fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&*self.0)?.strip_prefix(':')
    }
}

impl Deref for RedisPrefix {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for RedisPrefix {
    type Error = MeteringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(MeteringError::InvalidRedisPrefix(
                "Redis prefix must not be empty".to_string(),
            ))
        } else if value.len() > 64 {
            Err(MeteringError::InvalidRedisPrefix(
                "Redis prefix must not be longer than 64 characters".to_string(),
            ))
        } else if value.contains([':', '{', '}']) {
            Err(MeteringError::InvalidRedisPrefix(
                "Redis prefix must not contain ':', '{' or '}'".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

/// Maps logical keys to Redis keys, honouring an optional [`RedisPrefix`].
#[derive(Debug, Clone, Default)]
pub(crate) struct RedisKeys {
    prefix: Option<RedisPrefix>,
}

impl RedisKeys {
    pub(crate) fn new(prefix: Option<RedisPrefix>) -> Self {
        Self { prefix }
    }

    pub(crate) fn key(&self, logical: &str) -> String {
        match &self.prefix {
            Some(prefix) => prefix.apply(logical),
            None => logical.to_string(),
        }
    }

    pub(crate) fn logical(&self, key: String) -> String {
        if let Some(stripped) = self.prefix.as_ref().and_then(|p| p.strip(&key)) {
            return stripped.to_string();
        }

        key
    }
}
