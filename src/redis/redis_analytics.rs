use redis::AsyncCommands;

use crate::{AnalyticsRecord, AnalyticsStore, MeteringError, RedisClient, RedisPrefix, redis::RedisKeys};

/// [`AnalyticsStore`] writing one Redis hash per series.
///
/// A record lands in hash `analytics/<series>` under field `<point>` (see
/// [`AnalyticsRecord::series`] and [`AnalyticsRecord::point`]), so re-flushing overwrites it.
#[derive(Clone, Debug)]
pub struct RedisAnalyticsStore {
    client: RedisClient,
    keys: RedisKeys,
}

impl RedisAnalyticsStore {
    /// Create a sink over `client`, optionally namespaced by `prefix`.
    pub fn new(client: RedisClient, prefix: Option<RedisPrefix>) -> Self {
        Self {
            client,
            keys: RedisKeys::new(prefix),
        }
    }

    fn hash_key(&self, record: &AnalyticsRecord) -> String {
        self.keys.key(&format!("analytics/{}", record.series()))
    }

    /// Stored value of the series point `record` identifies. `record.value` is ignored.
    pub async fn value(&self, record: &AnalyticsRecord) -> Result<Option<i64>, MeteringError> {
        let mut connection_manager = self.client.get();

        let value: Option<i64> = connection_manager
            .hget(self.hash_key(record), record.point())
            .await?;

        Ok(value)
    }
}

impl AnalyticsStore for RedisAnalyticsStore {
    async fn upsert(&self, records: &[AnalyticsRecord]) -> Result<(), MeteringError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut connection_manager = self.client.get();
        let mut pipe = redis::pipe();

        for record in records {
            pipe.hset(self.hash_key(record), record.point(), record.value)
                .ignore();
        }

        let _: () = pipe.query_async(&mut connection_manager).await?;

        Ok(())
    }
}
