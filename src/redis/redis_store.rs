use std::str::FromStr;

use redis::{AsyncCommands, Script};

use crate::{
    AnalyticsMode, BucketId, CounterWrite, MeteringError, PrimaryStore, RedisClient, RedisPrefix,
    WriteBatch,
    keys::{
        ANALYTICS_MODE_KEY, CHANGED_BUCKETS_KEY, CHANGED_KEYS_PREFIX, FAILED_AT_LEAST_ONCE_KEY,
        FAILED_BUCKETS_KEY, changed_keys_key,
    },
    redis::RedisKeys,
};

const APPLY_SCRIPT: &str = r#"
    local mode_key = KEYS[1]
    local changed_buckets_key = KEYS[2]
    local changed_keys_key = KEYS[3]

    local bucket_id = ARGV[1]
    local bucket_score = ARGV[2]
    local write_count = tonumber(ARGV[3])

    local arg = 4
    for i = 1, write_count do
        local key = KEYS[3 + i]
        local op = ARGV[arg]
        local value = ARGV[arg + 1]
        local ttl = tonumber(ARGV[arg + 2])
        arg = arg + 3

        if op == "add" then
            redis.call("INCRBY", key, value)
            if ttl > 0 then
                redis.call("EXPIRE", key, ttl)
            end
        elseif op == "set" then
            if ttl > 0 then
                redis.call("SET", key, value, "EX", ttl)
            else
                redis.call("SET", key, value)
            end
        else
            redis.call("DEL", key)
        end
    end

    for i = 4 + write_count, #KEYS do
        redis.call("SADD", KEYS[i], ARGV[arg])
        arg = arg + 1
    end

    local mode = redis.call("GET", mode_key)
    if mode ~= "disabled" and write_count > 0 then
        for i = 1, write_count do
            redis.call("SADD", changed_keys_key, KEYS[3 + i])
        end
        redis.call("ZADD", changed_buckets_key, bucket_score, bucket_id)
    end

    return write_count
"#;

const CLAIM_SCRIPT: &str = r#"
    local changed_buckets_key = KEYS[1]
    local before_score = ARGV[1]
    local limit = tonumber(ARGV[2])

    local ids = redis.call("ZRANGE", changed_buckets_key, "-inf", "(" .. before_score, "BYSCORE", "LIMIT", 0, limit)

    for i = 1, #ids, 1000 do
        redis.call("ZREM", changed_buckets_key, unpack(ids, i, math.min(i + 999, #ids)))
    end

    return ids
"#;

const COMPLETE_SCRIPT: &str = r#"
    local changed_keys_key = KEYS[1]
    local changed_buckets_key = KEYS[2]
    local failed_buckets_key = KEYS[3]

    local bucket_id = ARGV[1]
    local bucket_score = ARGV[2]

    for i = 3, #ARGV, 1000 do
        redis.call("SREM", changed_keys_key, unpack(ARGV, i, math.min(i + 999, #ARGV)))
    end

    -- keys recorded after the bucket was read stay pending
    if redis.call("SCARD", changed_keys_key) > 0 then
        redis.call("ZADD", changed_buckets_key, bucket_score, bucket_id)
    end

    redis.call("SREM", failed_buckets_key, bucket_id)

    return 1
"#;

const PURGE_SCRIPT: &str = r#"
    local changed_buckets_key = KEYS[1]
    local failed_buckets_key = KEYS[2]
    local failed_at_least_once_key = KEYS[3]

    local changed_keys_prefix = ARGV[1]

    local ids = redis.call("ZRANGE", changed_buckets_key, 0, -1)
    for _, set_key in ipairs({failed_buckets_key, failed_at_least_once_key}) do
        for _, id in ipairs(redis.call("SMEMBERS", set_key)) do
            table.insert(ids, id)
        end
    end

    for _, id in ipairs(ids) do
        redis.call("DEL", changed_keys_prefix .. id)
    end

    redis.call("DEL", changed_buckets_key, failed_buckets_key, failed_at_least_once_key)

    return #ids
"#;

/// Configuration for [`RedisStore`].
#[derive(Clone, Debug)]
pub struct RedisStoreOptions {
    /// Connection pool.
    pub client: RedisClient,

    /// Optional namespace for every key.
    ///
    /// With `None` keys follow the `stats/{service:..}/..` scheme exactly. With a prefix `p`
    /// every key becomes `p:<key>`, which lets several independent deployments or test runs share
    /// one Redis.
    pub prefix: Option<RedisPrefix>,
}

/// [`PrimaryStore`] backed by Redis.
///
/// # Consistency Semantics
///
/// - **Atomic batches:** every [`WriteBatch`] is applied by one Lua script, together with the
///   analytics-mode check and the change-bucket bookkeeping
/// - **Exactly-once claims:** bucket claiming reads and removes pending entries in one script
/// - **Expiry:** short-lived counters use native Redis TTLs
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: RedisClient,
    keys: RedisKeys,
    apply_script: Script,
    claim_script: Script,
    complete_script: Script,
    purge_script: Script,
}

impl RedisStore {
    /// Create a store from `options`.
    pub fn new(options: RedisStoreOptions) -> Self {
        Self {
            client: options.client,
            keys: RedisKeys::new(options.prefix),
            apply_script: Script::new(APPLY_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            purge_script: Script::new(PURGE_SCRIPT),
        }
    }

    fn parse_buckets(&self, source: &str, ids: Vec<String>) -> Vec<BucketId> {
        let mut buckets: Vec<BucketId> = ids
            .into_iter()
            .filter_map(|id| match BucketId::from_str(&id) {
                Ok(bucket) => Some(bucket),
                Err(err) => {
                    tracing::warn!(source, id, error = ?err, "Skipping unparseable bucket id");
                    None
                }
            })
            .collect();

        buckets.sort();
        buckets
    }
}

impl PrimaryStore for RedisStore {
    async fn apply(&self, batch: &WriteBatch) -> Result<(), MeteringError> {
        let mut connection_manager = self.client.get();

        let mut invocation = self.apply_script.prepare_invoke();
        invocation
            .key(self.keys.key(ANALYTICS_MODE_KEY))
            .key(self.keys.key(CHANGED_BUCKETS_KEY))
            .key(self.keys.key(&changed_keys_key(&batch.bucket)))
            .arg(batch.bucket.to_string())
            .arg(batch.bucket.score())
            .arg(batch.writes.len());

        for write in &batch.writes {
            invocation.key(self.keys.key(write.key()));

            match write {
                CounterWrite::Add {
                    delta, ttl_seconds, ..
                } => invocation
                    .arg("add")
                    .arg(*delta)
                    .arg(ttl_seconds.unwrap_or(0)),
                CounterWrite::Set {
                    value, ttl_seconds, ..
                } => invocation
                    .arg("set")
                    .arg(*value)
                    .arg(ttl_seconds.unwrap_or(0)),
                CounterWrite::Delete { .. } => invocation.arg("del").arg(0).arg(0),
            };
        }

        for (set_key, member) in &batch.memberships {
            invocation.key(self.keys.key(set_key)).arg(member.as_str());
        }

        let _: i64 = invocation.invoke_async(&mut connection_manager).await?;

        Ok(())
    } // end method apply

    async fn values(&self, keys: &[String]) -> Result<Vec<Option<i64>>, MeteringError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection_manager = self.client.get();
        let redis_keys: Vec<String> = keys.iter().map(|k| self.keys.key(k)).collect();

        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut connection_manager)
            .await?;

        Ok(values)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, MeteringError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut connection_manager = self.client.get();
        let redis_keys: Vec<String> = keys.iter().map(|k| self.keys.key(k)).collect();

        let deleted: usize = connection_manager.del(&redis_keys).await?;

        Ok(deleted)
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, MeteringError> {
        let mut connection_manager = self.client.get();

        let mut members: Vec<String> = connection_manager.smembers(self.keys.key(set_key)).await?;
        members.sort();

        Ok(members)
    }

    async fn analytics_mode(&self) -> Result<AnalyticsMode, MeteringError> {
        let mut connection_manager = self.client.get();

        let mode: Option<String> = connection_manager
            .get(self.keys.key(ANALYTICS_MODE_KEY))
            .await?;

        match mode {
            None => Ok(AnalyticsMode::default()),
            Some(mode) => AnalyticsMode::from_str(&mode).map_err(MeteringError::Store),
        }
    }

    async fn set_analytics_mode(&self, mode: AnalyticsMode) -> Result<AnalyticsMode, MeteringError> {
        let mut connection_manager = self.client.get();

        let previous: Option<String> = redis::cmd("SET")
            .arg(self.keys.key(ANALYTICS_MODE_KEY))
            .arg(mode.as_str())
            .arg("GET")
            .query_async(&mut connection_manager)
            .await?;

        Ok(previous
            .and_then(|previous| AnalyticsMode::from_str(&previous).ok())
            .unwrap_or_default())
    }

    async fn pending_buckets(&self) -> Result<Vec<BucketId>, MeteringError> {
        let mut connection_manager = self.client.get();

        let ids: Vec<String> = connection_manager
            .zrange(self.keys.key(CHANGED_BUCKETS_KEY), 0, -1)
            .await?;

        Ok(self.parse_buckets(CHANGED_BUCKETS_KEY, ids))
    }

    async fn claim_buckets(
        &self,
        before: BucketId,
        limit: usize,
    ) -> Result<Vec<BucketId>, MeteringError> {
        let mut connection_manager = self.client.get();

        let ids: Vec<String> = self
            .claim_script
            .key(self.keys.key(CHANGED_BUCKETS_KEY))
            .arg(before.score())
            .arg(limit)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(self.parse_buckets(CHANGED_BUCKETS_KEY, ids))
    }

    async fn bucket_keys(&self, bucket: BucketId) -> Result<Vec<String>, MeteringError> {
        let mut connection_manager = self.client.get();

        let members: Vec<String> = connection_manager
            .smembers(self.keys.key(&changed_keys_key(&bucket)))
            .await?;

        let mut keys: Vec<String> = members.into_iter().map(|k| self.keys.logical(k)).collect();
        keys.sort();

        Ok(keys)
    }

    async fn complete_bucket(&self, bucket: BucketId, keys: &[String]) -> Result<(), MeteringError> {
        let mut connection_manager = self.client.get();

        let mut invocation = self.complete_script.prepare_invoke();
        invocation
            .key(self.keys.key(&changed_keys_key(&bucket)))
            .key(self.keys.key(CHANGED_BUCKETS_KEY))
            .key(self.keys.key(FAILED_BUCKETS_KEY))
            .arg(bucket.to_string())
            .arg(bucket.score());

        for key in keys {
            invocation.arg(self.keys.key(key));
        }

        let _: i64 = invocation.invoke_async(&mut connection_manager).await?;

        Ok(())
    } // end method complete_bucket

    async fn fail_bucket(&self, bucket: BucketId) -> Result<(), MeteringError> {
        let mut connection_manager = self.client.get();
        let id = bucket.to_string();

        let _: () = redis::pipe()
            .atomic()
            .sadd(self.keys.key(FAILED_BUCKETS_KEY), &id)
            .ignore()
            .sadd(self.keys.key(FAILED_AT_LEAST_ONCE_KEY), &id)
            .ignore()
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    }

    async fn failed_buckets(&self) -> Result<Vec<BucketId>, MeteringError> {
        let mut connection_manager = self.client.get();

        let ids: Vec<String> = connection_manager
            .smembers(self.keys.key(FAILED_BUCKETS_KEY))
            .await?;

        Ok(self.parse_buckets(FAILED_BUCKETS_KEY, ids))
    }

    async fn failed_at_least_once(&self) -> Result<Vec<BucketId>, MeteringError> {
        let mut connection_manager = self.client.get();

        let ids: Vec<String> = connection_manager
            .smembers(self.keys.key(FAILED_AT_LEAST_ONCE_KEY))
            .await?;

        Ok(self.parse_buckets(FAILED_AT_LEAST_ONCE_KEY, ids))
    }

    async fn purge_buckets(&self) -> Result<(), MeteringError> {
        let mut connection_manager = self.client.get();

        let changed_keys_prefix = self.keys.key(CHANGED_KEYS_PREFIX);

        let purged: i64 = self
            .purge_script
            .key(self.keys.key(CHANGED_BUCKETS_KEY))
            .key(self.keys.key(FAILED_BUCKETS_KEY))
            .key(self.keys.key(FAILED_AT_LEAST_ONCE_KEY))
            .arg(changed_keys_prefix)
            .invoke_async(&mut connection_manager)
            .await?;

        tracing::debug!(purged, "redis.purge_buckets");

        Ok(())
    }

    async fn requeue_bucket(&self, bucket: BucketId) -> Result<(), MeteringError> {
        let mut connection_manager = self.client.get();

        let _: i64 = connection_manager
            .zadd(
                self.keys.key(CHANGED_BUCKETS_KEY),
                bucket.to_string(),
                bucket.score(),
            )
            .await?;

        Ok(())
    }
}
