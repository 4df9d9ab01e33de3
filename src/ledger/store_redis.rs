//! Redis-backed budget store for multi-instance deployments.
//!
//! The conditional increment runs as a Lua script, so the read-check-commit
//! executes atomically on the Redis server regardless of how many gateway
//! instances share the counters.

use std::time::Duration;

use redis::aio::ConnectionManager;

use super::store::{BudgetStore, StoreReservation};
use super::{LedgerError, LedgerResult};

const RESERVE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
local ceiling = tonumber(ARGV[2])
local would_be = current + amount
if would_be > ceiling then
    return {0, current, would_be}
end
redis.call('SET', KEYS[1], would_be, 'EX', tonumber(ARGV[3]))
return {1, would_be, would_be}
"#;

#[derive(Clone, Debug)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
    /// TTL applied to period counters on every write; stale periods age out
    /// on their own once they can no longer receive reservations.
    pub retention: Duration,
    pub connection_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "finops:budget:".to_string(),
            retention: Duration::from_secs(62 * 86_400),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl RedisStoreConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> LedgerResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(LedgerError::StorageUnavailable {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

pub struct RedisBudgetStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    reserve: redis::Script,
}

impl RedisBudgetStore {
    pub async fn connect(redis_url: &str) -> LedgerResult<Self> {
        Self::connect_with_config(redis_url, RedisStoreConfig::default()).await
    }

    pub async fn connect_with_config(
        redis_url: &str,
        config: RedisStoreConfig,
    ) -> LedgerResult<Self> {
        let client = redis::Client::open(redis_url).map_err(storage_err)?;
        let connection = tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| LedgerError::StorageUnavailable {
            message: format!(
                "Redis connection timed out after {:?}",
                config.connection_timeout
            ),
        })?
        .map_err(storage_err)?;

        Ok(Self {
            connection,
            config,
            reserve: redis::Script::new(RESERVE_SCRIPT),
        })
    }

    fn key(&self, org_id: &str, period_key: &str) -> String {
        format!("{}{}:{}", self.config.key_prefix, org_id, period_key)
    }
}

fn storage_err(e: redis::RedisError) -> LedgerError {
    LedgerError::StorageUnavailable {
        message: e.to_string(),
    }
}

#[async_trait::async_trait]
impl BudgetStore for RedisBudgetStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn spent_micros(&self, org_id: &str, period_key: &str) -> LedgerResult<u64> {
        let mut conn = self.connection.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(self.key(org_id, period_key))
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(value.unwrap_or(0))
    }

    async fn try_add_micros(
        &self,
        org_id: &str,
        period_key: &str,
        amount_micros: u64,
        ceiling_micros: u64,
    ) -> LedgerResult<StoreReservation> {
        let mut conn = self.connection.clone();
        let reply: Vec<u64> = self
            .reserve
            .key(self.key(org_id, period_key))
            .arg(amount_micros)
            .arg(ceiling_micros)
            .arg(self.config.retention.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        match reply.as_slice() {
            [accepted, total, would_be] => Ok(StoreReservation {
                accepted: *accepted == 1,
                total_micros: *total,
                would_be_micros: *would_be,
            }),
            other => Err(LedgerError::StorageUnavailable {
                message: format!("Unexpected reserve script reply: {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_validation() {
        assert!(RedisStoreConfig::default().prefix("finops:budget:").is_ok());
        assert!(RedisStoreConfig::default().prefix("bad prefix!").is_err());
    }

    #[test]
    fn test_key_layout() {
        let config = RedisStoreConfig::default();
        // Key shape is part of the operational contract; changing it orphans counters.
        assert_eq!(config.key_prefix, "finops:budget:");
    }
}
