//! Round lease: serializes orchestration rounds across processes.
//!
//! `dequeue_page` does not claim entries, so two overlapping rounds would
//! segment the same users. Every round runs under a single Redis lease keyed
//! on the orchestration, held by the run id. Follow-up rounds of the same run
//! re-acquire (and extend) their own lease, and long loops refresh it per item
//! through a [`LeaseGuard`] so the TTL only has to cover one item.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::pipeline::errors::{PipelineError, PipelineResult};

const LEASE_KEY: &str = "adgen:orchestration:lease";

const ACQUIRE_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if not holder then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[async_trait]
pub trait RoundLease: Send + Sync {
    /// True when `run_id` now holds the lease.
    async fn acquire(&self, run_id: &str, ttl: Duration) -> PipelineResult<bool>;

    /// Releases the lease if `run_id` still holds it.
    async fn release(&self, run_id: &str) -> PipelineResult<()>;
}

/// The lease as held by one run, for refreshing from inside a round.
#[derive(Clone, Copy)]
pub struct LeaseGuard<'a> {
    lease: &'a dyn RoundLease,
    run_id: &'a str,
    ttl: Duration,
}

impl<'a> LeaseGuard<'a> {
    pub fn new(lease: &'a dyn RoundLease, run_id: &'a str, ttl: Duration) -> Self {
        Self { lease, run_id, ttl }
    }

    /// Re-acquires (and extends) the lease. Fails with `ConcurrencyConflict`
    /// when another run holds it.
    pub async fn refresh(&self) -> PipelineResult<()> {
        if self.lease.acquire(self.run_id, self.ttl).await? {
            Ok(())
        } else {
            warn!("Run {}: another round holds the lease", self.run_id);
            Err(PipelineError::ConcurrencyConflict(format!(
                "run {} does not hold the round lease",
                self.run_id
            )))
        }
    }
}

#[derive(Clone)]
pub struct RedisLease {
    manager: ConnectionManager,
}

impl RedisLease {
    pub async fn connect(client: redis::Client) -> PipelineResult<Self> {
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl RoundLease for RedisLease {
    async fn acquire(&self, run_id: &str, ttl: Duration) -> PipelineResult<bool> {
        let mut conn = self.manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired: i32 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(LEASE_KEY)
            .arg(run_id)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        if acquired == 1 {
            debug!("Run {run_id} holds the orchestration lease for {ttl_ms}ms");
        } else {
            warn!("Run {run_id} could not acquire the orchestration lease");
        }
        Ok(acquired == 1)
    }

    async fn release(&self, run_id: &str) -> PipelineResult<()> {
        let mut conn = self.manager.clone();
        let _: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(LEASE_KEY)
            .arg(run_id)
            .invoke_async(&mut conn)
            .await?;
        debug!("Run {run_id} released the orchestration lease");
        Ok(())
    }
}
