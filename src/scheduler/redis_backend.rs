//! Redis-backed scheduler.
//!
//! Keys (all under the configured prefix):
//! - `{prefix}:jobs` - hash of job id -> serialized `DeliveryJob`
//! - `{prefix}:scheduled` - sorted set of job ids scored by due time (ms)
//! - `{prefix}:processing` - sorted set of claimed job ids scored by
//!   visibility deadline (ms)
//!
//! Claiming runs as one Lua script so concurrent pollers across processes
//! never receive the same job inside its visibility window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use uuid::Uuid;

use crate::infrastructure::redis::RedisPool;
use crate::metrics::SchedulerMetrics;

use super::{run_at, DeliveryJob, JobHandle, JobScheduler, SchedulerError};

/// KEYS: scheduled, processing, jobs. ARGV: now_ms, limit, deadline_ms.
/// Returns a flat `[id, body, id, body, ...]` list.
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('ZADD', KEYS[1], ARGV[1], id)
end

local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local claimed = {}
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[1], id)
    local body = redis.call('HGET', KEYS[3], id)
    if body then
        redis.call('ZADD', KEYS[2], ARGV[3], id)
        table.insert(claimed, id)
        table.insert(claimed, body)
    end
end
return claimed
"#;

pub struct RedisJobScheduler {
    pool: Arc<RedisPool>,
    jobs_key: String,
    scheduled_key: String,
    processing_key: String,
    visibility_timeout: Duration,
    claim_script: Script,
}

impl RedisJobScheduler {
    pub fn new(pool: Arc<RedisPool>, prefix: String, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            jobs_key: format!("{prefix}:jobs"),
            scheduled_key: format!("{prefix}:scheduled"),
            processing_key: format!("{prefix}:processing"),
            visibility_timeout,
            claim_script: Script::new(CLAIM_SCRIPT),
        }
    }

    /// Drops a job from every scheduler key.
    async fn remove(&self, id: &str) -> Result<(), SchedulerError> {
        let _: () = self
            .pool
            .execute("scheduler_remove", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zrem(&self.scheduled_key, id)
                    .ignore()
                    .zrem(&self.processing_key, id)
                    .ignore()
                    .hdel(&self.jobs_key, id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }
}

/// Splits the claim script's `[id, body, ...]` reply into decoded jobs and
/// the ids whose bodies could not be decoded.
fn decode_claimed(claimed: Vec<String>) -> (Vec<DeliveryJob>, Vec<String>) {
    let mut jobs = Vec::with_capacity(claimed.len() / 2);
    let mut undecodable = Vec::new();
    let mut pairs = claimed.into_iter();
    while let (Some(id), Some(body)) = (pairs.next(), pairs.next()) {
        match serde_json::from_str::<DeliveryJob>(&body) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                tracing::warn!(
                    job_id = %id,
                    error = %e,
                    "Purging undecodable job in Redis scheduler"
                );
                undecodable.push(id);
            }
        }
    }
    (jobs, undecodable)
}

#[async_trait]
impl JobScheduler for RedisJobScheduler {
    async fn submit(&self, job: DeliveryJob, delay: Duration) -> Result<JobHandle, SchedulerError> {
        let run_at = run_at(Utc::now(), delay);
        let job_id = job.job_id.to_string();
        let body = serde_json::to_string(&job)?;

        let _: () = self
            .pool
            .execute("scheduler_submit", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .hset(&self.jobs_key, &job_id, &body)
                    .ignore()
                    .zrem(&self.processing_key, &job_id)
                    .ignore()
                    .zadd(&self.scheduled_key, &job_id, run_at.timestamp_millis())
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        tracing::trace!(
            job_id = %job.job_id,
            delivery_id = %job.delivery_id,
            run_at = %run_at,
            "Job scheduled in Redis"
        );

        Ok(JobHandle {
            job_id: job.job_id,
            run_at,
        })
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>, SchedulerError> {
        let now_ms = now.timestamp_millis();
        let deadline_ms = now_ms + self.visibility_timeout.as_millis() as i64;

        let claimed: Vec<String> = self
            .pool
            .execute("scheduler_claim", |mut conn| async move {
                self.claim_script
                    .key(&self.scheduled_key)
                    .key(&self.processing_key)
                    .key(&self.jobs_key)
                    .arg(now_ms)
                    .arg(limit)
                    .arg(deadline_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let (jobs, undecodable) = decode_claimed(claimed);
        for id in undecodable {
            if let Err(e) = self.remove(&id).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to purge undecodable job");
            }
        }

        Ok(jobs)
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        self.remove(&job_id.to_string()).await
    }

    async fn pending(&self) -> Result<usize, SchedulerError> {
        let count: usize = self
            .pool
            .execute("scheduler_pending", |mut conn| async move {
                redis::cmd("HLEN")
                    .arg(&self.jobs_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        SchedulerMetrics::set_pending(count);
        Ok(count)
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::infrastructure::redis::RedisHealth;
    use crate::infrastructure::CircuitBreaker;
    use crate::scheduler::test_job;

    #[test]
    fn test_key_layout() {
        let pool = RedisPool::new(
            &RedisConfig::default(),
            Arc::new(CircuitBreaker::new("redis")),
            Arc::new(RedisHealth::new()),
        )
        .unwrap();
        let scheduler = RedisJobScheduler::new(
            Arc::new(pool),
            "webhook:jobs".to_string(),
            Duration::from_secs(120),
        );

        assert_eq!(scheduler.jobs_key, "webhook:jobs:jobs");
        assert_eq!(scheduler.scheduled_key, "webhook:jobs:scheduled");
        assert_eq!(scheduler.processing_key, "webhook:jobs:processing");
        assert_eq!(scheduler.backend_type(), "redis");
    }

    #[test]
    fn test_decode_claimed_separates_undecodable() {
        let job = test_job(1);
        let claimed = vec![
            job.job_id.to_string(),
            serde_json::to_string(&job).unwrap(),
            "corrupt-id".to_string(),
            "{not json".to_string(),
        ];

        let (jobs, undecodable) = decode_claimed(claimed);

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, job.job_id);
        assert_eq!(undecodable, vec!["corrupt-id".to_string()]);
    }
}
