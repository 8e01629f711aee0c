//! In-process scheduler: a min-heap keyed by due time.
//!
//! Jobs are lost on restart; use the Redis backend when deliveries must
//! survive one.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::metrics::SchedulerMetrics;

use super::{run_at, DeliveryJob, JobHandle, JobScheduler, SchedulerError};

#[derive(Debug, PartialEq, Eq)]
struct TimedJob {
    due_ms: i64,
    seq: u64,
    job_id: Uuid,
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: earliest due (then earliest submitted) on top
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<TimedJob>,
    jobs: HashMap<Uuid, DeliveryJob>,
    /// Claimed job id -> visibility deadline (ms)
    inflight: HashMap<Uuid, i64>,
    seq: u64,
}

impl State {
    fn push(&mut self, job_id: Uuid, due_ms: i64) {
        self.seq += 1;
        self.heap.push(TimedJob {
            due_ms,
            seq: self.seq,
            job_id,
        });
    }
}

pub struct MemoryJobScheduler {
    state: Mutex<State>,
    visibility_timeout: Duration,
}

impl MemoryJobScheduler {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
        }
    }
}

#[async_trait]
impl JobScheduler for MemoryJobScheduler {
    async fn submit(&self, job: DeliveryJob, delay: Duration) -> Result<JobHandle, SchedulerError> {
        let run_at = run_at(Utc::now(), delay);
        let handle = JobHandle {
            job_id: job.job_id,
            run_at,
        };

        let mut state = self.state.lock().await;
        state.inflight.remove(&job.job_id);
        state.jobs.insert(job.job_id, job);
        state.push(handle.job_id, run_at.timestamp_millis());
        SchedulerMetrics::set_pending(state.jobs.len());

        Ok(handle)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>, SchedulerError> {
        let now_ms = now.timestamp_millis();
        let mut state = self.state.lock().await;

        // Unacked jobs past their visibility deadline are due again
        let expired: Vec<Uuid> = state
            .inflight
            .iter()
            .filter(|(_, deadline)| **deadline <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for job_id in expired {
            state.inflight.remove(&job_id);
            if state.jobs.contains_key(&job_id) {
                tracing::debug!(job_id = %job_id, "Requeueing unacknowledged job");
                state.push(job_id, now_ms);
            }
        }

        let deadline = now_ms + self.visibility_timeout.as_millis() as i64;
        let mut claimed = Vec::new();

        while claimed.len() < limit {
            match state.heap.peek() {
                Some(top) if top.due_ms <= now_ms => {}
                _ => break,
            }
            let Some(timed) = state.heap.pop() else { break };

            // Acked, or already handed out from an older heap entry
            if state.inflight.contains_key(&timed.job_id) {
                continue;
            }
            let Some(job) = state.jobs.get(&timed.job_id).cloned() else {
                continue;
            };

            state.inflight.insert(timed.job_id, deadline);
            claimed.push(job);
        }

        Ok(claimed)
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        state.jobs.remove(&job_id);
        state.inflight.remove(&job_id);
        SchedulerMetrics::set_pending(state.jobs.len());
        Ok(())
    }

    async fn pending(&self) -> Result<usize, SchedulerError> {
        Ok(self.state.lock().await.jobs.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_job;

    #[tokio::test]
    async fn test_job_not_handed_out_before_due() {
        let scheduler = MemoryJobScheduler::new(Duration::from_secs(60));
        let job = test_job(2);
        let handle = scheduler
            .submit(job.clone(), Duration::from_secs(300))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(scheduler.claim_due(now, 10).await.unwrap().is_empty());

        let at_due = handle.run_at;
        let claimed = scheduler.claim_due(at_due, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id, job.job_id);
    }

    #[tokio::test]
    async fn test_due_order_and_limit() {
        let scheduler = MemoryJobScheduler::new(Duration::from_secs(60));
        let late = test_job(1);
        let early = test_job(1);
        scheduler
            .submit(late.clone(), Duration::from_millis(500))
            .await
            .unwrap();
        scheduler
            .submit(early.clone(), Duration::ZERO)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let first = scheduler.claim_due(later, 1).await.unwrap();
        assert_eq!(first[0].job_id, early.job_id);

        let second = scheduler.claim_due(later, 1).await.unwrap();
        assert_eq!(second[0].job_id, late.job_id);
        assert!(scheduler.claim_due(later, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_job_redelivered_after_visibility_timeout() {
        let scheduler = MemoryJobScheduler::new(Duration::from_secs(30));
        let job = test_job(1);
        scheduler.submit(job.clone(), Duration::ZERO).await.unwrap();

        let now = Utc::now();
        assert_eq!(scheduler.claim_due(now, 10).await.unwrap().len(), 1);
        // Still invisible
        assert!(scheduler
            .claim_due(now + chrono::Duration::seconds(10), 10)
            .await
            .unwrap()
            .is_empty());

        let redelivered = scheduler
            .claim_due(now + chrono::Duration::seconds(31), 10)
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].job_id, job.job_id);
    }

    #[tokio::test]
    async fn test_ack_removes_job() {
        let scheduler = MemoryJobScheduler::new(Duration::from_secs(30));
        let job = test_job(1);
        scheduler.submit(job.clone(), Duration::ZERO).await.unwrap();
        assert_eq!(scheduler.pending().await.unwrap(), 1);

        let now = Utc::now();
        scheduler.claim_due(now, 10).await.unwrap();
        scheduler.ack(job.job_id).await.unwrap();

        assert_eq!(scheduler.pending().await.unwrap(), 0);
        assert!(scheduler
            .claim_due(now + chrono::Duration::seconds(60), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
