use std::sync::Arc;

use log::{error, info};
use serde_json::Value;

use crate::db::Store;
use crate::election::paths;
use crate::error::{check_id, TallyResult};
use crate::tally::{apply_deltas, CommitPolicy, Counter, Delta};

/// Single-step tally adjustments: manual +1/-1 from an operator and the
/// wrong-ballot counter.
#[derive(Clone)]
pub struct VoteCounter {
    store: Arc<dyn Store>,
    policy: CommitPolicy,
}

impl VoteCounter {
    pub fn new(store: Arc<dyn Store>, policy: CommitPolicy) -> Self {
        Self { store, policy }
    }

    /// Adds one vote and returns the new tally.
    pub async fn increment(&self, position_id: &str, candidate_id: &str) -> TallyResult<u64> {
        self.adjust(Delta::add(Self::counter(position_id, candidate_id)?)).await
    }

    /// Removes one vote and returns the new tally. A tally at zero stays at zero.
    pub async fn decrement(&self, position_id: &str, candidate_id: &str) -> TallyResult<u64> {
        self.adjust(Delta::subtract(Self::counter(position_id, candidate_id)?)).await
    }

    pub async fn record_wrong_ballot(&self) -> TallyResult<u64> {
        self.adjust(Delta::wrong_ballot()).await
    }

    pub async fn tally(&self, position_id: &str, candidate_id: &str) -> TallyResult<u64> {
        check_id(position_id)?;
        check_id(candidate_id)?;
        let value = self
            .store
            .read(&paths::candidate_votes(position_id, candidate_id))
            .await?;
        Ok(value.as_ref().and_then(Value::as_u64).unwrap_or(0))
    }

    pub async fn wrong_ballots(&self) -> TallyResult<u64> {
        let value = self.store.read(&paths::wrong_votes()).await?;
        Ok(value.as_ref().and_then(Value::as_u64).unwrap_or(0))
    }

    fn counter(position_id: &str, candidate_id: &str) -> TallyResult<Counter> {
        check_id(position_id)?;
        check_id(candidate_id)?;
        Ok(Counter::candidate(position_id, candidate_id))
    }

    async fn adjust(&self, delta: Delta) -> TallyResult<u64> {
        match apply_deltas(self.store.as_ref(), std::slice::from_ref(&delta), &self.policy).await {
            Ok(values) => {
                let value = values.first().copied().unwrap_or_default();
                info!("{:?} {:?} -> {}", delta.kind, delta.counter, value);
                Ok(value)
            }
            Err(e) => {
                error!("Failed to apply {:?} to {:?}: {}", delta.kind, delta.counter, e);
                Err(e)
            }
        }
    }
}
