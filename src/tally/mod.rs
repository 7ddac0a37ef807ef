//! Counter mutations.
//!
//! Every change to a tally goes through [`apply_deltas`]: read the current
//! values, stage the new ones guarded by "unchanged since read"
//! preconditions, and commit everything (audit entries included) in one
//! batch. A concurrent writer makes the commit fail with a conflict and the
//! whole step is retried, so no increment is ever lost.

pub mod batch;
pub mod counter;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use log::{debug, warn};
use serde_json::{json, Value};

use crate::db::{Store, StoreError, StorePath, WriteBatch};
use crate::election::paths;
use crate::error::{TallyError, TallyResult};
use crate::models::{AuditEntry, AuditKind};

pub use batch::{BatchCommitter, BatchReceipt};
pub use counter::VoteCounter;

/// Retry budget for optimistic commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            backoff: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    Candidate {
        position_id: String,
        candidate_id: String,
    },
    WrongBallots,
}

impl Counter {
    pub fn candidate(position_id: &str, candidate_id: &str) -> Self {
        Counter::Candidate {
            position_id: position_id.to_string(),
            candidate_id: candidate_id.to_string(),
        }
    }

    fn value_path(&self) -> StorePath {
        match self {
            Counter::Candidate {
                position_id,
                candidate_id,
            } => paths::candidate_votes(position_id, candidate_id),
            Counter::WrongBallots => paths::wrong_votes(),
        }
    }

    fn audit_entry(&self, kind: AuditKind, now: chrono::DateTime<Utc>) -> AuditEntry {
        match self {
            Counter::Candidate {
                position_id,
                candidate_id,
            } => AuditEntry::for_candidate(kind, position_id, candidate_id, now),
            Counter::WrongBallots => AuditEntry::wrong_ballot(now),
        }
    }

    fn audit_tag(&self) -> &str {
        match self {
            Counter::Candidate { candidate_id, .. } => candidate_id,
            Counter::WrongBallots => "wrong",
        }
    }
}

/// One counter change plus the audit entry that records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub counter: Counter,
    pub amount: i64,
    pub kind: AuditKind,
}

impl Delta {
    pub fn add(counter: Counter) -> Self {
        Self {
            counter,
            amount: 1,
            kind: AuditKind::Add,
        }
    }

    pub fn subtract(counter: Counter) -> Self {
        Self {
            counter,
            amount: -1,
            kind: AuditKind::Subtract,
        }
    }

    pub fn wrong_ballot() -> Self {
        Self {
            counter: Counter::WrongBallots,
            amount: 1,
            kind: AuditKind::Wrong,
        }
    }
}

/// Current value of a counter, as read from the store. `raw` is kept for
/// the commit precondition.
struct Observed {
    raw: Option<Value>,
    current: u64,
}

async fn observe(store: &dyn Store, counter: &Counter) -> TallyResult<Observed> {
    let raw = match counter {
        Counter::Candidate {
            position_id,
            candidate_id,
        } => {
            let node = store
                .read(&paths::candidate(position_id, candidate_id))
                .await?
                .ok_or_else(|| TallyError::UnknownCandidate {
                    position_id: position_id.clone(),
                    candidate_id: candidate_id.clone(),
                })?;
            node.get("votes").filter(|v| !v.is_null()).cloned()
        }
        Counter::WrongBallots => store.read(&paths::wrong_votes()).await?,
    };
    let current = raw.as_ref().and_then(Value::as_u64).unwrap_or(0);
    Ok(Observed { raw, current })
}

/// Applies the deltas and their audit entries as one atomic commit and
/// returns the resulting value of each delta's counter. Counters never go
/// below zero.
pub async fn apply_deltas(
    store: &dyn Store,
    deltas: &[Delta],
    policy: &CommitPolicy,
) -> TallyResult<Vec<u64>> {
    let mut net: BTreeMap<&Counter, i64> = BTreeMap::new();
    for delta in deltas {
        *net.entry(&delta.counter).or_insert(0) += delta.amount;
    }

    for attempt in 1..=policy.max_attempts.max(1) {
        let observed = try_join_all(net.keys().map(|counter| observe(store, counter))).await?;

        let mut batch = WriteBatch::new();
        let mut next: BTreeMap<&Counter, u64> = BTreeMap::new();
        for ((counter, amount), seen) in net.iter().zip(observed) {
            let value = (seen.current as i64).saturating_add(*amount).max(0) as u64;
            let path = counter.value_path();
            batch.expect(path.clone(), seen.raw);
            batch.set(path, json!(value));
            next.insert(*counter, value);
        }

        let now = Utc::now();
        for (index, delta) in deltas.iter().enumerate() {
            let key = format!("{}_{}_{}", now.timestamp_millis(), index, delta.counter.audit_tag());
            let entry = delta.counter.audit_entry(delta.kind, now);
            let path = paths::vote_log().child(key);
            batch.expect(path.clone(), None);
            batch.set(path, serde_json::to_value(entry).map_err(StoreError::from)?);
        }

        match store.commit(batch).await {
            Ok(()) => {
                return Ok(deltas.iter().map(|d| next[&d.counter]).collect());
            }
            Err(e) if e.is_conflict() => {
                debug!("Commit attempt {} lost a race: {}", attempt, e);
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    warn!(
        "Giving up on {} delta(s) after {} conflicting attempts",
        deltas.len(),
        policy.max_attempts
    );
    Err(TallyError::Contention {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::db::MemoryStore;
    use crate::election;
    use crate::models::{Catalog, CandidateSpec, PositionSpec};

    pub fn spec(id: &str, winners_count: usize, candidates: usize) -> PositionSpec {
        PositionSpec {
            id: id.to_string(),
            name: id.to_string(),
            winners_count,
            candidates: (1..=candidates)
                .map(|n| CandidateSpec {
                    id: format!("{}-{}", id, n),
                    name: format!("{} {}", id, n),
                    photo: format!("/images/{}-{}.png", id, n),
                    number: Some(n as u32),
                })
                .collect(),
        }
    }

    pub fn club_catalog() -> Catalog {
        Catalog::new(vec![
            spec("head", 1, 2),
            spec("head-assistant", 1, 2),
            spec("finance", 1, 2),
            spec("members", 5, 16),
            spec("under-age", 2, 5),
        ])
    }

    pub async fn initialized_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        election::initialize(store.as_ref(), &club_catalog(), false)
            .await
            .unwrap();
        store
    }
}
