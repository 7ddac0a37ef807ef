use std::sync::Arc;

use log::{error, info, warn};

use crate::db::Store;
use crate::error::{check_id, TallyError, TallyResult};
use crate::tally::{apply_deltas, CommitPolicy, Counter, Delta};
use crate::voting::ballot::BallotVote;

/// What a successful ballot commit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Committed votes with the candidate's tally after the commit.
    pub committed: Vec<(BallotVote, u64)>,
    /// Votes dropped before the commit because their ids were unusable.
    pub dropped: Vec<BallotVote>,
}

/// Commits a whole ballot as one all-or-nothing write.
#[derive(Clone)]
pub struct BatchCommitter {
    store: Arc<dyn Store>,
    policy: CommitPolicy,
}

impl BatchCommitter {
    pub fn new(store: Arc<dyn Store>, policy: CommitPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn commit(&self, ballot: &[BallotVote]) -> TallyResult<BatchReceipt> {
        let (valid, dropped) = sanitize(ballot);
        if valid.is_empty() {
            warn!("Ballot of {} vote(s) had nothing left after sanitation", ballot.len());
            return Err(TallyError::NoValidVotes);
        }

        let deltas: Vec<Delta> = valid
            .iter()
            .map(|v| Delta::add(Counter::candidate(&v.position_id, &v.candidate_id)))
            .collect();

        match apply_deltas(self.store.as_ref(), &deltas, &self.policy).await {
            Ok(values) => {
                info!("Committed ballot with {} vote(s)", valid.len());
                Ok(BatchReceipt {
                    committed: valid.into_iter().zip(values).collect(),
                    dropped,
                })
            }
            Err(e) => {
                error!("Failed to commit ballot of {} vote(s): {}", valid.len(), e);
                Err(e)
            }
        }
    }
}

fn sanitize(ballot: &[BallotVote]) -> (Vec<BallotVote>, Vec<BallotVote>) {
    let mut valid = Vec::with_capacity(ballot.len());
    let mut dropped = Vec::new();
    for vote in ballot {
        match check_id(&vote.position_id).and_then(|_| check_id(&vote.candidate_id)) {
            Ok(()) => valid.push(vote.clone()),
            Err(e) => {
                warn!("Dropping vote {}/{}: {}", vote.position_id, vote.candidate_id, e);
                dropped.push(vote.clone());
            }
        }
    }
    (valid, dropped)
}
