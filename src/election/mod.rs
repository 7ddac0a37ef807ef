//! Election-wide operations: creating the tree, resetting it, refreshing
//! display data, and decoding it into snapshots.

pub mod paths;

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::db::{Store, Subscription, WriteBatch};
use crate::error::{check_id, TallyError, TallyResult};
use crate::models::{AuditEntry, Candidate, Catalog, ElectionSnapshot, Position};

fn validate_catalog(catalog: &Catalog) -> TallyResult<()> {
    if catalog.positions.is_empty() {
        return Err(TallyError::InvalidCatalog("no positions defined".to_string()));
    }
    let mut position_ids = HashSet::new();
    for position in &catalog.positions {
        check_id(&position.id)?;
        if !position_ids.insert(position.id.as_str()) {
            return Err(TallyError::InvalidCatalog(format!("duplicate position {}", position.id)));
        }
        if position.winners_count == 0 || position.winners_count > position.candidates.len() {
            return Err(TallyError::InvalidCatalog(format!(
                "position {} wants {} winner(s) from {} candidate(s)",
                position.id,
                position.winners_count,
                position.candidates.len()
            )));
        }
        let mut candidate_ids = HashSet::new();
        for candidate in &position.candidates {
            check_id(&candidate.id)?;
            if !candidate_ids.insert(candidate.id.as_str()) {
                return Err(TallyError::InvalidCatalog(format!(
                    "duplicate candidate {} in {}",
                    candidate.id, position.id
                )));
            }
        }
    }
    Ok(())
}

/// Creates the election with every tally at zero. An active election is
/// only replaced when `force` is set.
pub async fn initialize(store: &dyn Store, catalog: &Catalog, force: bool) -> TallyResult<()> {
    validate_catalog(catalog)?;

    let active = store.read(&paths::is_active()).await?;
    if !force && active.as_ref().and_then(Value::as_bool) == Some(true) {
        return Err(TallyError::AlreadyInitialized);
    }

    let mut groups = Map::new();
    for position in &catalog.positions {
        let candidates: Map<String, Value> = position
            .candidates
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    json!({"name": c.name, "photo": c.photo, "votes": 0, "number": c.number}),
                )
            })
            .collect();
        groups.insert(
            position.id.clone(),
            json!({"name": position.name, "winnersCount": position.winners_count, "candidates": candidates}),
        );
    }

    let mut batch = WriteBatch::new();
    if !force {
        // Two stations initializing at once: only the first one wins.
        batch.expect(paths::is_active(), active);
    }
    batch.set(
        paths::election(),
        json!({
            "groups": groups,
            "isActive": true,
            "createdAt": Utc::now().timestamp_millis(),
            "wrongVotes": 0,
        }),
    );
    match store.commit(batch).await {
        Ok(()) => {
            info!("Initialized election with {} position(s)", catalog.positions.len());
            Ok(())
        }
        Err(e) if e.is_conflict() => Err(TallyError::AlreadyInitialized),
        Err(e) => Err(e.into()),
    }
}

/// Initializes the election unless one already exists. Returns whether a
/// new election was created.
pub async fn ensure_initialized(store: &dyn Store, catalog: &Catalog) -> TallyResult<bool> {
    if store.read(&paths::groups()).await?.is_some() {
        return Ok(false);
    }
    match initialize(store, catalog, false).await {
        Ok(()) => Ok(true),
        Err(TallyError::AlreadyInitialized) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Zeroes every tally and the wrong-ballot counter and clears the vote log,
/// all in one commit. Returns the number of candidate tallies reset.
pub async fn reset_all_votes(store: &dyn Store) -> TallyResult<usize> {
    let groups = store.read(&paths::groups()).await?.ok_or(TallyError::NotInitialized)?;

    let mut batch = WriteBatch::new();
    let mut reset = 0;
    for (position_id, position) in groups.as_object().into_iter().flatten() {
        let candidates = position.get("candidates").and_then(Value::as_object);
        for candidate_id in candidates.into_iter().flat_map(|c| c.keys()) {
            batch.set(paths::candidate_votes(position_id, candidate_id), json!(0));
            reset += 1;
        }
    }
    batch.set(paths::wrong_votes(), json!(0));
    batch.remove(paths::vote_log());
    store.commit(batch).await?;

    warn!("Reset {} tallies, wrong ballots and the vote log", reset);
    Ok(reset)
}

/// Rewrites photo and ballot number from the catalog for every candidate
/// that exists in the store. Tallies are left alone.
pub async fn refresh_display_metadata(store: &dyn Store, catalog: &Catalog) -> TallyResult<usize> {
    let groups = store.read(&paths::groups()).await?.ok_or(TallyError::NotInitialized)?;

    let mut batch = WriteBatch::new();
    let mut refreshed = 0;
    for position in &catalog.positions {
        for candidate in &position.candidates {
            let stored = groups
                .get(&position.id)
                .and_then(|p| p.get("candidates"))
                .and_then(|c| c.get(&candidate.id));
            if stored.is_none() {
                continue;
            }
            let path = paths::candidate(&position.id, &candidate.id);
            batch.set(path.child("photo"), json!(candidate.photo));
            if let Some(number) = candidate.number {
                batch.set(path.child("number"), json!(number));
            }
            refreshed += 1;
        }
    }
    if !batch.is_empty() {
        store.commit(batch).await?;
    }
    info!("Refreshed display metadata for {} candidate(s)", refreshed);
    Ok(refreshed)
}

pub async fn load_snapshot(
    store: &dyn Store,
    catalog: &Catalog,
    default_ballot_number: u32,
) -> TallyResult<ElectionSnapshot> {
    let tree = store.read(&paths::election()).await?;
    Ok(decode(tree.as_ref(), catalog, default_ballot_number))
}

/// Turns the stored tree into a snapshot. Missing fields take their
/// defaults; a missing ballot number comes from the catalog, then from
/// `default_ballot_number`.
pub fn decode(tree: Option<&Value>, catalog: &Catalog, default_ballot_number: u32) -> ElectionSnapshot {
    let Some(tree) = tree else {
        return ElectionSnapshot::default();
    };

    let mut positions: Vec<Position> = Vec::new();
    if let Some(groups) = tree.get("groups").and_then(Value::as_object) {
        for (position_id, group) in groups {
            let mut candidates: Vec<Candidate> = group
                .get("candidates")
                .and_then(Value::as_object)
                .into_iter()
                .flatten()
                .map(|(candidate_id, c)| Candidate {
                    id: candidate_id.clone(),
                    name: text(c, "name"),
                    photo: text(c, "photo"),
                    number: c
                        .get("number")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32)
                        .or_else(|| catalog.ballot_number(position_id, candidate_id))
                        .unwrap_or(default_ballot_number),
                    votes: c.get("votes").and_then(Value::as_u64).unwrap_or(0),
                })
                .collect();
            candidates.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.id.cmp(&b.id)));

            positions.push(Position {
                id: position_id.clone(),
                name: text(group, "name"),
                winners_count: group.get("winnersCount").and_then(Value::as_u64).unwrap_or(1) as usize,
                candidates,
            });
        }
    }
    positions.sort_by_key(|p| catalog.display_rank(&p.id));

    ElectionSnapshot {
        positions,
        wrong_ballots: tree.get("wrongVotes").and_then(Value::as_u64).unwrap_or(0),
        is_active: tree.get("isActive").and_then(Value::as_bool).unwrap_or(false),
        created_at: tree
            .get("createdAt")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    }
}

fn text(node: &Value, field: &str) -> String {
    node.get(field).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Live feed of election snapshots for display stations.
pub struct SnapshotFeed {
    subscription: Subscription,
    catalog: Catalog,
    default_ballot_number: u32,
}

impl SnapshotFeed {
    /// The next snapshot; the first call yields the current state. `None`
    /// once the store has shut down.
    pub async fn next(&mut self) -> Option<ElectionSnapshot> {
        let tree = self.subscription.recv().await?;
        Some(decode(tree.as_ref(), &self.catalog, self.default_ballot_number))
    }
}

pub async fn watch_election(
    store: &dyn Store,
    catalog: Catalog,
    default_ballot_number: u32,
) -> TallyResult<SnapshotFeed> {
    let subscription = store.subscribe(&paths::election()).await?;
    Ok(SnapshotFeed {
        subscription,
        catalog,
        default_ballot_number,
    })
}

/// The vote log in commit order (timestamp, then position in its batch).
pub async fn read_audit_log(store: &dyn Store) -> TallyResult<Vec<(String, AuditEntry)>> {
    let Some(log) = store.read(&paths::vote_log()).await? else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for (key, value) in log.as_object().into_iter().flatten() {
        match serde_json::from_value::<AuditEntry>(value.clone()) {
            Ok(entry) => entries.push((key.clone(), entry)),
            Err(e) => warn!("Skipping malformed vote log entry {}: {}", key, e),
        }
    }
    entries.sort_by_key(|(key, entry)| {
        let index: u64 = key.split('_').nth(1).and_then(|i| i.parse().ok()).unwrap_or(0);
        (entry.timestamp, index, key.clone())
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::AuditKind;
    use crate::tally::test_support::{club_catalog, initialized_store, spec};
    use crate::tally::{BatchCommitter, CommitPolicy, VoteCounter};
    use crate::voting::ballot::BallotVote;

    #[tokio::test]
    async fn initialize_writes_zeroed_tree() {
        let store = initialized_store().await;
        let snapshot = load_snapshot(store.as_ref(), &club_catalog(), 0).await.unwrap();

        assert!(snapshot.is_active);
        assert!(snapshot.created_at.is_some());
        assert_eq!(snapshot.wrong_ballots, 0);
        let ids: Vec<&str> = snapshot.positions.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["head", "head-assistant", "finance", "members", "under-age"]);

        let members = snapshot.position("members").unwrap();
        assert_eq!(members.winners_count, 5);
        assert_eq!(members.candidates.len(), 16);
        assert!(members.candidates.iter().all(|c| c.votes == 0));
        // Sorted by ballot number, not by key.
        assert_eq!(members.candidates[1].id, "members-2");
    }

    #[tokio::test]
    async fn active_election_is_not_recreated() {
        let store = initialized_store().await;
        let err = initialize(store.as_ref(), &club_catalog(), false).await.unwrap_err();
        assert!(matches!(err, TallyError::AlreadyInitialized));
        assert!(!ensure_initialized(store.as_ref(), &club_catalog()).await.unwrap());

        let smaller = Catalog::new(vec![spec("head", 1, 3)]);
        initialize(store.as_ref(), &smaller, true).await.unwrap();
        let snapshot = load_snapshot(store.as_ref(), &smaller, 0).await.unwrap();
        assert_eq!(snapshot.positions.len(), 1);
    }

    #[tokio::test]
    async fn ensure_initialized_creates_once() {
        let store = MemoryStore::new();
        assert!(ensure_initialized(&store, &club_catalog()).await.unwrap());
        assert!(!ensure_initialized(&store, &club_catalog()).await.unwrap());
    }

    #[tokio::test]
    async fn bad_catalogs_are_refused() {
        let store = MemoryStore::new();
        let too_many_winners = Catalog::new(vec![spec("members", 5, 4)]);
        assert!(matches!(
            initialize(&store, &too_many_winners, false).await.unwrap_err(),
            TallyError::InvalidCatalog(_)
        ));
        let duplicate = Catalog::new(vec![spec("head", 1, 2), spec("head", 1, 2)]);
        assert!(matches!(
            initialize(&store, &duplicate, false).await.unwrap_err(),
            TallyError::InvalidCatalog(_)
        ));
        let reserved = Catalog::new(vec![spec("head.chair", 1, 2)]);
        assert!(matches!(
            initialize(&store, &reserved, false).await.unwrap_err(),
            TallyError::IllegalCharacter { .. }
        ));
        assert_eq!(store.read(&paths::election()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_zeroes_everything_and_clears_log() {
        let store = initialized_store().await;
        let counter = VoteCounter::new(store.clone(), CommitPolicy::default());
        counter.increment("head", "head-1").await.unwrap();
        counter.increment("members", "members-3").await.unwrap();
        counter.record_wrong_ballot().await.unwrap();

        assert_eq!(reset_all_votes(store.as_ref()).await.unwrap(), 27);

        let snapshot = load_snapshot(store.as_ref(), &club_catalog(), 0).await.unwrap();
        assert!(snapshot.positions.iter().flat_map(|p| &p.candidates).all(|c| c.votes == 0));
        assert_eq!(snapshot.wrong_ballots, 0);
        assert!(read_audit_log(store.as_ref()).await.unwrap().is_empty());
        assert!(snapshot.is_active);
    }

    #[tokio::test]
    async fn reset_needs_an_election() {
        let store = MemoryStore::new();
        assert!(matches!(
            reset_all_votes(&store).await.unwrap_err(),
            TallyError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn refresh_updates_photos_but_not_tallies() {
        let store = initialized_store().await;
        let counter = VoteCounter::new(store.clone(), CommitPolicy::default());
        counter.increment("finance", "finance-2").await.unwrap();

        let mut catalog = club_catalog();
        catalog.positions[2].candidates[1].photo = "/images/new.png".to_string();
        catalog.positions[2].candidates[1].number = Some(9);
        catalog.positions.push(spec("auditor", 1, 2));

        assert_eq!(refresh_display_metadata(store.as_ref(), &catalog).await.unwrap(), 27);
        let snapshot = load_snapshot(store.as_ref(), &catalog, 0).await.unwrap();
        let finance_2 = snapshot.position("finance").unwrap().candidate("finance-2").unwrap();
        assert_eq!(finance_2.photo, "/images/new.png");
        assert_eq!(finance_2.number, 9);
        assert_eq!(finance_2.votes, 1);
        assert!(snapshot.position("auditor").is_none());
    }

    #[test]
    fn missing_numbers_fall_back_to_catalog_then_default() {
        let tree = json!({
            "groups": {"head": {"name": "Chair", "winnersCount": 1, "candidates": {
                "head-1": {"name": "A", "votes": 2},
                "head-2": {"name": "B", "votes": 1, "number": null},
                "head-3": {"name": "C", "votes": 0}
            }}},
            "wrongVotes": 3,
            "isActive": true
        });
        let catalog = Catalog::new(vec![spec("head", 1, 2)]);
        let snapshot = decode(Some(&tree), &catalog, 99);
        let head = snapshot.position("head").unwrap();
        assert_eq!(head.candidate("head-1").unwrap().number, 1);
        assert_eq!(head.candidate("head-2").unwrap().number, 2);
        assert_eq!(head.candidate("head-3").unwrap().number, 99);
        assert_eq!(snapshot.wrong_ballots, 3);
        assert!(snapshot.created_at.is_none());

        assert!(decode(None, &catalog, 0).is_empty());
    }

    #[tokio::test]
    async fn feed_pushes_snapshot_after_each_commit() {
        let store = initialized_store().await;
        let mut feed = watch_election(store.as_ref(), club_catalog(), 0).await.unwrap();
        let first = feed.next().await.unwrap();
        assert_eq!(first.position("head").unwrap().candidate("head-1").unwrap().votes, 0);

        let committer = BatchCommitter::new(store.clone(), CommitPolicy::default());
        committer
            .commit(&[BallotVote::new("head", "head-1"), BallotVote::new("finance", "finance-2")])
            .await
            .unwrap();

        let next = feed.next().await.unwrap();
        assert_eq!(next.position("head").unwrap().candidate("head-1").unwrap().votes, 1);
        assert_eq!(next.position("finance").unwrap().candidate("finance-2").unwrap().votes, 1);
    }

    #[tokio::test]
    async fn audit_log_is_ordered_by_batch_index() {
        let store = initialized_store().await;
        let committer = BatchCommitter::new(store.clone(), CommitPolicy::default());
        let ballot: Vec<BallotVote> = (1..=12)
            .map(|n| BallotVote::new("members", format!("members-{}", n)))
            .collect();
        committer.commit(&ballot).await.unwrap();

        let log = read_audit_log(store.as_ref()).await.unwrap();
        assert_eq!(log.len(), 12);
        let order: Vec<&str> = log
            .iter()
            .map(|(_, e)| e.candidate_id.as_deref().unwrap())
            .collect();
        let expected: Vec<String> = (1..=12).map(|n| format!("members-{}", n)).collect();
        assert_eq!(order, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(log.iter().all(|(_, e)| e.kind == AuditKind::Add));
    }
}
