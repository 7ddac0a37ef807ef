use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A candidate as the tally engine sees it. `votes` is the only field that
/// changes while an election is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub photo: String,
    pub number: u32,
    pub votes: u64,
}

/// An electoral position (a "group" in the persisted tree). Single-winner
/// positions have `winners_count == 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub name: String,
    pub winners_count: usize,
    pub candidates: Vec<Candidate>,
}

impl Position {
    pub fn candidate(&self, candidate_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == candidate_id)
    }
}

/// Immutable view of the whole election at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionSnapshot {
    pub positions: Vec<Position>,
    pub wrong_ballots: u64,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ElectionSnapshot {
    pub fn position(&self, position_id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == position_id)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Add,
    Subtract,
    Wrong,
}

/// One line of the append-only vote log. Wrong-ballot entries carry no
/// position or candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    #[serde(rename = "candidateId", default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl AuditEntry {
    pub fn for_candidate(kind: AuditKind, position_id: &str, candidate_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            position_id: Some(position_id.to_string()),
            candidate_id: Some(candidate_id.to_string()),
            kind,
            timestamp: now.timestamp_millis(),
        }
    }

    pub fn wrong_ballot(now: DateTime<Utc>) -> Self {
        Self {
            position_id: None,
            candidate_id: None,
            kind: AuditKind::Wrong,
            timestamp: now.timestamp_millis(),
        }
    }
}

// ---- Catalog (election definition loaded from configuration) ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub photo: String,
    #[serde(default)]
    pub number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSpec {
    pub id: String,
    pub name: String,
    #[serde(rename = "winnersCount")]
    pub winners_count: usize,
    pub candidates: Vec<CandidateSpec>,
}

/// The configured set of positions, in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    pub positions: Vec<PositionSpec>,
}

impl Catalog {
    pub fn new(positions: Vec<PositionSpec>) -> Self {
        Self { positions }
    }

    pub fn position(&self, position_id: &str) -> Option<&PositionSpec> {
        self.positions.iter().find(|p| p.id == position_id)
    }

    /// Ballot number declared for a candidate in the catalog, if any.
    pub fn ballot_number(&self, position_id: &str, candidate_id: &str) -> Option<u32> {
        self.position(position_id)?
            .candidates
            .iter()
            .find(|c| c.id == candidate_id)
            .and_then(|c| c.number)
    }

    /// Index of a position in display order; unknown positions sort last.
    pub fn display_rank(&self, position_id: &str) -> usize {
        self.positions
            .iter()
            .position(|p| p.id == position_id)
            .unwrap_or(usize::MAX)
    }
}
