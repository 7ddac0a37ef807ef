use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::error::{TallyError, TallyResult};
use crate::models::{Catalog, ElectionSnapshot};

/// One vote of a validated ballot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BallotVote {
    pub position_id: String,
    pub candidate_id: String,
}

impl BallotVote {
    pub fn new(position_id: impl Into<String>, candidate_id: impl Into<String>) -> Self {
        Self {
            position_id: position_id.into(),
            candidate_id: candidate_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RosterPosition {
    id: String,
    name: String,
    winners_count: usize,
    candidates: Vec<String>,
}

/// Explicit candidate→position mapping built from the loaded election.
/// Entry stations reload it when the stored positions change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    positions: Vec<RosterPosition>,
    by_candidate: HashMap<String, Vec<usize>>,
}

impl Roster {
    pub fn from_snapshot(snapshot: &ElectionSnapshot) -> Self {
        Self::build(snapshot.positions.iter().map(|p| RosterPosition {
            id: p.id.clone(),
            name: p.name.clone(),
            winners_count: p.winners_count,
            candidates: p.candidates.iter().map(|c| c.id.clone()).collect(),
        }))
    }

    pub fn from_catalog(catalog: &Catalog) -> Self {
        Self::build(catalog.positions.iter().map(|p| RosterPosition {
            id: p.id.clone(),
            name: p.name.clone(),
            winners_count: p.winners_count,
            candidates: p.candidates.iter().map(|c| c.id.clone()).collect(),
        }))
    }

    fn build(positions: impl Iterator<Item = RosterPosition>) -> Self {
        let positions: Vec<RosterPosition> = positions.collect();
        let mut by_candidate: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, position) in positions.iter().enumerate() {
            for candidate in &position.candidates {
                by_candidate.entry(candidate.clone()).or_default().push(index);
            }
        }
        Self { positions, by_candidate }
    }

    fn position(&self, position_id: &str) -> Option<&RosterPosition> {
        self.positions.iter().find(|p| p.id == position_id)
    }

    pub fn contains(&self, position_id: &str, candidate_id: &str) -> bool {
        self.position(position_id)
            .map_or(false, |p| p.candidates.iter().any(|c| c == candidate_id))
    }

    /// The position a candidate id belongs to, if it names exactly one.
    pub fn position_of(&self, candidate_id: &str) -> Option<&str> {
        match self.by_candidate.get(candidate_id).map(Vec::as_slice) {
            Some([index]) => Some(self.positions[*index].id.as_str()),
            _ => None,
        }
    }

    pub fn winners_count(&self, position_id: &str) -> Option<usize> {
        self.position(position_id).map(|p| p.winners_count)
    }

    pub fn position_ids(&self) -> impl Iterator<Item = &str> {
        self.positions.iter().map(|p| p.id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Selection count of one position against what it requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionCount {
    pub position_id: String,
    pub position_name: String,
    pub selected: usize,
    pub required: usize,
    pub available: usize,
}

impl PositionCount {
    pub fn is_satisfied(&self) -> bool {
        self.available > 0 && self.selected == self.required
    }

    /// Positive when selections are missing, negative when there are too many.
    pub fn shortfall(&self) -> i64 {
        self.required as i64 - self.selected as i64
    }
}

/// Outcome of checking a ballot against the per-position rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BallotCheck {
    pub valid: bool,
    pub positions: Vec<PositionCount>,
}

impl BallotCheck {
    pub fn shortfalls(&self) -> impl Iterator<Item = &PositionCount> {
        self.positions.iter().filter(|p| !p.is_satisfied())
    }

    pub fn position(&self, position_id: &str) -> Option<&PositionCount> {
        self.positions.iter().find(|p| p.position_id == position_id)
    }
}

impl fmt::Display for BallotCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.positions.is_empty() {
            return write!(f, "no positions loaded");
        }
        if self.valid {
            return write!(f, "complete");
        }
        let parts: Vec<String> = self
            .shortfalls()
            .map(|p| match p.shortfall() {
                _ if p.available == 0 => format!("{}: no candidates loaded", p.position_name),
                n if n > 0 => format!("{}: {} missing ({}/{})", p.position_name, n, p.selected, p.required),
                n => format!("{}: {} too many ({}/{})", p.position_name, -n, p.selected, p.required),
            })
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Selections for the paper ballot currently being entered at one station.
pub struct BallotSelection {
    roster: Arc<Roster>,
    selected: BTreeMap<String, Vec<String>>,
}

impl BallotSelection {
    pub fn new(roster: Arc<Roster>) -> Self {
        Self {
            roster,
            selected: BTreeMap::new(),
        }
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// Swaps in a freshly loaded roster. Selections that no longer exist are dropped.
    pub fn replace_roster(&mut self, roster: Arc<Roster>) {
        self.selected.retain(|position_id, candidates| {
            candidates.retain(|c| roster.contains(position_id, c));
            !candidates.is_empty()
        });
        self.roster = roster;
    }

    pub fn is_selected(&self, position_id: &str, candidate_id: &str) -> bool {
        self.selected_in(position_id).iter().any(|c| c == candidate_id)
    }

    pub fn selected_in(&self, position_id: &str) -> &[String] {
        self.selected.get(position_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Flips a candidate in or out of the selection. Returns whether
    /// anything changed; unknown candidates and selections past a
    /// position's capacity are ignored.
    pub fn toggle(&mut self, position_id: &str, candidate_id: &str) -> bool {
        let winners_count = match self.roster.winners_count(position_id) {
            Some(n) if n > 0 => n,
            _ => return false,
        };
        if !self.roster.contains(position_id, candidate_id) {
            debug!("Ignoring unknown candidate {}/{}", position_id, candidate_id);
            return false;
        }

        let picks = self.selected.entry(position_id.to_string()).or_default();
        if let Some(index) = picks.iter().position(|c| c == candidate_id) {
            picks.remove(index);
        } else if winners_count == 1 {
            picks.clear();
            picks.push(candidate_id.to_string());
        } else if picks.len() < winners_count {
            picks.push(candidate_id.to_string());
        } else {
            debug!("Position {} already has {} selections", position_id, winners_count);
            return false;
        }

        if picks.is_empty() {
            self.selected.remove(position_id);
        }
        true
    }

    /// Whether clicking the candidate would do something: deselecting is
    /// always possible, single-winner positions swap the pick, others need
    /// a free slot.
    pub fn is_candidate_selectable(&self, position_id: &str, candidate_id: &str) -> bool {
        if !self.roster.contains(position_id, candidate_id) {
            return false;
        }
        if self.is_selected(position_id, candidate_id) {
            return true;
        }
        match self.roster.winners_count(position_id) {
            Some(1) => true,
            Some(n) => self.selected_in(position_id).len() < n,
            None => false,
        }
    }

    pub fn validate(&self) -> BallotCheck {
        let positions: Vec<PositionCount> = self
            .roster
            .positions
            .iter()
            .map(|p| PositionCount {
                position_id: p.id.clone(),
                position_name: p.name.clone(),
                selected: self.selected_in(&p.id).len(),
                required: p.winners_count,
                available: p.candidates.len(),
            })
            .collect();
        let valid = !positions.is_empty() && positions.iter().all(PositionCount::is_satisfied);
        BallotCheck { valid, positions }
    }

    /// The ballot as one vote per winner slot, in roster order.
    pub fn build_ballot(&self) -> TallyResult<Vec<BallotVote>> {
        let check = self.validate();
        if !check.valid {
            return Err(TallyError::Validation(check));
        }
        Ok(self
            .roster
            .position_ids()
            .flat_map(|position_id| {
                self.selected_in(position_id)
                    .iter()
                    .map(move |candidate_id| BallotVote::new(position_id, candidate_id.as_str()))
            })
            .collect())
    }

    pub fn reset(&mut self) {
        self.selected.clear();
    }
}
