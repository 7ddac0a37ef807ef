use std::collections::{BTreeSet, HashMap};

use crate::models::{Candidate, ElectionSnapshot, Position};
use crate::voting::{CandidateStanding, ElectionResults, PositionResults};

/// Candidates by tally, highest first. Equal tallies fall back to ballot
/// number, then to input order.
pub fn ranked(position: &Position) -> Vec<&Candidate> {
    let mut sorted: Vec<&Candidate> = position.candidates.iter().collect();
    sorted.sort_by(|a, b| b.votes.cmp(&a.votes).then(a.number.cmp(&b.number)));
    sorted
}

/// The top `winners_count` candidates of a position.
pub fn winners(position: &Position) -> Vec<&Candidate> {
    let mut sorted = ranked(position);
    sorted.truncate(position.winners_count);
    sorted
}

/// Ids of candidates that share a non-zero tally with someone else in the
/// same position.
pub fn equal_vote_groups(position: &Position) -> BTreeSet<String> {
    let mut by_tally: HashMap<u64, Vec<&str>> = HashMap::new();
    for candidate in position.candidates.iter().filter(|c| c.votes > 0) {
        by_tally.entry(candidate.votes).or_default().push(&candidate.id);
    }
    by_tally
        .into_values()
        .filter(|ids| ids.len() > 1)
        .flatten()
        .map(str::to_string)
        .collect()
}

pub fn total_votes(position: &Position) -> u64 {
    position.candidates.iter().map(|c| c.votes).sum()
}

/// Share of the position's votes, rounded half up to a whole percent.
pub fn percentage(candidate: &Candidate, position: &Position) -> u32 {
    percent_of(candidate.votes, total_votes(position))
}

fn percent_of(votes: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((votes * 200 + total) / (total * 2)) as u32
}

pub fn tally_position(position: &Position) -> PositionResults {
    let total = total_votes(position);
    let tied = equal_vote_groups(position);
    let standings = ranked(position)
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| CandidateStanding {
            candidate_id: candidate.id.clone(),
            name: candidate.name.clone(),
            number: candidate.number,
            votes: candidate.votes,
            percentage: percent_of(candidate.votes, total),
            rank: index + 1,
            is_winner: index < position.winners_count,
            has_equal_votes: tied.contains(&candidate.id),
        })
        .collect();

    PositionResults {
        position_id: position.id.clone(),
        name: position.name.clone(),
        winners_count: position.winners_count,
        total_votes: total,
        standings,
    }
}

pub fn tally(snapshot: &ElectionSnapshot) -> ElectionResults {
    let positions: Vec<PositionResults> = snapshot.positions.iter().map(tally_position).collect();
    let total_votes = positions.iter().map(|p| p.total_votes).sum();
    ElectionResults {
        positions,
        wrong_ballots: snapshot.wrong_ballots,
        total_votes,
    }
}
