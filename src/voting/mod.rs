pub mod ballot;
pub mod results;

use std::fmt::Write;

use serde::Serialize;

// Where one candidate stands in its position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateStanding {
    pub candidate_id: String,
    pub name: String,
    pub number: u32,
    pub votes: u64,
    pub percentage: u32,
    pub rank: usize,
    pub is_winner: bool,
    pub has_equal_votes: bool, // shares a non-zero tally with another candidate
}

// Results of one position, standings ordered by rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionResults {
    pub position_id: String,
    pub name: String,
    pub winners_count: usize,
    pub total_votes: u64,
    pub standings: Vec<CandidateStanding>,
}

impl PositionResults {
    pub fn winners(&self) -> impl Iterator<Item = &CandidateStanding> {
        self.standings.iter().filter(|s| s.is_winner)
    }

    /// True when the last seat is shared by a tie with a non-winner, i.e.
    /// the winner list depends on the tie-break.
    pub fn has_undecided_seat(&self) -> bool {
        let (Some(last_in), Some(first_out)) = (
            self.standings.get(self.winners_count.wrapping_sub(1)),
            self.standings.get(self.winners_count),
        ) else {
            return false;
        };
        last_in.votes > 0 && last_in.votes == first_out.votes
    }

    pub fn summary(&self) -> String {
        let mut summary = format!("{} ({} seat(s), {} votes)\n", self.name, self.winners_count, self.total_votes);
        if self.total_votes == 0 {
            summary.push_str("  No votes recorded yet.\n");
            return summary;
        }
        for standing in &self.standings {
            let name = if standing.is_winner {
                format!("**{}**", standing.name)
            } else {
                standing.name.clone()
            };
            let _ = write!(
                summary,
                "  {}. [{}] {}: {} votes ({}%)",
                standing.rank, standing.number, name, standing.votes, standing.percentage
            );
            if standing.has_equal_votes {
                summary.push_str(" =");
            }
            summary.push('\n');
        }
        if self.has_undecided_seat() {
            summary.push_str("  Tie at the last winning seat.\n");
        }
        summary
    }
}

// Results of the whole election
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectionResults {
    pub positions: Vec<PositionResults>,
    pub wrong_ballots: u64,
    pub total_votes: u64,
}

impl ElectionResults {
    pub fn position(&self, position_id: &str) -> Option<&PositionResults> {
        self.positions.iter().find(|p| p.position_id == position_id)
    }

    pub fn summary(&self) -> String {
        if self.positions.is_empty() {
            return "No election data available.\n".to_string();
        }
        let mut summary = String::new();
        for position in &self.positions {
            summary.push_str(&position.summary());
            summary.push('\n');
        }
        let _ = writeln!(
            summary,
            "Total votes: {}, wrong ballots: {}",
            self.total_votes, self.wrong_ballots
        );
        summary
    }
}
