//! Where things live in the shared tree.

use crate::db::StorePath;

pub fn election() -> StorePath {
    StorePath::parse("election")
}

pub fn groups() -> StorePath {
    election().child("groups")
}

pub fn position(position_id: &str) -> StorePath {
    groups().child(position_id)
}

pub fn candidate(position_id: &str, candidate_id: &str) -> StorePath {
    position(position_id).child("candidates").child(candidate_id)
}

pub fn candidate_votes(position_id: &str, candidate_id: &str) -> StorePath {
    candidate(position_id, candidate_id).child("votes")
}

pub fn wrong_votes() -> StorePath {
    election().child("wrongVotes")
}

pub fn vote_log() -> StorePath {
    election().child("voteLog")
}

pub fn is_active() -> StorePath {
    election().child("isActive")
}
