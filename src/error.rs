use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::db::StoreError;
use crate::voting::ballot::BallotCheck;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("ballot rejected: {0}")]
    Validation(BallotCheck),
    #[error("store unavailable, please retry: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("no valid votes left in the ballot")]
    NoValidVotes,
    #[error("identifier {id:?} contains a reserved character")]
    IllegalCharacter { id: String },
    #[error("unknown candidate {candidate_id} in position {position_id}")]
    UnknownCandidate { position_id: String, candidate_id: String },
    #[error("gave up after {attempts} conflicting attempts, please retry")]
    Contention { attempts: u32 },
    #[error("an election is already active; reset it explicitly first")]
    AlreadyInitialized,
    #[error("no election has been initialized")]
    NotInitialized,
    #[error("invalid election definition: {0}")]
    InvalidCatalog(String),
}

pub type TallyResult<T> = Result<T, TallyError>;

lazy_static! {
    // Path delimiter plus the characters the tree reserves in keys.
    static ref RESERVED: Regex = Regex::new(r"[./#$\[\]\x00-\x1F\x7F]").unwrap();
}

/// Checks that an id can be used as a single key in the store tree.
pub fn check_id(id: &str) -> TallyResult<()> {
    if id.trim().is_empty() || RESERVED.is_match(id) {
        return Err(TallyError::IllegalCharacter { id: id.to_string() });
    }
    Ok(())
}
