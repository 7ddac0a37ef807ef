pub mod commands;
pub mod config;
pub mod db;
pub mod election;
pub mod error;
pub mod handlers;
pub mod models;
pub mod tally;
pub mod tasks;
pub mod voting;

pub use error::{TallyError, TallyResult};
