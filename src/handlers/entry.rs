use std::fmt::Write;
use std::str::FromStr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::db::Store;
use crate::election;
use crate::error::{TallyError, TallyResult};
use crate::models::Catalog;
use crate::tally::{BatchCommitter, CommitPolicy, VoteCounter};
use crate::voting::ballot::{BallotSelection, Roster};
use crate::voting::results;

pub const HELP: &str = "\
Commands:
  toggle <position> <candidate>   select or deselect a candidate
  pick <candidate>                same, position looked up from the candidate
  status                          show the ballot being entered
  submit                          count the ballot
  wrong                           count a spoiled ballot and start over
  abandon                         discard the ballot being entered
  add <position> <candidate>      add one vote by hand
  sub <position> <candidate>      remove one vote by hand
  results                         show current standings
  help                            show this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryCommand {
    Toggle { position_id: String, candidate_id: String },
    Pick { candidate_id: String },
    Status,
    Submit,
    Wrong,
    Abandon,
    Add { position_id: String, candidate_id: String },
    Sub { position_id: String, candidate_id: String },
    Results,
    Help,
}

impl EntryCommand {
    /// Commands that change the stored tallies.
    pub fn affects_votes(&self) -> bool {
        matches!(
            self,
            EntryCommand::Submit | EntryCommand::Wrong | EntryCommand::Add { .. } | EntryCommand::Sub { .. }
        )
    }
}

impl FromStr for EntryCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let pair = |make: fn(String, String) -> EntryCommand| match parts.as_slice() {
            [_, position, candidate] => Ok(make(position.to_string(), candidate.to_string())),
            _ => Err(format!("usage: {} <position> <candidate>", parts[0])),
        };
        match parts.first().map(|p| p.to_ascii_lowercase()).as_deref() {
            Some("toggle") | Some("t") => pair(|position_id, candidate_id| EntryCommand::Toggle {
                position_id,
                candidate_id,
            }),
            Some("add") => pair(|position_id, candidate_id| EntryCommand::Add {
                position_id,
                candidate_id,
            }),
            Some("sub") => pair(|position_id, candidate_id| EntryCommand::Sub {
                position_id,
                candidate_id,
            }),
            Some("pick") | Some("p") => match parts.as_slice() {
                [_, candidate] => Ok(EntryCommand::Pick {
                    candidate_id: candidate.to_string(),
                }),
                _ => Err("usage: pick <candidate>".to_string()),
            },
            Some("status") | Some("s") => Ok(EntryCommand::Status),
            Some("submit") => Ok(EntryCommand::Submit),
            Some("wrong") => Ok(EntryCommand::Wrong),
            Some("abandon") => Ok(EntryCommand::Abandon),
            Some("results") | Some("r") => Ok(EntryCommand::Results),
            Some("help") | Some("?") => Ok(EntryCommand::Help),
            Some(other) => Err(format!("unknown command {:?}, try `help`", other)),
            None => Err("empty command".to_string()),
        }
    }
}

/// One vote-entry station: the ballot being typed in plus the operations
/// that commit it.
pub struct EntryStation {
    store: Arc<dyn Store>,
    catalog: Catalog,
    default_ballot_number: u32,
    selection: BallotSelection,
    counter: VoteCounter,
    committer: BatchCommitter,
    operational: watch::Receiver<bool>,
}

impl EntryStation {
    /// Loads the current roster from the store.
    pub async fn open(
        store: Arc<dyn Store>,
        catalog: Catalog,
        default_ballot_number: u32,
        policy: CommitPolicy,
        operational: watch::Receiver<bool>,
    ) -> TallyResult<Self> {
        let snapshot = election::load_snapshot(store.as_ref(), &catalog, default_ballot_number).await?;
        if snapshot.is_empty() {
            return Err(TallyError::NotInitialized);
        }
        let roster = Arc::new(Roster::from_snapshot(&snapshot));
        info!("Entry station ready with {} position(s)", snapshot.positions.len());
        Ok(Self {
            counter: VoteCounter::new(store.clone(), policy),
            committer: BatchCommitter::new(store.clone(), policy),
            selection: BallotSelection::new(roster),
            store,
            catalog,
            default_ballot_number,
            operational,
        })
    }

    pub fn selection(&self) -> &BallotSelection {
        &self.selection
    }

    /// Runs one command line and returns the text to show the operator.
    pub async fn execute(&mut self, line: &str) -> String {
        let command = match line.parse::<EntryCommand>() {
            Ok(command) => command,
            Err(message) => return message,
        };
        match self.handle(command).await {
            Ok(reply) => reply,
            Err(TallyError::Validation(check)) => {
                warn!("Ballot rejected: {}", check);
                format!("Ballot incomplete, nothing counted: {}", check)
            }
            Err(e) => {
                error!("Entry command failed: {}", e);
                format!("Failed: {}", e)
            }
        }
    }

    pub async fn handle(&mut self, command: EntryCommand) -> TallyResult<String> {
        if command.affects_votes() && !*self.operational.borrow() {
            warn!("Refusing {:?} while offline", command);
            return Ok("Offline: votes cannot be recorded until the connection is back.".to_string());
        }

        match command {
            EntryCommand::Toggle {
                position_id,
                candidate_id,
            } => {
                if !self.selection.roster().contains(&position_id, &candidate_id) {
                    self.refresh_roster().await;
                }
                Ok(self.toggle(&position_id, &candidate_id))
            }
            EntryCommand::Pick { candidate_id } => {
                if self.selection.roster().position_of(&candidate_id).is_none() {
                    self.refresh_roster().await;
                }
                let position_id = self.selection.roster().position_of(&candidate_id).map(str::to_string);
                match position_id {
                    Some(position_id) => Ok(self.toggle(&position_id, &candidate_id)),
                    None => Ok(format!(
                        "{} is not a unique candidate id, use `toggle <position> <candidate>`",
                        candidate_id
                    )),
                }
            }
            EntryCommand::Status => {
                self.refresh_roster().await;
                Ok(self.status())
            }
            EntryCommand::Submit => {
                self.refresh_roster().await;
                let ballot = self.selection.build_ballot()?;
                let receipt = self.committer.commit(&ballot).await?;
                self.selection.reset();
                let mut reply = format!("Ballot counted ({} votes).", receipt.committed.len());
                if !receipt.dropped.is_empty() {
                    let _ = write!(reply, " {} unusable vote(s) were skipped.", receipt.dropped.len());
                }
                Ok(reply)
            }
            EntryCommand::Wrong => {
                let total = self.counter.record_wrong_ballot().await?;
                self.selection.reset();
                Ok(format!("Wrong ballot recorded ({} so far).", total))
            }
            EntryCommand::Abandon => {
                self.selection.reset();
                Ok("Ballot discarded.".to_string())
            }
            EntryCommand::Add {
                position_id,
                candidate_id,
            } => {
                let votes = self.counter.increment(&position_id, &candidate_id).await?;
                Ok(format!("{} now has {} vote(s).", candidate_id, votes))
            }
            EntryCommand::Sub {
                position_id,
                candidate_id,
            } => {
                let votes = self.counter.decrement(&position_id, &candidate_id).await?;
                Ok(format!("{} now has {} vote(s).", candidate_id, votes))
            }
            EntryCommand::Results => {
                let snapshot =
                    election::load_snapshot(self.store.as_ref(), &self.catalog, self.default_ballot_number).await?;
                Ok(results::tally(&snapshot).summary())
            }
            EntryCommand::Help => Ok(HELP.to_string()),
        }
    }

    /// Reloads the roster so a re-initialized election is entered against
    /// its current positions. Failures keep the cached roster.
    async fn refresh_roster(&mut self) {
        let snapshot =
            match election::load_snapshot(self.store.as_ref(), &self.catalog, self.default_ballot_number).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Keeping cached roster, reload failed: {}", e);
                    return;
                }
            };
        let roster = Roster::from_snapshot(&snapshot);
        if roster.is_empty() {
            warn!("Stored election has no positions, keeping cached roster");
            return;
        }
        if roster != **self.selection.roster() {
            info!("Roster changed, now {} position(s)", snapshot.positions.len());
            self.selection.replace_roster(Arc::new(roster));
        }
    }

    fn toggle(&mut self, position_id: &str, candidate_id: &str) -> String {
        let was_selected = self.selection.is_selected(position_id, candidate_id);
        if !self.selection.toggle(position_id, candidate_id) {
            if !self.selection.roster().contains(position_id, candidate_id) {
                return format!("No candidate {} in {}.", candidate_id, position_id);
            }
            return format!("{} is full, deselect someone first.", position_id);
        }
        let verb = if was_selected { "Deselected" } else { "Selected" };
        let check = self.selection.validate();
        let progress = check
            .position(position_id)
            .map(|p| format!(" ({}/{})", p.selected, p.required))
            .unwrap_or_default();
        format!("{} {} in {}{}", verb, candidate_id, position_id, progress)
    }

    fn status(&self) -> String {
        let check = self.selection.validate();
        let mut status = String::new();
        for position in &check.positions {
            let _ = writeln!(
                status,
                "  {} ({}/{}): {}",
                position.position_name,
                position.selected,
                position.required,
                self.selection.selected_in(&position.position_id).join(", ")
            );
        }
        if check.valid {
            status.push_str("Ready to submit.");
        } else {
            let _ = write!(status, "Not ready: {}", check);
        }
        status
    }
}
