pub mod entry;

use log::info;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub use entry::{EntryCommand, EntryStation};

const PROMPT: &str = "> ";

// Feeds operator lines to the station until EOF or `quit`
pub async fn run_entry_loop<R, W>(station: &mut EntryStation, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(PROMPT.as_bytes()).await?;
    output.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
            break;
        }
        if !line.is_empty() {
            let reply = station.execute(line).await;
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;
    }
    info!("Entry session ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::test_support::{club_catalog, initialized_store};
    use crate::tally::CommitPolicy;
    use tokio::sync::watch;

    #[tokio::test]
    async fn loop_answers_each_line_and_stops_at_quit() {
        let store = initialized_store().await;
        let (_online, operational) = watch::channel(true);
        let mut station = EntryStation::open(store, club_catalog(), 0, CommitPolicy::default(), operational)
            .await
            .unwrap();

        let input: &[u8] = b"pick head-1\n\nadd finance finance-1\nquit\npick head-2\n";
        let mut output = Vec::new();
        run_entry_loop(&mut station, input, &mut output).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("Selected head-1 in head (1/1)"));
        assert!(output.contains("finance-1 now has 1 vote(s)."));
        assert!(!output.contains("head-2"));
        assert!(station.selection().is_selected("head", "head-1"));
    }
}
