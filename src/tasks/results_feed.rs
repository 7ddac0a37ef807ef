use chrono::Local;
use log::{info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::election::SnapshotFeed;
use crate::models::ElectionSnapshot;
use crate::voting::results;

pub fn render(snapshot: &ElectionSnapshot) -> String {
    let mut screen = format!("===== Results at {} =====\n", Local::now().format("%H:%M:%S"));
    if !snapshot.is_empty() && !snapshot.is_active {
        screen.push_str("(election closed)\n");
    }
    screen.push_str(&results::tally(snapshot).summary());
    screen
}

/// Redraws the results on `out` every time the election changes. Returns
/// when the feed ends or `out` can no longer be written.
pub async fn results_feed_task<W>(mut feed: SnapshotFeed, mut out: W) -> W
where
    W: AsyncWrite + Unpin,
{
    info!("Results display started");
    while let Some(snapshot) = feed.next().await {
        let screen = render(&snapshot);
        if let Err(e) = out.write_all(screen.as_bytes()).await {
            warn!("Results display stopped: {}", e);
            return out;
        }
        if let Err(e) = out.flush().await {
            warn!("Results display stopped: {}", e);
            return out;
        }
    }
    info!("Election feed closed");
    out
}
