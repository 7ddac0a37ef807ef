use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Periodically checks that `target` accepts TCP connections and publishes
/// the result on `reachable`. Stops once nobody listens anymore.
pub async fn probe_network_task(target: String, every: Duration, reachable: watch::Sender<bool>) {
    info!("Starting network probe against {} every {:?}", target, every);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if reachable.is_closed() {
            break;
        }
        let up = matches!(
            timeout(PROBE_TIMEOUT.min(every), TcpStream::connect(&target)).await,
            Ok(Ok(_))
        );
        reachable.send_if_modified(|current| {
            if *current == up {
                return false;
            }
            if up {
                info!("Network reachable again ({})", target);
            } else {
                warn!("Network probe to {} failed", target);
            }
            *current = up;
            true
        });
    }
    info!("Network probe stopped");
}

/// Network half of the operational signal. Without a target the network
/// is taken as up for as long as anyone listens.
pub fn network_signal(target: Option<String>, every: Duration) -> watch::Receiver<bool> {
    match target {
        Some(target) => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(probe_network_task(target, every, tx));
            rx
        }
        None => {
            info!("No network check configured, following the store alone");
            let (tx, rx) = watch::channel(true);
            tokio::spawn(async move { tx.closed().await });
            rx
        }
    }
}

/// One "fully operational" signal: the network is up and the store says it
/// is reachable. Advisory only; the store still refuses writes on its own.
pub struct ConnectivityMonitor {
    operational: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl ConnectivityMonitor {
    pub fn spawn(mut network: watch::Receiver<bool>, mut store: watch::Receiver<bool>) -> Self {
        let initial = *network.borrow_and_update() && *store.borrow_and_update();
        let (tx, operational) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            loop {
                let source_alive = tokio::select! {
                    changed = network.changed() => changed.is_ok(),
                    changed = store.changed() => changed.is_ok(),
                };
                if !source_alive {
                    break;
                }
                let net_up = *network.borrow_and_update();
                let store_up = *store.borrow_and_update();
                let next = net_up && store_up;
                tx.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    if next {
                        info!("Station is operational");
                    } else {
                        warn!("Station is not operational (network: {}, store: {})", net_up, store_up);
                    }
                    *current = next;
                    true
                });
            }
            // A signal source went away; nothing can vouch for connectivity.
            tx.send_replace(false);
        });

        Self { operational, handle }
    }

    pub fn is_operational(&self) -> bool {
        *self.operational.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.operational.clone()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
