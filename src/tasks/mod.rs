pub mod connectivity;
pub mod results_feed;

pub use connectivity::{network_signal, ConnectivityMonitor};
pub use results_feed::results_feed_task;
