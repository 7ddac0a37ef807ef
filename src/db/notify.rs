use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::{StorePath, Subscription};

struct Subscriber {
    path: StorePath,
    tx: mpsc::UnboundedSender<Option<Value>>,
    // Last value pushed, so an unchanged subtree is not pushed twice.
    last: Option<Value>,
}

/// Registry of live subscriptions shared by the store backends.
#[derive(Default)]
pub(crate) struct SubscriberHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriberHub {
    pub async fn register(&self, path: &StorePath, initial: Option<Value>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is still in hand, so the first send cannot fail.
        let _ = tx.send(initial.clone());
        self.subscribers.lock().await.push(Subscriber {
            path: path.clone(),
            tx,
            last: initial,
        });
        Subscription::new(rx)
    }

    /// Distinct subscribed paths overlapping one of `touched`, or every
    /// subscribed path when `touched` is `None`. Dropped subscriptions are
    /// forgotten on the way.
    pub async fn watched_paths(&self, touched: Option<&[StorePath]>) -> Vec<StorePath> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| !s.tx.is_closed());
        let mut paths: Vec<StorePath> = subscribers
            .iter()
            .filter(|s| touched.is_none_or(|touched| touched.iter().any(|t| t.overlaps(&s.path))))
            .map(|s| s.path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Pushes the current value of `path` to its subscribers that have not
    /// seen it yet.
    pub async fn publish(&self, path: &StorePath, value: Option<Value>) {
        let mut subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.iter_mut().filter(|s| &s.path == path) {
            if subscriber.last != value {
                let _ = subscriber.tx.send(value.clone());
                subscriber.last = value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unchanged_values_are_not_pushed_again() {
        let hub = SubscriberHub::default();
        let path = StorePath::parse("election/wrongVotes");
        let mut sub = hub.register(&path, Some(json!(0))).await;
        assert_eq!(sub.recv().await.unwrap(), Some(json!(0)));

        hub.publish(&path, Some(json!(0))).await;
        hub.publish(&path, Some(json!(1))).await;
        hub.publish(&path, Some(json!(1))).await;
        hub.publish(&path, None).await;

        assert_eq!(sub.recv().await.unwrap(), Some(json!(1)));
        assert_eq!(sub.recv().await.unwrap(), None);
        drop(hub);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_subscriptions_are_pruned() {
        let hub = SubscriberHub::default();
        let groups = StorePath::parse("election/groups");
        let sub = hub.register(&groups, None).await;
        let _other = hub.register(&StorePath::parse("election/voteLog"), None).await;

        let touched = [StorePath::parse("election/groups/head/candidates/head-1/votes")];
        assert_eq!(hub.watched_paths(Some(&touched)).await, vec![groups.clone()]);
        assert_eq!(hub.watched_paths(None).await.len(), 2);

        drop(sub);
        assert!(hub.watched_paths(Some(&touched)).await.is_empty());
    }
}
