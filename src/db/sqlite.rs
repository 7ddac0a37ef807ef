use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Row, Sqlite,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::notify::SubscriberHub;
use super::{tree, Store, StoreError, StorePath, Subscription, WriteBatch};

/// How long a connection waits for another station's write lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

// Primary result codes for "database is locked".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// SQLite-backed store. The tree is kept as one row per leaf, keyed by the
/// leaf's full path; batches run inside a single write transaction.
///
/// Several stations may open the same database file. A background watcher
/// notices their commits through `PRAGMA data_version` and pushes the
/// affected subtrees to local subscribers.
pub struct SqliteStore {
    pool: SqlitePool,
    hub: Arc<SubscriberHub>,
    online: watch::Sender<bool>,
    // Orders commits, subscription registration and watcher pushes inside this process.
    write_lock: Arc<Mutex<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl SqliteStore {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        Self::open(db_url, DEFAULT_BUSY_TIMEOUT).await
    }

    pub async fn open(db_url: &str, busy_timeout: Duration) -> Result<Self, StoreError> {
        let in_memory = db_url.contains(":memory:");

        // Create database if it doesn't exist
        let mut options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .busy_timeout(busy_timeout);
        if !in_memory {
            // Readers in other stations keep going while one of them writes.
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to an in-memory database would see its own copy.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;
        info!("Opened database {}", db_url);

        Self::init_schema(&pool).await?;

        let hub = Arc::new(SubscriberHub::default());
        let write_lock = Arc::new(Mutex::new(()));
        let watcher = (!in_memory).then(|| {
            tokio::spawn(watch_external_commits(
                pool.clone(),
                Arc::downgrade(&hub),
                write_lock.clone(),
            ))
        });

        let (online, _) = watch::channel(true);
        Ok(Self {
            pool,
            hub,
            online,
            write_lock,
            watcher,
        })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                path TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Records the outcome of a backend call on the connectivity signal.
    /// Lock contention proves the database is there, so it never counts as
    /// an outage.
    fn observe<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match &result {
            Ok(_) | Err(StoreError::Conflict(_)) | Err(StoreError::Busy(_)) | Err(StoreError::Codec(_)) => {
                self.online.send_if_modified(|online| !std::mem::replace(online, true));
            }
            Err(e) => {
                error!("SQLite store failure: {}", e);
                self.online.send_if_modified(|online| std::mem::replace(online, false));
            }
        }
        result
    }

    async fn read_subtree(
        conn: &mut SqliteConnection,
        path: &StorePath,
    ) -> Result<Option<Value>, StoreError> {
        let key = path.to_string();
        let rows = if path.is_root() {
            sqlx::query("SELECT path, value FROM nodes")
                .fetch_all(&mut *conn)
                .await?
        } else {
            let prefix = format!("{}/", key);
            sqlx::query("SELECT path, value FROM nodes WHERE path = ?1 OR substr(path, 1, ?2) = ?3")
                .bind(&key)
                .bind(prefix.chars().count() as i64)
                .bind(&prefix)
                .fetch_all(&mut *conn)
                .await?
        };
        if rows.is_empty() {
            return Ok(None);
        }

        let depth = path.segments().len();
        let mut subtree = Value::Null;
        for row in rows {
            let leaf_path = StorePath::parse(&row.get::<String, _>("path"));
            let relative = StorePath::parse(&leaf_path.segments()[depth..].join("/"));
            let value: Value = serde_json::from_str(&row.get::<String, _>("value"))?;
            tree::set(&mut subtree, &relative, value);
        }
        Ok(if subtree.is_null() { None } else { Some(subtree) })
    }

    async fn replace_subtree(
        conn: &mut SqliteConnection,
        path: &StorePath,
        value: &Value,
    ) -> Result<(), StoreError> {
        let key = path.to_string();
        let prefix = format!("{}/", key);
        if path.is_root() {
            sqlx::query("DELETE FROM nodes").execute(&mut *conn).await?;
        } else {
            sqlx::query("DELETE FROM nodes WHERE path = ?1 OR substr(path, 1, ?2) = ?3")
                .bind(&key)
                .bind(prefix.chars().count() as i64)
                .bind(&prefix)
                .execute(&mut *conn)
                .await?;
        }

        // A leaf sitting on an ancestor would shadow the new subtree.
        let segments = path.segments();
        for end in 0..segments.len() {
            sqlx::query("DELETE FROM nodes WHERE path = ?")
                .bind(segments[..end].join("/"))
                .execute(&mut *conn)
                .await?;
        }

        for (leaf, leaf_value) in tree::flatten(path, value) {
            sqlx::query("INSERT INTO nodes (path, value) VALUES (?, ?)")
                .bind(leaf.to_string())
                .bind(serde_json::to_string(&leaf_value)?)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn commit_inner(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        // Take the write lock up front so the preconditions are checked
        // against what this transaction will overwrite.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        for (path, expected) in batch.preconditions() {
            let current = Self::read_subtree(&mut tx, path).await?;
            if current != *expected {
                debug!("Precondition failed at {}", path);
                // Dropping the transaction rolls it back.
                return Err(StoreError::Conflict(path.clone()));
            }
        }
        for (path, value) in batch.updates() {
            Self::replace_subtree(&mut tx, path, value).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn notify(&self, touched: &[StorePath]) -> Result<(), StoreError> {
        let paths = self.hub.watched_paths(Some(touched)).await;
        if paths.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        for path in paths {
            let value = Self::read_subtree(&mut conn, &path).await?;
            self.hub.publish(&path, value).await;
        }
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
    }
}

/// Turns "database is locked" into a retryable [`StoreError::Busy`].
fn classify(err: StoreError) -> StoreError {
    if let StoreError::Backend(sqlx::Error::Database(db)) = &err {
        let primary = db.code().and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff);
        if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
            return StoreError::Busy(db.message().to_string());
        }
    }
    err
}

/// Polls the database for commits made through other connections (other
/// stations included) and republishes every subscribed subtree when one
/// lands. Stops once the store is gone.
async fn watch_external_commits(pool: SqlitePool, hub: Weak<SubscriberHub>, write_lock: Arc<Mutex<()>>) {
    let mut ticker = interval(WATCH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // `data_version` is per connection, so the watcher keeps its own.
    let mut conn: Option<PoolConnection<Sqlite>> = None;
    let mut seen: Option<i64> = None;

    loop {
        ticker.tick().await;
        let Some(hub) = hub.upgrade() else {
            break;
        };
        if conn.is_none() {
            match pool.acquire().await {
                Ok(fresh) => {
                    conn = Some(fresh);
                    seen = None;
                }
                Err(e) => {
                    warn!("Change watcher cannot reach the database: {}", e);
                    continue;
                }
            }
        }
        let Some(active) = conn.as_mut() else {
            continue;
        };
        if let Err(e) = publish_external_changes(active, &hub, &write_lock, &mut seen).await {
            warn!("Change watcher dropped its connection: {}", e);
            conn = None;
        }
    }
    debug!("Change watcher stopped");
}

async fn publish_external_changes(
    conn: &mut SqliteConnection,
    hub: &SubscriberHub,
    write_lock: &Mutex<()>,
    seen: &mut Option<i64>,
) -> Result<(), StoreError> {
    let version: i64 = sqlx::query_scalar("PRAGMA data_version")
        .fetch_one(&mut *conn)
        .await?;
    if *seen == Some(version) {
        return Ok(());
    }
    // Local commits publish under the same lock, so a feed never steps back.
    let _guard = write_lock.lock().await;
    for path in hub.watched_paths(None).await {
        let value = SqliteStore::read_subtree(conn, &path).await?;
        hub.publish(&path, value).await;
    }
    *seen = Some(version);
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        let result = async {
            let mut conn = self.pool.acquire().await?;
            Self::read_subtree(&mut conn, path).await
        }
        .await;
        self.observe(result.map_err(classify))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let committed = self.commit_inner(&batch).await.map_err(classify);
        self.observe(committed)?;
        // The batch is in; a failed push must not make the caller retry it.
        if let Err(e) = self.notify(&batch.touched_paths()).await {
            warn!("Committed, but could not notify subscribers: {}", e);
        }
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let _guard = self.write_lock.lock().await;
        let initial = self.read(path).await?;
        Ok(self.hub.register(path, initial).await)
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn subtree_round_trips_through_rows() {
        let store = open().await;
        let election = StorePath::parse("election");
        let value = json!({
            "groups": {"under_age": {"name": "Youth", "winnersCount": 2,
                        "candidates": {"u-1": {"name": "A", "votes": 0, "number": 1}}}},
            "isActive": true,
            "wrongVotes": 0
        });
        store.write(&election, value.clone()).await.unwrap();

        assert_eq!(store.read(&election).await.unwrap(), Some(value));
        assert_eq!(
            store
                .read(&StorePath::parse("election/groups/under_age/candidates/u-1/votes"))
                .await
                .unwrap(),
            Some(json!(0))
        );
        // `_` must not act as a wildcard when matching prefixes.
        assert_eq!(store.read(&StorePath::parse("election/groups/underXage")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_and_remove_subtrees() {
        let store = open().await;
        let log = StorePath::parse("election/voteLog");
        store.write(&log.child("a"), json!({"type": "add"})).await.unwrap();
        store.write(&log.child("b"), json!({"type": "subtract"})).await.unwrap();
        store.write(&log.child("a"), json!({"type": "wrong"})).await.unwrap();
        assert_eq!(
            store.read(&log).await.unwrap(),
            Some(json!({"a": {"type": "wrong"}, "b": {"type": "subtract"}}))
        );

        let mut batch = WriteBatch::new();
        batch.remove(log.clone());
        batch.set(StorePath::parse("election/wrongVotes"), json!(0));
        store.commit(batch).await.unwrap();
        assert_eq!(store.read(&log).await.unwrap(), None);
    }

    #[tokio::test]
    async fn conflicting_batch_rolls_back() {
        let store = open().await;
        let votes = StorePath::parse("election/groups/head/candidates/h1/votes");
        store.write(&votes, json!(4)).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.set(StorePath::parse("election/voteLog/x"), json!({"type": "add"}));
        batch.expect(votes.clone(), Some(json!(3)));
        batch.set(votes.clone(), json!(4));
        assert!(store.commit(batch).await.unwrap_err().is_conflict());
        assert_eq!(store.read(&StorePath::parse("election/voteLog")).await.unwrap(), None);

        let mut batch = WriteBatch::new();
        batch.expect(votes.clone(), Some(json!(4)));
        batch.set(votes.clone(), json!(5));
        store.commit(batch).await.unwrap();
        assert_eq!(store.read(&votes).await.unwrap(), Some(json!(5)));
    }

    #[tokio::test]
    async fn subscriptions_follow_commits() {
        let store = open().await;
        let groups = StorePath::parse("election/groups");
        let mut sub = store.subscribe(&groups).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), None);

        store.write(&groups.child("head").child("name"), json!("Chair")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), Some(json!({"head": {"name": "Chair"}})));
    }

    async fn shared_file() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ballots.db").display());
        (dir, url)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stations_sharing_a_file_count_every_vote() {
        use crate::election;
        use crate::tally::test_support::club_catalog;
        use crate::tally::{CommitPolicy, VoteCounter};

        let (_dir, url) = shared_file().await;
        let first = Arc::new(SqliteStore::connect(&url).await.unwrap());
        let second = Arc::new(SqliteStore::connect(&url).await.unwrap());
        election::initialize(first.as_ref(), &club_catalog(), false).await.unwrap();

        let policy = CommitPolicy {
            max_attempts: 500,
            backoff: Duration::from_millis(1),
        };
        let counters = [
            VoteCounter::new(first.clone(), policy),
            VoteCounter::new(second.clone(), policy),
        ];

        let mut handles = Vec::new();
        for n in 0..40 {
            let counter = counters[n % 2].clone();
            handles.push(tokio::spawn(async move {
                counter.increment("members", "members-7").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(counters[1].tally("members", "members-7").await.unwrap(), 40);
        assert_eq!(election::read_audit_log(second.as_ref()).await.unwrap().len(), 40);
        assert!(*first.connectivity().borrow());
        assert!(*second.connectivity().borrow());
    }

    #[tokio::test]
    async fn held_lock_is_a_retryable_conflict() {
        let (_dir, url) = shared_file().await;
        let store = SqliteStore::open(&url, Duration::from_millis(50)).await.unwrap();
        let other = SqliteStore::connect(&url).await.unwrap();

        let holder = other.pool.begin_with("BEGIN IMMEDIATE").await.unwrap();
        let err = store
            .write(&StorePath::parse("election/wrongVotes"), json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Busy(_)), "{err}");
        assert!(err.is_conflict());
        assert!(*store.connectivity().borrow());

        holder.rollback().await.unwrap();
        store
            .write(&StorePath::parse("election/wrongVotes"), json!(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn display_station_sees_other_station_commits() {
        use crate::election;
        use crate::tally::test_support::club_catalog;
        use crate::tally::{CommitPolicy, VoteCounter};

        let (_dir, url) = shared_file().await;
        let entry = Arc::new(SqliteStore::connect(&url).await.unwrap());
        let display = SqliteStore::connect(&url).await.unwrap();
        election::initialize(entry.as_ref(), &club_catalog(), false).await.unwrap();

        let mut feed = election::watch_election(&display, club_catalog(), 0).await.unwrap();
        let first = feed.next().await.unwrap();
        assert_eq!(first.position("head").unwrap().candidate("head-1").unwrap().votes, 0);

        let counter = VoteCounter::new(entry.clone(), CommitPolicy::default());
        counter.increment("head", "head-1").await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let snapshot = feed.next().await.unwrap();
                if snapshot.position("head").unwrap().candidate("head-1").unwrap().votes == 1 {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.position("head").unwrap().candidate("head-2").unwrap().votes, 0);
    }
}
