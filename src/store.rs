use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;
use tracing::warn;

const LOOKUP_SQL: &str = "SELECT 1 FROM blocklist WHERE domain = ?1 LIMIT 1";
const INSERT_BATCH: usize = 900;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocklist connection poisoned")]
    Poisoned,
    #[error("lookup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Read-only membership test against the set of blocked names.
#[async_trait]
pub trait BlocklistStore: Send + Sync {
    /// Storage failures answer "not blocked" so a broken store never drops
    /// or blocks traffic.
    async fn is_blocked(&self, name: &str) -> bool;
}

/// Lowercase, trailing-dot-free form used for both import and lookup.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

pub struct SqliteBlocklist {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBlocklist {
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // fail at startup rather than on the first query when the table is missing
        conn.prepare_cached(LOOKUP_SQL)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn contains(&self, name: &str) -> Result<bool, StoreError> {
        let conn = Arc::clone(&self.conn);
        let name = normalize_name(name);
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let mut stmt = conn.prepare_cached(LOOKUP_SQL)?;
            let hit = stmt
                .query_row(params![name], |_| Ok(()))
                .optional()?;
            Ok(hit.is_some())
        })
        .await?
    }
}

#[async_trait]
impl BlocklistStore for SqliteBlocklist {
    async fn is_blocked(&self, name: &str) -> bool {
        match self.contains(name).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(event = "store_error", qname = %name, error = %err, "blocklist lookup failed, treating as allowed");
                false
            }
        }
    }
}

/// Bulk writer used by the `import` subcommand.
pub struct BlocklistWriter {
    conn: Connection,
}

impl BlocklistWriter {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("CREATE TABLE IF NOT EXISTS blocklist (domain TEXT PRIMARY KEY);")?;
        Ok(Self { conn })
    }

    /// Insert names, ignoring ones already present. Returns how many were new.
    pub fn insert_all<I, S>(&mut self, names: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|n| normalize_name(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();

        let mut inserted = 0;
        for batch in names.chunks(INSERT_BATCH) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare_cached("INSERT OR IGNORE INTO blocklist (domain) VALUES (?1)")?;
                for name in batch {
                    inserted += stmt.execute(params![name])?;
                }
            }
            tx.commit()?;
        }
        Ok(inserted)
    }

    #[cfg(test)]
    fn into_connection(self) -> Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(names: &[&str]) -> SqliteBlocklist {
        let mut writer =
            BlocklistWriter::from_connection(Connection::open_in_memory().expect("open"))
                .expect("schema");
        writer.insert_all(names.iter().copied()).expect("insert");
        SqliteBlocklist::from_connection(writer.into_connection())
    }

    #[test]
    fn normalize_strips_case_and_root_dot() {
        assert_eq!(normalize_name("Ads.Example.COM."), "ads.example.com");
        assert_eq!(normalize_name("  tracker.net "), "tracker.net");
        assert_eq!(normalize_name("."), "");
    }

    #[tokio::test]
    async fn exact_match_only() {
        let store = seeded(&["ads.example.com"]);
        assert!(store.is_blocked("ads.example.com").await);
        assert!(store.is_blocked("ADS.example.com.").await);
        assert!(!store.is_blocked("example.com").await);
        assert!(!store.is_blocked("x.ads.example.com").await);
    }

    #[tokio::test]
    async fn missing_table_fails_open() {
        let store = SqliteBlocklist::from_connection(Connection::open_in_memory().expect("open"));
        assert!(store.contains("ads.example.com").await.is_err());
        assert!(!store.is_blocked("ads.example.com").await);
    }

    #[test]
    fn reimport_is_idempotent() {
        let mut writer =
            BlocklistWriter::from_connection(Connection::open_in_memory().expect("open"))
                .expect("schema");
        let first = writer
            .insert_all(["a.example.com", "b.example.com", "A.example.com"])
            .expect("insert");
        assert_eq!(first, 2);
        let second = writer.insert_all(["a.example.com", "c.example.com"]).expect("insert");
        assert_eq!(second, 1);
    }

    #[test]
    fn large_imports_span_batches() {
        let mut writer =
            BlocklistWriter::from_connection(Connection::open_in_memory().expect("open"))
                .expect("schema");
        let names: Vec<String> = (0..2000).map(|i| format!("host{i}.example.net")).collect();
        assert_eq!(writer.insert_all(&names).expect("insert"), 2000);
    }

    #[tokio::test]
    async fn file_backed_store_opens_read_only() {
        let path = std::env::temp_dir().join(format!(
            "nullroute-store-{}-{}.db",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);
        {
            let mut writer = BlocklistWriter::open(&path).expect("create db");
            writer.insert_all(["tracker.example.org"]).expect("insert");
        }

        let store = SqliteBlocklist::open_read_only(&path).expect("open read-only");
        assert!(store.is_blocked("tracker.example.org").await);
        assert!(!store.is_blocked("example.org").await);

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn read_only_open_rejects_missing_file() {
        let path = std::env::temp_dir().join("nullroute-does-not-exist.db");
        let _ = std::fs::remove_file(&path);
        assert!(SqliteBlocklist::open_read_only(&path).is_err());
    }
}
