//! SQLite-backed catalog handle.
//!
//! [`Catalog`] is the single shared store every component receives
//! explicitly: the merge engine writes through it, the datagram listener
//! upserts single records through it, and the query engine reads from it.
//!
//! Writers are serialized inside the process by a write lock that is taken
//! before a pooled connection is acquired. At most one connection is ever
//! tied up by ingestion, so queries always find a free connection and read
//! the last committed state under WAL.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::Record;

const INSERT_OR_IGNORE: &str = r#"
    INSERT OR IGNORE INTO files
        (name, path, size, isdir, machine, ip, external, externalname,
         filetype, filemime, hash, modified)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Columns selected whenever full rows are read back.
pub const RECORD_COLUMNS: &str = "id, name, path, size, isdir, machine, ip, external, \
     externalname, filetype, filemime, hash, modified";

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

/// An open `BEGIN IMMEDIATE` transaction holding the catalog write lock.
///
/// Dropping it without [`commit`](WriteTransaction::commit) rolls back.
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteTransaction {
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

impl Catalog {
    /// Opens the configured database and ensures the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        Self::from_pool(pool).await
    }

    pub async fn open_path(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path, Duration::from_secs(30)).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        migrate::ensure_schema(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Waits for the write lock, then opens an immediate transaction so the
    /// SQLite writer lock is taken up front rather than at the first insert.
    pub async fn begin_write(&self) -> Result<WriteTransaction, sqlx::Error> {
        let guard = self.write_lock.clone().lock_owned().await;
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(WriteTransaction { tx, _guard: guard })
    }

    /// Inserts one record unless a row with the same identity exists.
    /// Returns whether a new row was written.
    pub async fn insert_one(&self, record: &Record) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        insert_or_ignore(&self.pool, record).await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await
    }

    /// Every row in insertion order.
    pub async fn all_records(&self) -> Result<Vec<Record>, sqlx::Error> {
        let rows = sqlx::query(&format!("SELECT {} FROM files ORDER BY id ASC", RECORD_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

/// Writes `record` with `INSERT OR IGNORE`; the UNIQUE constraint is the
/// only identity check.
pub async fn insert_or_ignore<'e, E>(executor: E, record: &Record) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(INSERT_OR_IGNORE)
        .bind(&record.name)
        .bind(&record.path)
        .bind(record.size)
        .bind(record.is_dir)
        .bind(&record.machine)
        .bind(&record.ip)
        .bind(record.on_external_source)
        .bind(&record.external_name)
        .bind(&record.file_type)
        .bind(&record.file_mime)
        .bind(&record.content_hash)
        .bind(record.modified_at)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub fn record_from_row(row: &SqliteRow) -> Result<Record, sqlx::Error> {
    Ok(Record {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        size: row.try_get("size")?,
        is_dir: row.try_get("isdir")?,
        machine: row.try_get("machine")?,
        ip: row.try_get("ip")?,
        on_external_source: row.try_get("external")?,
        external_name: row.try_get("externalname")?,
        file_type: row.try_get("filetype")?,
        file_mime: row.try_get("filemime")?,
        content_hash: row.try_get("hash")?,
        modified_at: row.try_get("modified")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.sqlite");

        let first = Catalog::open_path(&path).await.unwrap();
        first.insert_one(&Record::new("/a", 1, "m", "ip")).await.unwrap();
        first.close().await;

        let second = Catalog::open_path(&path).await.unwrap();
        assert_eq!(second.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_one_first_write_wins() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&tmp.path().join("c.sqlite")).await.unwrap();

        assert!(catalog.insert_one(&Record::new("/a", 10, "m", "ip")).await.unwrap());
        assert!(!catalog.insert_one(&Record::new("/a", 99, "m", "ip")).await.unwrap());

        let rows = catalog.all_records().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size, 10);
        assert!(rows[0].id.is_some());
    }

    #[tokio::test]
    async fn test_external_source_is_part_of_identity() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&tmp.path().join("c.sqlite")).await.unwrap();

        let mut usb = Record::new("/media/photo.jpg", 10, "m", "ip");
        usb.on_external_source = true;
        usb.external_name = "usb-1".to_string();
        let mut other_usb = usb.clone();
        other_usb.external_name = "usb-2".to_string();

        assert_ne!(usb.identity(), other_usb.identity());

        assert!(catalog.insert_one(&Record::new("/media/photo.jpg", 10, "m", "ip")).await.unwrap());
        assert!(catalog.insert_one(&usb).await.unwrap());
        assert!(catalog.insert_one(&other_usb).await.unwrap());
        assert!(!catalog.insert_one(&usb).await.unwrap());
        assert_eq!(catalog.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_query_reads_while_write_is_open() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&tmp.path().join("c.sqlite")).await.unwrap();
        catalog.insert_one(&Record::new("/before", 1, "m", "ip")).await.unwrap();

        let mut write = catalog.begin_write().await.unwrap();
        insert_or_ignore(write.connection(), &Record::new("/pending", 1, "m", "ip"))
            .await
            .unwrap();

        // Further writers queue on the lock without taking pool connections.
        let mut queued = Vec::new();
        for i in 0..6 {
            let catalog = catalog.clone();
            queued.push(tokio::spawn(async move {
                catalog
                    .insert_one(&Record::new(format!("/queued{}", i), 1, "m", "ip"))
                    .await
                    .unwrap()
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let count = tokio::time::timeout(Duration::from_secs(5), catalog.count())
            .await
            .expect("read blocked behind writers")
            .unwrap();
        assert_eq!(count, 1);

        write.commit().await.unwrap();
        for q in queued {
            assert!(q.await.unwrap());
        }
        assert_eq!(catalog.count().await.unwrap(), 8);
    }
}
