//! Snapshot decoding and encoding.
//!
//! A snapshot arrives in one of two shapes, told apart by content rather
//! than by any declared type:
//!
//! | Shape | Detection | Decoding |
//! |-------|-----------|----------|
//! | Relational | file starts with the SQLite magic header | `SELECT * FROM files`, columns mapped by name |
//! | Flat list | anything else | JSON array of [`Record`] objects |
//!
//! Both decoders tolerate schema drift between client versions: unknown
//! columns or keys are ignored, and absent optional ones decode as their
//! zero value.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use std::collections::HashSet;
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::{IngestError, IngestResult};
use crate::models::Record;

/// First 16 bytes of every SQLite database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Name of the inventory table inside a relational snapshot.
pub const SNAPSHOT_TABLE: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Relational,
    FlatList,
}

impl SnapshotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotFormat::Relational => "sqlite",
            SnapshotFormat::FlatList => "json",
        }
    }
}

/// Reads the first bytes of `path` to decide which decoder applies.
pub async fn probe(path: &Path) -> IngestResult<SnapshotFormat> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::decode("opening snapshot", e))?;

    let mut head = [0u8; 16];
    let mut filled = 0;
    while filled < head.len() {
        let n = file
            .read(&mut head[filled..])
            .await
            .map_err(|e| IngestError::decode("reading snapshot header", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == head.len() && &head == SQLITE_MAGIC {
        Ok(SnapshotFormat::Relational)
    } else {
        Ok(SnapshotFormat::FlatList)
    }
}

/// Decodes a staged snapshot into records, in stored order.
pub async fn decode(path: &Path) -> IngestResult<Vec<Record>> {
    let records = match probe(path).await? {
        SnapshotFormat::Relational => decode_relational(path).await?,
        SnapshotFormat::FlatList => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| IngestError::decode("reading snapshot", e))?;
            decode_flat(&bytes)?
        }
    };
    Ok(records)
}

pub fn decode_flat(bytes: &[u8]) -> IngestResult<Vec<Record>> {
    let records: Vec<Record> = serde_json::from_slice(bytes)
        .map_err(|e| IngestError::decode("parsing flat list snapshot", e))?;
    Ok(records.into_iter().map(Record::with_derived_name).collect())
}

pub fn encode_flat(records: &[Record]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(records)
}

async fn decode_relational(path: &Path) -> IngestResult<Vec<Record>> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .disable_statement_logging();

    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .map_err(|e| IngestError::decode("opening relational snapshot", e))?;

    let result = read_relational(&mut conn).await;
    let _ = conn.close().await;
    result
}

async fn read_relational(conn: &mut SqliteConnection) -> IngestResult<Vec<Record>> {
    let column_rows = sqlx::query("SELECT name FROM pragma_table_info(?)")
        .bind(SNAPSHOT_TABLE)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| IngestError::decode("reading snapshot schema", e))?;

    let columns: HashSet<String> = column_rows
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()
        .map_err(|e| IngestError::decode("reading snapshot schema", e))?;

    if columns.is_empty() {
        return Err(IngestError::Decode(format!(
            "snapshot has no '{}' table",
            SNAPSHOT_TABLE
        )));
    }
    for required in ["path", "machine", "ip"] {
        if !columns.contains(required) {
            return Err(IngestError::Decode(format!(
                "snapshot table is missing required column '{}'",
                required
            )));
        }
    }

    let rows = sqlx::query(&format!("SELECT * FROM {}", SNAPSHOT_TABLE))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| IngestError::decode("reading snapshot rows", e))?;

    let columns = Columns(&columns);
    rows.iter()
        .map(|row| columns.record(row))
        .collect::<IngestResult<Vec<_>>>()
}

/// Column-name lookup that treats absent columns as NULL.
struct Columns<'a>(&'a HashSet<String>);

impl Columns<'_> {
    fn get<T>(&self, row: &SqliteRow, name: &str) -> IngestResult<Option<T>>
    where
        T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        if !self.0.contains(name) {
            return Ok(None);
        }
        row.try_get::<Option<T>, _>(name)
            .map_err(|e| IngestError::decode(&format!("column '{}'", name), e))
    }

    fn text(&self, row: &SqliteRow, name: &str) -> IngestResult<String> {
        Ok(self.get::<String>(row, name)?.unwrap_or_default())
    }

    fn flag(&self, row: &SqliteRow, name: &str) -> IngestResult<bool> {
        Ok(self.get::<i64>(row, name)?.unwrap_or(0) != 0)
    }

    /// Unix seconds, or an RFC 3339 string as some clients store it.
    fn timestamp(&self, row: &SqliteRow, name: &str) -> IngestResult<Option<i64>> {
        if let Ok(value) = self.get::<i64>(row, name) {
            return Ok(value);
        }
        let text = self.get::<String>(row, name)?;
        Ok(text.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.timestamp())
        }))
    }

    fn record(&self, row: &SqliteRow) -> IngestResult<Record> {
        let record = Record {
            id: None,
            name: self.text(row, "name")?,
            path: self.text(row, "path")?,
            size: self.get::<i64>(row, "size")?.unwrap_or(0),
            is_dir: self.flag(row, "isdir")?,
            machine: self.text(row, "machine")?,
            ip: self.text(row, "ip")?,
            on_external_source: self.flag(row, "external")?,
            external_name: self.text(row, "externalname")?,
            file_type: self.text(row, "filetype")?,
            file_mime: self.text(row, "filemime")?,
            content_hash: self.text(row, "hash")?,
            modified_at: self.timestamp(row, "modified")?,
        };
        Ok(record.with_derived_name())
    }
}

/// Writes `records` as a self-contained relational snapshot at `path`.
///
/// The file uses the rollback journal so the whole database lives in the
/// single file that gets transferred.
pub async fn write_relational(path: &Path, records: &[Record]) -> anyhow::Result<()> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .disable_statement_logging();

    let mut conn = SqliteConnection::connect_with(&options).await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id INTEGER NOT NULL PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            isdir INTEGER NOT NULL,
            machine TEXT NOT NULL,
            ip TEXT NOT NULL,
            external INTEGER NOT NULL DEFAULT 0,
            externalname TEXT NOT NULL DEFAULT '',
            filetype TEXT NOT NULL DEFAULT '',
            filemime TEXT NOT NULL DEFAULT '',
            hash TEXT NOT NULL DEFAULT '',
            modified INTEGER
        )
        "#,
        SNAPSHOT_TABLE
    ))
    .execute(&mut conn)
    .await?;

    let mut tx = conn.begin().await?;
    for record in records {
        sqlx::query(&format!(
            "INSERT INTO {} (name, path, size, isdir, machine, ip, external, externalname, \
             filetype, filemime, hash, modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SNAPSHOT_TABLE
        ))
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
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    conn.close().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_records() -> Vec<Record> {
        let mut pdf = Record::new("/home/ana/report.pdf", 1500, "ana-laptop", "10.0.0.2");
        pdf.file_type = "pdf".to_string();
        pdf.file_mime = "application/pdf".to_string();
        pdf.content_hash = "ab12".to_string();
        pdf.modified_at = Some(1_700_000_000);

        let mut dir = Record::new("/home/ana", 4096, "ana-laptop", "10.0.0.2");
        dir.is_dir = true;

        let mut usb = Record::new("/media/usb/photo.jpg", 99, "ana-laptop", "10.0.0.2");
        usb.on_external_source = true;
        usb.external_name = "KINGSTON".to_string();

        vec![pdf, dir, usb]
    }

    fn sorted(mut records: Vec<Record>) -> Vec<Record> {
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    #[tokio::test]
    async fn test_relational_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snap.db");
        write_relational(&path, &sample_records()).await.unwrap();

        assert_eq!(probe(&path).await.unwrap(), SnapshotFormat::Relational);
        let decoded = decode(&path).await.unwrap();
        assert_eq!(sorted(decoded), sorted(sample_records()));
    }

    #[tokio::test]
    async fn test_flat_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snap.json");
        std::fs::write(&path, encode_flat(&sample_records()).unwrap()).unwrap();

        assert_eq!(probe(&path).await.unwrap(), SnapshotFormat::FlatList);
        let decoded = decode(&path).await.unwrap();
        assert_eq!(sorted(decoded), sorted(sample_records()));
    }

    #[tokio::test]
    async fn test_older_relational_schema_defaults_missing_columns() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("old.db");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query(
            "CREATE TABLE files (id integer NOT NULL primary key, name text NOT NULL, \
             path text NOT NULL, size integer NOT NULL, isdir integer NOT NULL, \
             machine text NOT NULL, ip text NOT NULL, owner text)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO files (name, path, size, isdir, machine, ip, owner) \
             VALUES ('a.txt', '/a.txt', 12, 0, 'box', '10.0.0.9', 'root')",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        conn.close().await.unwrap();

        let decoded = decode(&path).await.unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "a.txt");
        assert_eq!(decoded[0].size, 12);
        assert_eq!(decoded[0].content_hash, "");
        assert_eq!(decoded[0].file_mime, "");
        assert_eq!(decoded[0].modified_at, None);
        assert!(!decoded[0].on_external_source);
    }

    #[tokio::test]
    async fn test_relational_without_files_table_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("other.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query("CREATE TABLE notes (body TEXT)")
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();

        let err = decode(&path).await.unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("junk.bin");
        std::fs::write(&path, b"\x00\x01not a snapshot").unwrap();

        let err = decode(&path).await.unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));
    }

    #[test]
    fn test_flat_list_derives_missing_name() {
        let records =
            decode_flat(br#"[{"path":"/srv/data/x.csv","size":3,"isdir":0,"machine":"m","ip":"i"}]"#)
                .unwrap();
        assert_eq!(records[0].name, "x.csv");
    }
}
