use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the catalog table and its indexes if they are absent.
///
/// `externalname` and `hash` are part of the identity key and are stored as
/// empty strings rather than NULL: SQLite treats NULLs as distinct inside a
/// UNIQUE constraint, which would let duplicates through.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
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
            modified INTEGER,
            CONSTRAINT files_identity UNIQUE (path, machine, ip, external, externalname, hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_name ON files(name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_filetype ON files(filetype)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_machine ON files(machine)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_filemime ON files(filemime)")
        .execute(pool)
        .await?;

    Ok(())
}
