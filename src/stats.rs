//! Catalog statistics.
//!
//! Provides a quick summary of what has been collected: row counts, total
//! bytes, and a per-machine breakdown. Used by `gofi stats` to confirm that
//! snapshots are arriving and merging as expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::query::human_size;
use crate::store::Catalog;

#[derive(Debug, Clone, Serialize)]
pub struct MachineStats {
    pub machine: String,
    pub ip: String,
    pub files: i64,
    pub directories: i64,
    pub external: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub records: i64,
    pub bytes: i64,
    pub hashed: i64,
    pub machines: Vec<MachineStats>,
}

pub async fn collect_stats(catalog: &Catalog) -> Result<CatalogStats> {
    let totals = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS records,
            COALESCE(SUM(CASE WHEN isdir = 0 THEN size ELSE 0 END), 0) AS bytes,
            COALESCE(SUM(CASE WHEN hash != '' THEN 1 ELSE 0 END), 0) AS hashed
        FROM files
        "#,
    )
    .fetch_one(catalog.pool())
    .await?;

    let machine_rows = sqlx::query(
        r#"
        SELECT
            machine,
            ip,
            SUM(CASE WHEN isdir = 0 THEN 1 ELSE 0 END) AS files,
            SUM(CASE WHEN isdir != 0 THEN 1 ELSE 0 END) AS directories,
            SUM(CASE WHEN external != 0 THEN 1 ELSE 0 END) AS external,
            COALESCE(SUM(CASE WHEN isdir = 0 THEN size ELSE 0 END), 0) AS bytes
        FROM files
        GROUP BY machine, ip
        ORDER BY machine ASC, ip ASC
        "#,
    )
    .fetch_all(catalog.pool())
    .await?;

    let machines = machine_rows
        .iter()
        .map(|row| MachineStats {
            machine: row.get("machine"),
            ip: row.get("ip"),
            files: row.get("files"),
            directories: row.get("directories"),
            external: row.get("external"),
            bytes: row.get("bytes"),
        })
        .collect();

    Ok(CatalogStats {
        records: totals.get("records"),
        bytes: totals.get("bytes"),
        hashed: totals.get("hashed"),
        machines,
    })
}

/// Run the stats command: query the catalog and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let catalog = Catalog::open(config).await?;
    let stats = collect_stats(&catalog).await?;
    catalog.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len() as i64)
        .unwrap_or(0);

    println!("gofi: Catalog Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", human_size(db_size));
    println!();
    println!("  Records:     {}", stats.records);
    println!("  Content:     {}", human_size(stats.bytes));
    println!(
        "  Hashed:      {} / {} ({}%)",
        stats.hashed,
        stats.records,
        if stats.records > 0 {
            (stats.hashed * 100) / stats.records
        } else {
            0
        }
    );

    if !stats.machines.is_empty() {
        println!();
        println!("  By machine:");
        println!(
            "  {:<20} {:<16} {:>8} {:>6} {:>8} {:>10}",
            "MACHINE", "IP", "FILES", "DIRS", "EXTERNAL", "SIZE"
        );
        println!("  {}", "-".repeat(74));

        for m in &stats.machines {
            println!(
                "  {:<20} {:<16} {:>8} {:>6} {:>8} {:>10}",
                m.machine,
                m.ip,
                m.files,
                m.directories,
                m.external,
                human_size(m.bytes)
            );
        }
    }

    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collect_stats_per_machine() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&tmp.path().join("c.sqlite")).await.unwrap();

        let mut dir = Record::new("/home", 4096, "alpha", "10.0.0.1");
        dir.is_dir = true;
        let mut hashed = Record::new("/home/a", 1000, "alpha", "10.0.0.1");
        hashed.content_hash = "ff".to_string();
        for r in [dir, hashed, Record::new("/srv/b", 500, "beta", "10.0.0.2")] {
            catalog.insert_one(&r).await.unwrap();
        }

        let stats = collect_stats(&catalog).await.unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.bytes, 1500);
        assert_eq!(stats.hashed, 1);
        assert_eq!(stats.machines.len(), 2);
        assert_eq!(stats.machines[0].machine, "alpha");
        assert_eq!(stats.machines[0].files, 1);
        assert_eq!(stats.machines[0].directories, 1);
        assert_eq!(stats.machines[1].bytes, 500);
    }

    #[tokio::test]
    async fn test_empty_catalog() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&tmp.path().join("c.sqlite")).await.unwrap();
        let stats = collect_stats(&catalog).await.unwrap();
        assert_eq!(stats.records, 0);
        assert_eq!(stats.bytes, 0);
        assert!(stats.machines.is_empty());
    }
}
