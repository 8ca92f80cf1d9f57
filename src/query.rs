//! Catalog query engine.
//!
//! Turns untrusted string parameters (typically an HTTP query string) into
//! a bounded, deterministically ordered view of the catalog plus the facet
//! lists used to populate filter choices.
//!
//! # Parameters
//!
//! | Parameter | Allowed characters | Default | Effect |
//! |-----------|--------------------|---------|--------|
//! | `limit` | digits | `100` if empty or longer than 4 digits | row cap |
//! | `order_by` | letters | `name` | sort column (allow-listed) |
//! | `order` | letters | `desc` unless exactly `asc` | sort direction |
//! | `filetype` | letters | unset | exact match; `*` or empty = any |
//! | `machine` | letters | unset | exact match; `*` or empty = any |
//! | `filemime` | letters, digits, `/ ; - = _` and space | unset | exact match; `*` or empty = any |
//!
//! Every value passes through its allow-list before use. Filter values are
//! bound as statement parameters; the sort column is chosen from a fixed
//! list, never interpolated from input.

use serde::Serialize;
use sqlx::sqlite::SqliteArguments;
use sqlx::Arguments;
use std::collections::HashMap;

use crate::models::Record;
use crate::store::{self, Catalog, RECORD_COLUMNS};

pub const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT_DIGITS: usize = 4;
const DEFAULT_ORDER_BY: &str = "name";

/// Columns a caller may sort by.
const SORTABLE_COLUMNS: &[&str] = &[
    "id", "name", "path", "size", "isdir", "machine", "ip", "filetype", "filemime", "modified",
];

/// Sanitized query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryParams {
    pub limit: i64,
    pub order_by: String,
    pub ascending: bool,
    pub filetype: Option<String>,
    pub machine: Option<String>,
    pub filemime: Option<String>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            order_by: DEFAULT_ORDER_BY.to_string(),
            ascending: false,
            filetype: None,
            machine: None,
            filemime: None,
        }
    }
}

fn keep(raw: &str, allowed: impl Fn(char) -> bool) -> String {
    raw.chars().filter(|c| allowed(*c)).collect()
}

fn is_mime_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | ';' | '-' | '=' | '_' | ' ')
}

/// `*` and empty both mean "no filter".
fn filter_value(sanitized: String) -> Option<String> {
    if sanitized.is_empty() || sanitized == "*" {
        None
    } else {
        Some(sanitized)
    }
}

impl QueryParams {
    pub fn from_raw(raw: &HashMap<String, String>) -> Self {
        let get = |key: &str| raw.get(key).map(String::as_str).unwrap_or("");

        let limit_digits = keep(get("limit"), |c| c.is_ascii_digit());
        let limit = if limit_digits.is_empty() || limit_digits.len() > MAX_LIMIT_DIGITS {
            DEFAULT_LIMIT
        } else {
            limit_digits.parse().unwrap_or(DEFAULT_LIMIT)
        };

        let order_by = keep(get("order_by"), |c| c.is_ascii_alphabetic());
        let order_by = if SORTABLE_COLUMNS.contains(&order_by.as_str()) {
            order_by
        } else {
            DEFAULT_ORDER_BY.to_string()
        };

        let ascending = keep(get("order"), |c| c.is_ascii_alphabetic()) == "asc";

        Self {
            limit,
            order_by,
            ascending,
            filetype: filter_value(keep(get("filetype"), |c| c.is_ascii_alphabetic())),
            machine: filter_value(keep(get("machine"), |c| c.is_ascii_alphabetic())),
            filemime: filter_value(keep(get("filemime"), is_mime_char)),
        }
    }

    fn direction(&self) -> &'static str {
        if self.ascending {
            "ASC"
        } else {
            "DESC"
        }
    }

    fn filters(&self) -> Vec<(&'static str, &str)> {
        let mut filters = Vec::new();
        if let Some(v) = &self.filetype {
            filters.push(("filetype", v.as_str()));
        }
        if let Some(v) = &self.machine {
            filters.push(("machine", v.as_str()));
        }
        if let Some(v) = &self.filemime {
            filters.push(("filemime", v.as_str()));
        }
        filters
    }

    /// WHERE clause and its bound values.
    fn where_clause(&self) -> (String, Vec<String>) {
        let filters = self.filters();
        if filters.is_empty() {
            return (String::new(), Vec::new());
        }
        let conditions: Vec<String> = filters
            .iter()
            .map(|(column, _)| format!("{} = ?", column))
            .collect();
        let values = filters.iter().map(|(_, v)| v.to_string()).collect();
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }

    /// Human-readable summary of the active filter set.
    pub fn describe(&self, shown: usize, total: i64) -> String {
        let filters = self.filters();
        let scope = if filters.is_empty() {
            "all files".to_string()
        } else {
            let parts: Vec<String> = filters
                .iter()
                .map(|(column, value)| format!("{} = {}", column, value))
                .collect();
            format!("files where {}", parts.join(" and "))
        };
        format!(
            "Showing {} of {} {}, ordered by {} {} (limit {})",
            shown,
            total,
            scope,
            self.order_by,
            if self.ascending { "ascending" } else { "descending" },
            self.limit
        )
    }
}

/// One result row with its display size.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub record: Record,
    pub human_size: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogView {
    pub rows: Vec<CatalogEntry>,
    /// Rows matching the filters, ignoring the limit.
    pub total: i64,
    pub filetypes: Vec<String>,
    pub machines: Vec<String>,
    pub mimes: Vec<String>,
    pub description: String,
}

/// Runs a query, degrading to an empty view if the catalog cannot be read.
pub async fn run_query(catalog: &Catalog, raw: &HashMap<String, String>) -> CatalogView {
    let params = QueryParams::from_raw(raw);
    match query_catalog(catalog, &params).await {
        Ok(view) => view,
        Err(e) => {
            tracing::error!(error = %e, ?params, "catalog query failed");
            CatalogView {
                description: params.describe(0, 0),
                ..CatalogView::default()
            }
        }
    }
}

pub async fn query_catalog(
    catalog: &Catalog,
    params: &QueryParams,
) -> Result<CatalogView, sqlx::Error> {
    let (where_sql, values) = params.where_clause();

    let mut args = SqliteArguments::default();
    for value in &values {
        args.add(value.clone()).map_err(sqlx::Error::Encode)?;
    }
    args.add(params.limit).map_err(sqlx::Error::Encode)?;

    let sql = format!(
        "SELECT {} FROM files{} ORDER BY {} {}, id ASC LIMIT ?",
        RECORD_COLUMNS,
        where_sql,
        params.order_by,
        params.direction()
    );
    let rows = sqlx::query_with(&sql, args)
        .fetch_all(catalog.pool())
        .await?;

    let rows = rows
        .iter()
        .map(|row| {
            store::record_from_row(row).map(|record| CatalogEntry {
                human_size: human_size(record.size),
                record,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let count_sql = format!("SELECT COUNT(*) FROM files{}", where_sql);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for value in &values {
        count_query = count_query.bind(value);
    }
    let total = count_query.fetch_one(catalog.pool()).await?;

    let description = params.describe(rows.len(), total);

    Ok(CatalogView {
        rows,
        total,
        filetypes: facet(catalog, "filetype").await?,
        machines: facet(catalog, "machine").await?,
        mimes: facet(catalog, "filemime").await?,
        description,
    })
}

/// Distinct non-empty values of `column`, ascending. `column` is always a
/// literal from this module.
async fn facet(catalog: &Catalog, column: &'static str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(&format!(
        "SELECT DISTINCT {col} FROM files WHERE {col} != '' ORDER BY {col} ASC",
        col = column
    ))
    .fetch_all(catalog.pool())
    .await
}

/// Formats a byte count with decimal (base-1000) units: `1500` → `"1.5 kB"`.
///
/// Counts below 10 print as integers; scaled values below 10 keep one
/// decimal place and larger ones none.
pub fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    let bytes = bytes.max(0) as u64;
    if bytes < 10 {
        return format!("{} B", bytes);
    }

    let mut exp = 0;
    let mut scale: u64 = 1;
    while bytes / scale >= 1000 && exp < UNITS.len() - 1 {
        scale *= 1000;
        exp += 1;
    }

    let value = ((bytes as f64 / scale as f64) * 10.0 + 0.5).floor() / 10.0;
    if value < 10.0 {
        format!("{:.1} {}", value, UNITS[exp])
    } else {
        format!("{:.0} {}", value, UNITS[exp])
    }
}

/// CLI entry point: runs a query and prints the view to stdout.
pub async fn run_query_cmd(
    config: &crate::config::Config,
    raw: Vec<(String, String)>,
    json: bool,
) -> anyhow::Result<()> {
    let catalog = Catalog::open(config).await?;
    let raw: HashMap<String, String> = raw.into_iter().collect();
    let view = run_query(&catalog, &raw).await;
    catalog.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("{}", view.description);
    println!();
    if view.rows.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for entry in &view.rows {
        let r = &entry.record;
        println!(
            "{:>10}  {:<8} {:<16} {}{}",
            entry.human_size,
            if r.file_type.is_empty() { "-" } else { &r.file_type },
            r.machine,
            r.path,
            if r.is_dir { "/" } else { "" }
        );
    }
    println!();
    println!("file types: {}", view.filetypes.join(", "));
    println!("machines:   {}", view.machines.join(", "));
    println!("mime types: {}", view.mimes.join(", "));

    Ok(())
}
