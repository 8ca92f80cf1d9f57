//! Core data model: one filesystem entry as reported by one client.

use serde::{Deserialize, Deserializer, Serialize};

/// A file or directory observed on a client machine.
///
/// The identity of a record inside the catalog is the tuple returned by
/// [`Record::identity`]; everything else is descriptive and never
/// overwritten once a row exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Catalog surrogate key, set only on rows read back from the catalog.
    /// Client-supplied ids are never trusted.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "isdir", default, deserialize_with = "deserialize_flag")]
    pub is_dir: bool,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub ip: String,
    #[serde(rename = "external", default, deserialize_with = "deserialize_flag")]
    pub on_external_source: bool,
    #[serde(rename = "externalname", default)]
    pub external_name: String,
    #[serde(rename = "filetype", default)]
    pub file_type: String,
    #[serde(rename = "filemime", default)]
    pub file_mime: String,
    #[serde(rename = "hash", default)]
    pub content_hash: String,
    #[serde(rename = "modified", default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

/// Borrowed view of the composite uniqueness key.
pub type RecordIdentity<'a> = (&'a str, &'a str, &'a str, bool, &'a str, &'a str);

impl Record {
    /// Builds a plain file record with every optional field empty.
    pub fn new(
        path: impl Into<String>,
        size: i64,
        machine: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let name = base_name(&path);
        Self {
            id: None,
            name,
            path,
            size,
            is_dir: false,
            machine: machine.into(),
            ip: ip.into(),
            on_external_source: false,
            external_name: String::new(),
            file_type: String::new(),
            file_mime: String::new(),
            content_hash: String::new(),
            modified_at: None,
        }
    }

    /// (path, machine, ip, external, externalname, hash)
    pub fn identity(&self) -> RecordIdentity<'_> {
        (
            &self.path,
            &self.machine,
            &self.ip,
            self.on_external_source,
            &self.external_name,
            &self.content_hash,
        )
    }

    /// Fills a missing base name from the path.
    pub fn with_derived_name(mut self) -> Self {
        if self.name.is_empty() {
            self.name = base_name(&self.path);
        }
        self
    }

    /// Checks the fields the catalog requires. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name is empty".to_string());
        }
        if self.path.is_empty() {
            return Err("path is empty".to_string());
        }
        if self.machine.is_empty() {
            return Err("machine is empty".to_string());
        }
        if self.ip.is_empty() {
            return Err("ip is empty".to_string());
        }
        if self.size < 0 {
            return Err(format!("negative size {}", self.size));
        }
        Ok(())
    }
}

/// Final path component, accepting both `/` and `\` separators since
/// snapshots arrive from any client OS.
pub fn base_name(path: &str) -> String {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Accepts `true`/`false` as well as the integer `0`/`1` encoding older
/// clients send.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(n) => Ok(n != 0),
    }
}
