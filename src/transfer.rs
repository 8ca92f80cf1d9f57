//! Fixed-header bulk transfer protocol.
//!
//! One stream connection carries exactly one snapshot:
//!
//! ```text
//! +------------------+--------------------------+-------------------+
//! | size (10 bytes)  | name (64 bytes)          | payload           |
//! | ASCII decimal,   | UTF-8, ':'-padded        | exactly `size`    |
//! | ':'-padded       |                          | bytes, last chunk |
//! |                  |                          | padded to 2048    |
//! +------------------+--------------------------+-------------------+
//! ```
//!
//! There is no acknowledgement, checksum or retry. The receiver bounds every
//! read with a deadline and never hands a partial payload to the codec.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::config::ReceiverConfig;
use crate::error::{IngestError, IngestResult};

pub const SIZE_FIELD_LEN: usize = 10;
pub const NAME_FIELD_LEN: usize = 64;
pub const CHUNK_SIZE: usize = 2048;
pub const PAD: u8 = b':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub size: u64,
    pub name: String,
}

/// A fully received payload waiting on disk for decoding.
#[derive(Debug, Clone)]
pub struct StagedSnapshot {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Reads exactly `buf.len()` bytes under `deadline`, looping over short reads.
async fn read_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Duration,
    what: &str,
) -> IngestResult<()>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(deadline, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(IngestError::connection(what, e)),
        Err(_) => Err(IngestError::Connection(format!(
            "{}: timed out after {}s",
            what,
            deadline.as_secs()
        ))),
    }
}

fn trim_field(field: &[u8]) -> &[u8] {
    let is_pad = |b: &u8| *b == PAD || *b == 0 || b.is_ascii_whitespace();
    let start = field.iter().position(|b| !is_pad(b)).unwrap_or(field.len());
    let end = field.iter().rposition(|b| !is_pad(b)).map_or(start, |i| i + 1);
    &field[start..end]
}

pub fn parse_size(field: &[u8]) -> IngestResult<u64> {
    let digits = trim_field(field);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(IngestError::Connection(format!(
            "invalid size field: {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| IngestError::Connection("size field out of range".to_string()))
}

/// Trims padding and keeps only the final path component, so a hostile
/// name can never escape the staging directory.
pub fn parse_name(field: &[u8]) -> String {
    let raw = String::from_utf8_lossy(trim_field(field)).to_string();
    let name = crate::models::base_name(&raw);
    let name: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect();
    if name.is_empty() || name == "." || name == ".." {
        "snapshot".to_string()
    } else {
        name
    }
}

pub async fn read_header<R>(reader: &mut R, deadline: Duration) -> IngestResult<TransferHeader>
where
    R: AsyncRead + Unpin,
{
    let mut size_field = [0u8; SIZE_FIELD_LEN];
    read_full(reader, &mut size_field, deadline, "reading size field").await?;
    let size = parse_size(&size_field)?;

    let mut name_field = [0u8; NAME_FIELD_LEN];
    read_full(reader, &mut name_field, deadline, "reading name field").await?;
    let name = parse_name(&name_field);

    Ok(TransferHeader { size, name })
}

/// Receives one snapshot from `reader` into the staging directory.
///
/// On any failure the partial staging file is removed before the error is
/// returned.
pub async fn receive<R>(reader: &mut R, config: &ReceiverConfig) -> IngestResult<StagedSnapshot>
where
    R: AsyncRead + Unpin,
{
    let deadline = config.read_timeout();
    let header = read_header(reader, deadline).await?;

    if header.size > config.max_snapshot_bytes {
        return Err(IngestError::Connection(format!(
            "declared size {} exceeds limit {}",
            header.size, config.max_snapshot_bytes
        )));
    }

    tokio::fs::create_dir_all(&config.staging_dir)
        .await
        .map_err(|e| IngestError::connection("creating staging directory", e))?;

    let path = config
        .staging_dir
        .join(format!("{}-{}", Uuid::new_v4(), header.name));

    tracing::debug!(name = %header.name, size = header.size, path = %path.display(), "receiving snapshot");

    match copy_payload(reader, &path, header.size, deadline).await {
        Ok(()) => Ok(StagedSnapshot {
            name: header.name,
            path,
            size: header.size,
        }),
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %rm, "could not remove partial staging file");
                }
            }
            Err(e)
        }
    }
}

async fn copy_payload<R>(
    reader: &mut R,
    path: &Path,
    size: u64,
    deadline: Duration,
) -> IngestResult<()>
where
    R: AsyncRead + Unpin,
{
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| IngestError::connection("creating staging file", e))?;
    let mut writer = BufWriter::new(file);
    let mut buf = [0u8; CHUNK_SIZE];
    let mut received: u64 = 0;

    while received < size {
        let remaining = size - received;
        let n = if remaining < CHUNK_SIZE as u64 {
            remaining as usize
        } else {
            CHUNK_SIZE
        };

        read_full(reader, &mut buf[..n], deadline, "reading payload").await?;
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| IngestError::connection("writing staging file", e))?;
        received += n as u64;

        if n < CHUNK_SIZE {
            drain_padding(reader, CHUNK_SIZE - n, deadline).await;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| IngestError::connection("flushing staging file", e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| IngestError::connection("syncing staging file", e))?;

    Ok(())
}

/// Discards the pad bytes senders append to their final chunk. The payload
/// is already complete here, so a sender that closes early is only logged.
async fn drain_padding<R>(reader: &mut R, pad: usize, deadline: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; CHUNK_SIZE];
    let mut left = pad;
    while left > 0 {
        match tokio::time::timeout(deadline, reader.read(&mut scratch[..left])).await {
            Ok(Ok(0)) => {
                tracing::debug!(missing = left, "sender closed before final chunk padding");
                return;
            }
            Ok(Ok(n)) => left -= n,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "error while draining final chunk padding");
                return;
            }
            Err(_) => {
                tracing::debug!(missing = left, "timed out draining final chunk padding");
                return;
            }
        }
    }
}

fn padded_field(value: &str, width: usize) -> std::io::Result<Vec<u8>> {
    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() > width {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("'{}' does not fit in a {}-byte header field", value, width),
        ));
    }
    bytes.resize(width, PAD);
    Ok(bytes)
}

/// Longest prefix of `name` that fits the name field on a char boundary.
fn fit_name(name: &str) -> &str {
    if name.len() <= NAME_FIELD_LEN {
        return name;
    }
    let mut end = NAME_FIELD_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Sends one snapshot: header, then `size` bytes from `source`, with the
/// last chunk padded to [`CHUNK_SIZE`].
pub async fn send_snapshot<R, W>(
    writer: &mut W,
    name: &str,
    size: u64,
    source: &mut R,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&padded_field(&size.to_string(), SIZE_FIELD_LEN)?)
        .await?;
    writer
        .write_all(&padded_field(fit_name(name), NAME_FIELD_LEN)?)
        .await?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    while sent < size {
        let n = (size - sent).min(CHUNK_SIZE as u64) as usize;
        source.read_exact(&mut buf[..n]).await?;
        if n < CHUNK_SIZE {
            buf[n..].fill(0);
        }
        writer.write_all(&buf).await?;
        sent += n as u64;
    }

    writer.flush().await?;
    Ok(())
}

/// Connects to a collector and sends the file at `path`.
pub async fn send_file(addr: &str, path: &Path, name: Option<&str>) -> anyhow::Result<u64> {
    use anyhow::Context;

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open snapshot: {}", path.display()))?;
    let size = file.metadata().await?.len();
    let name = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot".to_string()),
    };

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to collector at {}", addr))?;
    send_snapshot(&mut stream, &name, size, &mut file).await?;
    stream.shutdown().await?;

    Ok(size)
}
