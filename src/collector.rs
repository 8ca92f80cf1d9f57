//! Snapshot collector: the network listeners on the ingestion side.
//!
//! - **Stream listener**: every accepted connection gets its own task that
//!   receives one snapshot and merges it. Failures are logged per
//!   connection and never reach the accept loop.
//! - **Datagram listener**: each datagram carries one JSON record, inserted
//!   with the same insert-or-ignore rule. Malformed datagrams are dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::Config;
use crate::merge::{self, MergeSummary};
use crate::models::Record;
use crate::progress::TracingProgress;
use crate::store::Catalog;
use crate::transfer;

/// Largest payload a UDP datagram can carry.
const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Pause after a failed accept; errors such as EMFILE persist until some
/// connection closes.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Calls `accept` until it succeeds, sleeping `backoff` after each failure.
async fn accept_with_backoff<F, Fut, T>(mut accept: F, backoff: Duration) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Accepts transfer connections forever, one task per connection.
pub async fn run_stream_listener(
    listener: TcpListener,
    catalog: Catalog,
    config: Arc<Config>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "snapshot receiver listening");

    loop {
        let (stream, peer) = accept_with_backoff(|| listener.accept(), ACCEPT_BACKOFF).await;

        let catalog = catalog.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Some(summary) = handle_connection(stream, peer, &catalog, &config).await {
                tracing::info!(
                    %peer,
                    processed = summary.processed,
                    inserted = summary.inserted,
                    skipped = summary.skipped,
                    rejected = summary.rejected,
                    "snapshot merged"
                );
            }
        });
    }
}

/// Receives and merges one snapshot. Errors are logged here and turned
/// into `None`; no acknowledgement goes back to the sender.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    catalog: &Catalog,
    config: &Config,
) -> Option<MergeSummary> {
    let staged = match transfer::receive(&mut stream, &config.receiver).await {
        Ok(staged) => staged,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "transfer aborted");
            return None;
        }
    };
    drop(stream);

    tracing::info!(%peer, snapshot = %staged.name, size = staged.size, "snapshot received");

    match merge::ingest_snapshot(
        catalog,
        &staged,
        &TracingProgress,
        config.merge.progress_every,
    )
    .await
    {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::error!(%peer, snapshot = %staged.name, error = %e, "snapshot ingestion failed");
            None
        }
    }
}

/// Receives single-record datagrams forever.
pub async fn run_datagram_listener(socket: UdpSocket, catalog: Catalog) -> anyhow::Result<()> {
    tracing::info!(addr = %socket.local_addr()?, "datagram receiver listening");

    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    let mut received: u64 = 0;

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "datagram receive failed");
                continue;
            }
        };
        received += 1;

        match handle_datagram(&buf[..n], &catalog).await {
            Ok(inserted) => {
                tracing::debug!(%peer, inserted, received, "datagram record");
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "datagram dropped");
            }
        }
    }
}

/// Decodes and upserts one datagram. Returns whether a new row was written.
pub async fn handle_datagram(payload: &[u8], catalog: &Catalog) -> anyhow::Result<bool> {
    let record: Record = serde_json::from_slice(payload)?;
    let record = record.with_derived_name();
    if let Err(reason) = record.validate() {
        anyhow::bail!("invalid record: {}", reason);
    }
    Ok(catalog.insert_one(&record).await?)
}
