//! End-to-end tests over real sockets: snapshot transfers into a running
//! stream listener, datagram pushes, and the HTTP catalog view.

use gofi::codec;
use gofi::collector;
use gofi::config::Config;
use gofi::models::Record;
use gofi::server;
use gofi::store::Catalog;
use gofi::transfer;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

fn test_config(root: &Path) -> Config {
    let mut config = Config::minimal();
    config.db.path = root.join("catalog.sqlite");
    config.receiver.staging_dir = root.join("staging");
    config.receiver.read_timeout_secs = 5;
    config
}

fn machine_snapshot(machine: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let mut r = Record::new(format!("/data/file{}.txt", i), i as i64 * 10, machine, "10.9.0.1");
            r.file_type = "txt".to_string();
            r
        })
        .collect()
}

async fn start_receiver(config: &Config) -> (Catalog, String) {
    let catalog = Catalog::open(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(collector::run_stream_listener(
        listener,
        catalog.clone(),
        Arc::new(config.clone()),
    ));
    (catalog, addr)
}

async fn wait_for_count(catalog: &Catalog, expected: i64) -> i64 {
    let mut count = 0;
    for _ in 0..200 {
        count = catalog.count().await.unwrap();
        if count >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    count
}

fn staging_entries(config: &Config) -> usize {
    std::fs::read_dir(&config.receiver.staging_dir)
        .map(|d| d.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_relational_snapshot_over_tcp() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let (catalog, addr) = start_receiver(&config).await;

    let snap = tmp.path().join("alpha.db");
    codec::write_relational(&snap, &machine_snapshot("alpha", 50))
        .await
        .unwrap();
    transfer::send_file(&addr, &snap, None).await.unwrap();

    assert_eq!(wait_for_count(&catalog, 50).await, 50);

    // Staging file is removed once the merge commits.
    for _ in 0..40 {
        if staging_entries(&config) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(staging_entries(&config), 0);
}

#[tokio::test]
async fn test_resending_snapshot_adds_nothing() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let (catalog, addr) = start_receiver(&config).await;

    let snap = tmp.path().join("beta.json");
    std::fs::write(&snap, codec::encode_flat(&machine_snapshot("beta", 30)).unwrap()).unwrap();

    transfer::send_file(&addr, &snap, None).await.unwrap();
    assert_eq!(wait_for_count(&catalog, 30).await, 30);

    transfer::send_file(&addr, &snap, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(catalog.count().await.unwrap(), 30);
}

#[tokio::test]
async fn test_concurrent_transfers() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let (catalog, addr) = start_receiver(&config).await;

    let mut senders = Vec::new();
    for machine in ["alpha", "beta", "gamma", "delta"] {
        let snap = tmp.path().join(format!("{}.db", machine));
        codec::write_relational(&snap, &machine_snapshot(machine, 200))
            .await
            .unwrap();
        let addr = addr.clone();
        senders.push(tokio::spawn(async move {
            transfer::send_file(&addr, &snap, None).await.unwrap();
        }));
    }
    for s in senders {
        s.await.unwrap();
    }

    assert_eq!(wait_for_count(&catalog, 800).await, 800);
}

#[tokio::test]
async fn test_partial_transfer_does_not_merge() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let (catalog, addr) = start_receiver(&config).await;

    let payload = codec::encode_flat(&machine_snapshot("cut", 100)).unwrap();
    let declared = payload.len();

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut header = declared.to_string().into_bytes();
    header.resize(transfer::SIZE_FIELD_LEN, transfer::PAD);
    let mut name = b"cut.json".to_vec();
    name.resize(transfer::NAME_FIELD_LEN, transfer::PAD);
    stream.write_all(&header).await.unwrap();
    stream.write_all(&name).await.unwrap();
    stream.write_all(&payload[..declared / 10]).await.unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(catalog.count().await.unwrap(), 0);
    assert_eq!(staging_entries(&config), 0);

    // The listener keeps serving after a failed connection.
    let snap = tmp.path().join("ok.json");
    std::fs::write(&snap, codec::encode_flat(&machine_snapshot("ok", 3)).unwrap()).unwrap();
    transfer::send_file(&addr, &snap, None).await.unwrap();
    assert_eq!(wait_for_count(&catalog, 3).await, 3);
}

#[tokio::test]
async fn test_undecodable_snapshot_is_retained() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let (catalog, addr) = start_receiver(&config).await;

    let snap = tmp.path().join("junk.bin");
    std::fs::write(&snap, b"definitely not a snapshot").unwrap();
    transfer::send_file(&addr, &snap, None).await.unwrap();

    let mut retained = 0;
    for _ in 0..40 {
        retained = staging_entries(&config);
        if retained == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(retained, 1);
    assert_eq!(catalog.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_datagram_push() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let catalog = Catalog::open(&config).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(collector::run_datagram_listener(socket, catalog.clone()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let record = Record::new("/etc/hosts", 220, "omega", "10.9.0.9");
    let payload = serde_json::to_vec(&record).unwrap();
    client.send_to(&payload, addr).await.unwrap();
    client.send_to(&payload, addr).await.unwrap();
    client.send_to(b"garbage", addr).await.unwrap();

    assert_eq!(wait_for_count(&catalog, 1).await, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(catalog.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_http_catalog_view() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let catalog = Catalog::open(&config).await.unwrap();

    let mut records = machine_snapshot("alpha", 3);
    for (i, ft) in ["pdf", "pdf", "txt"].iter().enumerate() {
        records[i].file_type = ft.to_string();
    }
    for r in &records {
        catalog.insert_one(r).await.unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(catalog.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "ok");

    let view: serde_json::Value = client
        .get(format!("http://{}/?filetype=pdf&limit=99999", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["rows"].as_array().unwrap().len(), 2);
    assert_eq!(view["total"], 2);
    assert_eq!(view["filetypes"], serde_json::json!(["pdf", "txt"]));
    assert_eq!(view["rows"][0]["filetype"], "pdf");
    assert!(view["rows"][0]["human_size"].is_string());

    let missing = client
        .get(format!("http://{}/nope", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}
