//! End-to-end scenarios for the range-parallel engine: fresh download,
//! crash resume, 416 fallback, and mid-flight cancellation.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::{RangeMode, RangeServer, seeded_bytes, spawn_range_server};
use sluice::chunk::ChunkPlan;
use sluice::{DownloadConfig, Downloader, Stream, StreamKind};

const MIB: u64 = 1024 * 1024;

fn test_stream(url: &str) -> Stream {
    Stream {
        id: "0".into(),
        title: "data".into(),
        kind: StreamKind::Video,
        url: url.into(),
        format: "bin".into(),
        quality: String::new(),
        size: None,
        duration: None,
        headers: HashMap::new(),
        save_as: None,
    }
}

fn test_config(dir: &tempfile::TempDir, threads: usize, chunk_size: u64) -> DownloadConfig {
    DownloadConfig {
        output_path: dir.path().to_path_buf(),
        threads,
        chunk_size,
        no_cache: true,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_range_parallel_download() {
    let body = seeded_bytes(10_485_760);
    let server = RangeServer::new(body.clone(), RangeMode::Normal);
    let url = spawn_range_server(server.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let downloader = Downloader::new(test_config(&dir, 4, MIB)).unwrap();
    let path = downloader.download_stream(&test_stream(&url)).await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!dir.path().join("data.bin.part").exists());
    assert!(!dir.path().join("data.bin.progress").exists());

    let ranges = server.get_ranges();
    assert_eq!(ranges.len(), 10, "one GET per chunk: {ranges:?}");
    assert!(ranges.contains(&"bytes=0-1048575".to_owned()));
    assert!(ranges.contains(&"bytes=9437184-10485759".to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_after_crash_requeues_only_incomplete_chunks() {
    let total = 10_485_760u64;
    let body = seeded_bytes(total as usize);
    let server = RangeServer::new(body.clone(), RangeMode::Normal);
    let url = spawn_range_server(server.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    // Simulate a crash after 3 complete chunks and 512 KiB of chunk 3.
    let partial = 524_288u64;
    let mut plan = ChunkPlan::build(&url, total, MIB);
    for chunk in plan.chunks.iter_mut().take(3) {
        chunk.downloaded = chunk.size;
        chunk.completed = true;
    }
    plan.chunks[3].downloaded = partial;

    let temp_path = dir.path().join("data.bin.part");
    let sidecar_path = dir.path().join("data.bin.progress");
    let mut part = vec![0u8; total as usize];
    let covered = (3 * MIB + partial) as usize;
    part[..covered].copy_from_slice(&body[..covered]);
    std::fs::write(&temp_path, &part).unwrap();
    plan.save(&sidecar_path).unwrap();

    let downloader = Downloader::new(test_config(&dir, 4, MIB)).unwrap();
    let path = downloader.download_stream(&test_stream(&url)).await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!sidecar_path.exists());

    let ranges = server.get_ranges();
    assert_eq!(ranges.len(), 7, "only incomplete chunks are requeued: {ranges:?}");
    // Chunk 3 resumes exactly at its downloaded offset.
    assert!(ranges.contains(&"bytes=3670016-4194303".to_owned()));
    for range in &ranges {
        let start: u64 = range
            .trim_start_matches("bytes=")
            .split('-')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert!(start >= 3 * MIB + partial, "completed bytes re-requested: {range}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunk_416_falls_back_to_plain_download() {
    let body = seeded_bytes(4 * MIB as usize);
    let server = RangeServer::new(body.clone(), RangeMode::RejectRangedGet);
    let url = spawn_range_server(server.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let downloader = Downloader::new(test_config(&dir, 4, MIB)).unwrap();
    let path = downloader.download_stream(&test_stream(&url)).await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!dir.path().join("data.bin.progress").exists());

    let ranges = server.get_ranges();
    assert!(ranges.iter().any(|r| !r.is_empty()), "ranged attempt expected");
    assert!(ranges.iter().any(|r| r.is_empty()), "no-range fallback expected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_keeps_part_and_sidecar_then_resumes() {
    let total = MIB;
    let body = seeded_bytes(total as usize);
    let server = RangeServer::throttled(
        body.clone(),
        RangeMode::Normal,
        8 * 1024,
        Duration::from_millis(15),
    );
    let url = spawn_range_server(server.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let temp_path = dir.path().join("data.bin.part");
    let sidecar_path = dir.path().join("data.bin.progress");

    let downloader = Downloader::new(test_config(&dir, 2, 128 * 1024)).unwrap();
    let token = downloader.cancellation_token();
    let stream = test_stream(&url);
    let handle = tokio::spawn(async move { downloader.download_stream(&stream).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancelled_at = Instant::now();
    token.cancel();
    let result = handle.await.unwrap();

    assert!(
        matches!(result, Err(sluice::DownloadError::Cancelled)),
        "expected cancellation, got {result:?}"
    );
    assert!(cancelled_at.elapsed() < Duration::from_secs(1), "cancellation was not prompt");
    assert!(temp_path.exists(), ".part must remain for resume");
    assert!(sidecar_path.exists(), "sidecar must remain for resume");

    // A later run picks the plan up and completes.
    let downloader = Downloader::new(test_config(&dir, 2, 128 * 1024)).unwrap();
    let path = downloader.download_stream(&test_stream(&url)).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!sidecar_path.exists());
}
