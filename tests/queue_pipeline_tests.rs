//! Integration tests for queue discovery, claiming and the processor's
//! recovery paths that do not require the external tools.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{ensure_dirs, events_of_kind, test_config, write_bundle};
use instrumental_engine::events::EventLog;
use instrumental_engine::pipeline::{Disposition, Processor, QueueConsumer};

#[test]
fn test_discovery_is_oldest_first_across_queue_roots() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    ensure_dirs(&config);

    write_bundle(
        &config.queues[0].root,
        "job_newer",
        r#"{"job_id": "newer", "source_type": "youtube", "audio_path": "audio.m4a"}"#,
    );
    let older = write_bundle(
        &config.queues[1].root,
        "job_older",
        r#"{"job_id": "older", "source_type": "upload", "audio_path": "audio.m4a"}"#,
    );

    // Age every file in the second bundle; the first keeps current mtimes.
    let past = SystemTime::now() - Duration::from_secs(7200);
    for name in ["job.json", "audio.m4a"] {
        let f = fs::File::options()
            .write(true)
            .open(older.join(name))
            .unwrap();
        f.set_modified(past).unwrap();
    }

    let consumer = QueueConsumer::new(
        config.queues.clone(),
        &config.working,
        &config.archive_dir,
    );
    let discovery = consumer.discover();
    assert_eq!(discovery.ready.len(), 2);
    assert_eq!(discovery.ready[0].bundle.job_id, "older");
    assert_eq!(discovery.ready[1].bundle.job_id, "newer");
}

#[test]
fn test_claim_then_archive_failed_layout() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    ensure_dirs(&config);

    write_bundle(
        &config.queues[0].root,
        "job_x",
        r#"{"job_id": "x", "source_type": "youtube", "audio_path": "audio.m4a"}"#,
    );

    let consumer = QueueConsumer::new(
        config.queues.clone(),
        &config.working,
        &config.archive_dir,
    );
    let discovery = consumer.discover();
    let claimed = consumer
        .claim(discovery.ready.into_iter().next().unwrap())
        .unwrap();

    // The claim is a move: the bundle is gone from the queue root.
    assert!(!config.queues[0].root.join("job_x").exists());
    assert!(claimed.path.join("audio.m4a").exists());

    let dest = consumer
        .archive(&claimed, Disposition::Failed("separation".to_string()))
        .unwrap();
    assert!(dest.starts_with(config.archive_dir.join("failed/separation")));
    assert!(dest.join("job.json").exists());
}

#[tokio::test]
async fn test_processor_quarantines_schema_invalid_bundle() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    ensure_dirs(&config);

    // job.json parses but misses required keys.
    let bundle = config.queues[0].root.join("job_schema");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(bundle.join("job.json"), r#"{"source_type": "youtube"}"#).unwrap();

    let events = Arc::new(EventLog::new(&config.log_dir).unwrap());
    let processor = Processor::new(config.clone(), events);
    let shutdown = CancellationToken::new();

    let progressed = processor.process_next(&shutdown).await.unwrap();
    assert!(!progressed);

    // The bundle was moved to the corrupt destination.
    assert!(!bundle.exists());
    let rejects = config.archive_dir.join("rejects");
    assert!(rejects.join("job_schema").exists());

    let skipped = events_of_kind(&config, "skipped_corrupt");
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0]["error"].as_str().unwrap().contains("schema"));
    assert!(skipped[0]["destination"]
        .as_str()
        .unwrap()
        .contains("rejects"));
}

#[tokio::test]
async fn test_processor_idles_on_empty_queues() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    ensure_dirs(&config);

    let events = Arc::new(EventLog::new(&config.log_dir).unwrap());
    let processor = Processor::new(config.clone(), events);
    let shutdown = CancellationToken::new();

    let progressed = processor.process_next(&shutdown).await.unwrap();
    assert!(!progressed);
    assert!(common::read_events(&config).is_empty());
}

#[test]
fn test_tmp_suffixed_bundles_invisible_until_renamed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    ensure_dirs(&config);

    let staged = write_bundle(
        &config.queues[0].root,
        "job_s.tmp",
        r#"{"job_id": "s", "source_type": "youtube", "audio_path": "audio.m4a"}"#,
    );

    let consumer = QueueConsumer::new(
        config.queues.clone(),
        &config.working,
        &config.archive_dir,
    );
    assert!(consumer.discover().ready.is_empty());

    // The atomic rename publishes the bundle.
    fs::rename(&staged, config.queues[0].root.join("job_s")).unwrap();
    let discovery = consumer.discover();
    assert_eq!(discovery.ready.len(), 1);
    assert_eq!(discovery.ready[0].bundle.job_id, "s");
}
