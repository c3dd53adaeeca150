use std::collections::HashSet;
use std::num::NonZeroUsize;

use docgen::domain::cache::ContentEncoding;
use docgen::infra::evictor::{CacheEvictor, EvictionPolicy};
use docgen::infra::file_cache::{FileCache, WriteOptions};
use docgen::infra::telemetry;
use docgen::logging::{BatchQueue, BatchQueueConfig, FlushOptions, StdoutTransport, Transport};
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;
use tempfile::TempDir;

#[tokio::test]
#[serial]
async fn cache_and_pipeline_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let dir = TempDir::new().expect("tempdir");
    let cache = FileCache::new(dir.path()).expect("cache");
    for content in [b"first".as_slice(), b"second".as_slice(), b"first".as_slice()] {
        let _ = cache
            .write(content, "txt", ContentEncoding::Binary, WriteOptions::default())
            .await;
    }

    let evictor = CacheEvictor::new(
        dir.path(),
        EvictionPolicy {
            max_size: Some(1),
            ..EvictionPolicy::default()
        },
    );
    let report = evictor.run_cleanup().await.expect("cleanup");
    assert_eq!(report.removed.len(), 2);

    let queue = BatchQueue::new(BatchQueueConfig {
        max_batch_size: NonZeroUsize::new(2).expect("non-zero"),
        batch_timeout: None,
        initial_delay: None,
    });
    queue.push("one".to_string()).await;
    let drained = queue.flush(FlushOptions::DRAIN_ALL).await;
    assert_eq!(drained.map(|batch| batch.len()), Some(1));

    let outcome = StdoutTransport.xfer(None).await;
    assert!(!outcome.success);

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect();

    for expected in [
        "docgen_file_cache_write_total",
        "docgen_file_cache_evicted_total",
        "docgen_file_cache_evicted_bytes_total",
        "docgen_file_cache_size_bytes",
        "docgen_clogs_queue_len",
        "docgen_clogs_flush_batch_size",
        "docgen_clogs_transfer_total",
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }

    let write_results: HashSet<String> = snapshot
        .iter()
        .filter(|(key, _, _, _)| key.key().name() == "docgen_file_cache_write_total")
        .flat_map(|(key, _, _, _)| {
            key.key()
                .labels()
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(write_results.contains("stored"));
    assert!(write_results.contains("conflict"));
}
