//! End-to-end Supervisor tests, driven against scripted fake OCR children
//! (`sh -c "..."`) rather than a real PaddleOCR process. Each script speaks
//! the same newline-delimited JSON protocol a real child would.

use std::sync::Arc;
use std::time::Duration;

use ocr_pool_service::config::Config;
use ocr_pool_service::error::AppError;
use ocr_pool_service::pool::Pool;
use ocr_pool_service::worker::WorkerSpawnSpec;

fn sh_spec(script: &str) -> WorkerSpawnSpec {
    WorkerSpawnSpec {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
    }
}

/// Emits readiness, then echoes back `{id, text:"hello", page_count:1}` for
/// every request line it reads.
const HAPPY_CHILD: &str = r#"
echo '{"ready":true}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([a-f0-9]*\)".*/\1/p')
  printf '{"id":"%s","text":"hello","page_count":1}\n' "$id"
done
"#;

/// Emits readiness, then reads and silently swallows every request line
/// forever without ever responding — used to exercise job/queue timeouts.
const STALLING_CHILD: &str = r#"
echo '{"ready":true}'
while IFS= read -r line; do :; done
"#;

fn base_config() -> Config {
    let mut config = Config::from_env();
    config.ocr_timeout = Duration::from_millis(60_000);
    config.worker_ready_timeout = Duration::from_millis(2_000);
    config.queue_max_size = 50;
    config.worker_count = 1;
    config
}

async fn start_pool(config: Config, spec: WorkerSpawnSpec) -> Arc<Pool> {
    let (pool, events_rx) = Pool::new(&config, spec);
    tokio::spawn(Arc::clone(&pool).run_event_loop(events_rx));
    pool.init().await.expect("pool should become ready");
    pool
}

#[tokio::test]
async fn happy_path_returns_text_and_page_count() {
    let config = base_config();
    let pool = start_pool(config, sh_spec(HAPPY_CHILD)).await;

    let pdf_path = std::env::temp_dir().join("happy-path-input.pdf");
    tokio::fs::write(&pdf_path, b"%PDF-1.4 fake").await.unwrap();

    let outcome = pool.run(&pdf_path, None).await.expect("job should succeed");
    assert_eq!(outcome.text, "hello");
    assert_eq!(outcome.page_count, Some(1));

    let _ = tokio::fs::remove_file(&pdf_path).await;
}

#[tokio::test]
async fn backpressure_rejects_once_queue_and_single_worker_are_full() {
    // Pool size 1, queue max 2: request 1 dispatches and stalls forever,
    // requests 2 and 3 queue, request 4 must be rejected immediately.
    let mut config = base_config();
    config.queue_max_size = 2;
    let pool = start_pool(config, sh_spec(STALLING_CHILD)).await;

    let pdf_path = std::env::temp_dir().join("backpressure-input.pdf");
    tokio::fs::write(&pdf_path, b"%PDF-1.4 fake").await.unwrap();
    let pool1 = Arc::clone(&pool);
    let path1 = pdf_path.clone();
    let _job1 = tokio::spawn(async move { pool1.run(&path1, None).await });

    // Give the dispatch scan a moment to claim the only Worker before we
    // submit the jobs that are meant to queue.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool2 = Arc::clone(&pool);
    let path2 = pdf_path.clone();
    let _job2 = tokio::spawn(async move { pool2.run(&path2, None).await });

    let pool3 = Arc::clone(&pool);
    let path3 = pdf_path.clone();
    let _job3 = tokio::spawn(async move { pool3.run(&path3, None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let result4 = pool.run(&pdf_path, None).await;
    assert!(matches!(result4, Err(AppError::Overloaded)));

    let _ = tokio::fs::remove_file(&pdf_path).await;
}

#[tokio::test]
async fn queued_job_times_out_independently_of_executing_job() {
    // Pool size 1, three requests against a child that never answers:
    // request 1 dispatches immediately and times out at ~200ms, which frees
    // the Worker and lets the queue's FIFO head (request 2) dispatch in turn
    // (timing out itself at ~400ms); request 3 stays queued behind it and
    // hits its own queue-entry timeout first, at ~300ms, as *queued-too-long*.
    let mut config = base_config();
    config.ocr_timeout = Duration::from_millis(200);
    config.queue_max_size = 3;
    let pool = start_pool(config, sh_spec(STALLING_CHILD)).await;

    let pdf_path = std::env::temp_dir().join("queue-timeout-input.pdf");
    tokio::fs::write(&pdf_path, b"%PDF-1.4 fake").await.unwrap();

    let pool1 = Arc::clone(&pool);
    let path1 = pdf_path.clone();
    let executing = tokio::spawn(async move { pool1.run(&path1, None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool2 = Arc::clone(&pool);
    let path2 = pdf_path.clone();
    let requeued = tokio::spawn(async move { pool2.run(&path2, None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let still_queued_result = pool.run(&pdf_path, None).await;
    assert!(matches!(still_queued_result, Err(AppError::QueuedTooLong)));

    let executing_result = executing.await.unwrap();
    assert!(matches!(executing_result, Err(AppError::OcrTimeout)));

    let requeued_result = requeued.await.unwrap();
    assert!(matches!(requeued_result, Err(AppError::OcrTimeout)));

    let _ = tokio::fs::remove_file(&pdf_path).await;
}

#[tokio::test]
async fn crashed_worker_reports_exit_code_and_respawns() {
    // The child crashes with exit code 9 the first time it ever runs (before
    // responding), then behaves normally on the respawn that follows.
    let marker = std::env::temp_dir().join(format!("crash-marker-{}", std::process::id()));
    let marker_str = marker.to_string_lossy().to_string();
    let script = format!(
        r#"
if [ -f "{marker}" ]; then
  echo '{{"ready":true}}'
  while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([a-f0-9]*\)".*/\1/p')
    printf '{{"id":"%s","text":"recovered","page_count":1}}\n' "$id"
  done
else
  touch "{marker}"
  echo '{{"ready":true}}'
  read -r line
  sleep 0.05
  exit 9
fi
"#,
        marker = marker_str
    );

    let mut config = base_config();
    config.ocr_timeout = Duration::from_millis(60_000);
    let pool = start_pool(config, sh_spec(&script)).await;

    let pdf_path = std::env::temp_dir().join("crash-input.pdf");
    tokio::fs::write(&pdf_path, b"%PDF-1.4 fake").await.unwrap();

    let first = pool.run(&pdf_path, None).await;
    match &first {
        Err(AppError::WorkerCrashed { exit_code }) => assert_eq!(*exit_code, Some(9)),
        other => panic!("expected WorkerCrashed(9), got {other:?}"),
    }

    // The Worker id is re-used (same slot, new process); after the fixed 2s
    // cooldown plus respawn, a subsequent job must dispatch there again.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let second = pool.run(&pdf_path, None).await.expect("respawned worker should succeed");
    assert_eq!(second.text, "recovered");

    let _ = tokio::fs::remove_file(&pdf_path).await;
    let _ = tokio::fs::remove_file(&marker).await;
}

#[tokio::test]
async fn fatal_startup_when_no_worker_ever_becomes_ready() {
    // Every child exits immediately without printing a readiness line.
    let mut config = base_config();
    config.worker_count = 3;
    let (pool, events_rx) = Pool::new(&config, sh_spec("exit 0"));
    tokio::spawn(Arc::clone(&pool).run_event_loop(events_rx));

    let result = pool.init().await;
    assert!(matches!(result, Err(AppError::FatalStartup)));
}

#[tokio::test]
async fn partial_init_succeeds_once_any_worker_becomes_ready() {
    // Every Worker's child sleeps before emitting readiness; `init` must
    // return Ok as soon as the first one does, rather than waiting for all
    // three (the remaining starts finish in the background).
    const DELAYED_READY_CHILD: &str = r#"
sleep 0.5
echo '{"ready":true}'
while IFS= read -r line; do :; done
"#;
    let mut config = base_config();
    config.worker_count = 3;
    config.worker_ready_timeout = Duration::from_millis(3_000);

    let started = std::time::Instant::now();
    let pool = start_pool(config, sh_spec(DELAYED_READY_CHILD)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!pool.is_down());
}

#[tokio::test]
async fn stale_free_signal_does_not_hand_queued_job_to_a_crashing_worker() {
    // Pool size 1. The Worker emits a response for job A, then immediately
    // exits. `on_worker_free(A)` must not hand the queued job B to the
    // now-crashed Worker; B can only complete after the fixed 2s cooldown
    // plus a successful respawn, never sooner.
    let script = r#"
echo '{"ready":true}'
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([a-f0-9]*\)".*/\1/p')
printf '{"id":"%s","text":"first","page_count":1}\n' "$id"
exit 7
"#;
    let mut config = base_config();
    config.ocr_timeout = Duration::from_millis(3_000);
    config.queue_max_size = 5;
    let pool = start_pool(config, sh_spec(script)).await;

    let pdf_path = std::env::temp_dir().join("stale-free-input.pdf");
    tokio::fs::write(&pdf_path, b"%PDF-1.4 fake").await.unwrap();

    let pool_a = Arc::clone(&pool);
    let path_a = pdf_path.clone();
    let job_a = tokio::spawn(async move { pool_a.run(&path_a, None).await });

    tokio::time::sleep(Duration::from_millis(30)).await;

    let pool_b = Arc::clone(&pool);
    let path_b = pdf_path.clone();
    let started = std::time::Instant::now();
    let job_b = tokio::spawn(async move { pool_b.run(&path_b, None).await });

    let result_a = job_a.await.unwrap();
    assert_eq!(result_a.expect("first job succeeds").text, "first");

    let result_b = tokio::time::timeout(Duration::from_secs(8), job_b)
        .await
        .expect("job B must resolve within 8s")
        .unwrap();
    assert_eq!(result_b.expect("job B eventually succeeds via respawn").text, "first");
    // The crash cooldown is a fixed 2s; resolving any sooner would mean B
    // was wrongly dispatched to the dying Worker instead of waiting for it.
    assert!(started.elapsed() >= Duration::from_millis(1_800));

    let _ = tokio::fs::remove_file(&pdf_path).await;
}
