//! Environment-driven configuration, read once at startup.

use std::time::Duration;

/// Pool-wide configuration: size, queue capacity, per-OCR timeout, ready timeout.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_file_size_mb: u64,
    pub ocr_timeout: Duration,
    pub worker_ready_timeout: Duration,
    pub queue_max_size: usize,
    pub worker_count: usize,
    /// Interpreter/binary used to spawn the OCR child process; the
    /// supervisor treats it as opaque.
    pub worker_program: String,
    /// Arguments passed to `worker_program`, typically the PaddleOCR worker
    /// script path, e.g. `["ocr_worker.py"]`.
    pub worker_args: Vec<String>,
}

/// Fixed delay between crash detection and respawn attempt.
pub const CRASH_COOLDOWN: Duration = Duration::from_secs(2);

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8080),
            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 25),
            ocr_timeout: Duration::from_millis(env_parse("OCR_TIMEOUT_MS", 60_000)),
            worker_ready_timeout: Duration::from_millis(env_parse("WORKER_READY_TIMEOUT", 120_000)),
            queue_max_size: env_parse("QUEUE_MAX_SIZE", 50),
            worker_count: env_parse("WORKER_COUNT", default_worker_count()),
            worker_program: std::env::var("OCR_WORKER_BIN").unwrap_or_else(|_| "python3".into()),
            worker_args: std::env::var("OCR_WORKER_SCRIPT")
                .unwrap_or_else(|_| "ocr_worker.py".into())
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn worker_spawn_spec(&self) -> crate::worker::WorkerSpawnSpec {
        crate::worker::WorkerSpawnSpec {
            program: self.worker_program.clone(),
            args: self.worker_args.clone(),
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_is_at_most_four() {
        assert!(default_worker_count() >= 1);
        assert!(default_worker_count() <= 4);
    }

    #[test]
    fn max_file_size_bytes_converts_mb() {
        let cfg = Config {
            port: 0,
            max_file_size_mb: 25,
            ocr_timeout: Duration::from_secs(1),
            worker_ready_timeout: Duration::from_secs(1),
            queue_max_size: 1,
            worker_count: 1,
            worker_program: "python3".into(),
            worker_args: vec!["ocr_worker.py".into()],
        };
        assert_eq!(cfg.max_file_size_bytes(), 25 * 1024 * 1024);
    }
}
