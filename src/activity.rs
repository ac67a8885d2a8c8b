use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

/// Append-only audit trail of import and cross-reference lifecycle events
/// (submitted, completed, failed, blocked), buffered in memory and flushed
/// to a JSONL file in batches. Recording failures never fail the pipeline;
/// callers log and continue.
#[derive(Clone)]
pub struct ActivityLog {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<ActivityEvent>>>,
    log_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl ActivityLog {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let log_path = data_dir.join("activity-log.jsonl");
        OpenOptions::new().create(true).append(true).open(&log_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.activity_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            log_path,
            batch_size: config.activity_batch_size,
            max_file_bytes: config.activity_buffer_max_bytes,
            max_file_count: config.activity_buffer_max_files,
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(ActivityEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist_locked(&self, queue: &mut Vec<ActivityEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let (encoded, total_bytes) = encode_batch(queue)?;
        self.rotate_if_needed(total_bytes)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.log_path).map(|m| m.len()).unwrap_or(0);
        if current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.log_path)?;
            return Ok(());
        }

        let rotated_name = format!(
            "{}-{}.jsonl",
            self.log_stem(),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let rotated_path = self
            .log_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(rotated_name);

        if self.log_path.exists() {
            fs::rename(&self.log_path, &rotated_path)?;
        }

        self.prune_rotations()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.log_path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}-", self.log_stem());
        let mut rotations = fs::read_dir(parent)?
            .filter_map(|entry| {
                entry.ok().and_then(|dir_entry| {
                    let name = dir_entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                        Some((
                            dir_entry.path(),
                            dir_entry.metadata().ok()?.modified().ok()?,
                        ))
                    } else {
                        None
                    }
                })
            })
            .collect::<Vec<_>>();

        rotations.sort_by_key(|(_, modified)| *modified);
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for (path, _) in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn log_stem(&self) -> String {
        self.log_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "activity-log".into())
    }
}

#[derive(Debug, Serialize)]
pub struct ActivityEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl ActivityEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}

fn encode_batch(events: &[ActivityEvent]) -> AppResult<(Vec<Vec<u8>>, u64)> {
    let mut encoded = Vec::with_capacity(events.len());
    let mut bytes = 0_u64;
    for event in events {
        let line = serde_json::to_vec(event)?;
        bytes += (line.len() + 1) as u64;
        encoded.push(line);
    }
    Ok((encoded, bytes))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::from_env();
        config.activity_enabled_by_default = true;
        config.activity_batch_size = 2;
        config.activity_buffer_max_bytes = 1024;
        config.activity_buffer_max_files = 3;
        config
    }

    #[test]
    fn writes_events_to_disk() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.activity_batch_size = 1;

        let log = ActivityLog::new(dir.path(), &config).unwrap();
        log.record("import_submitted", json!({ "task_id": "t-1" }))
            .unwrap();
        log.flush().unwrap();

        let contents = fs::read_to_string(log.log_path()).unwrap();
        assert!(contents.contains("import_submitted"));
        assert!(contents.contains("t-1"));
    }

    #[test]
    fn keeps_the_log_across_instances() {
        let dir = tempdir().unwrap();
        let config = test_config();
        {
            let log = ActivityLog::new(dir.path(), &config).unwrap();
            log.record("first", json!({})).unwrap();
            log.flush().unwrap();
        }

        let log = ActivityLog::new(dir.path(), &config).unwrap();
        log.record("second", json!({})).unwrap();
        log.flush().unwrap();

        let contents = fs::read_to_string(log.log_path()).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }

    #[test]
    fn disabled_log_drops_events() {
        let dir = tempdir().unwrap();
        let log = ActivityLog::new(dir.path(), &test_config()).unwrap();
        log.set_enabled(false);
        log.record("ignored", json!({})).unwrap();
        assert_eq!(log.queue_depth(), 0);
    }

    #[test]
    fn rotates_when_exceeding_capacity() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.activity_buffer_max_bytes = 64;
        config.activity_batch_size = 1;

        let log = ActivityLog::new(dir.path(), &config).unwrap();
        for idx in 0..4 {
            log.record(
                "bulky",
                json!({
                    "payload": "0123456789abcdef0123456789abcdef",
                    "idx": idx
                }),
            )
            .unwrap();
            log.flush().unwrap();
        }

        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .ok()
                    .map(|e| e.file_name().to_string_lossy().contains("activity-log-"))
                    .unwrap_or(false)
            })
            .count();
        assert!(rotated >= 1);
    }
}
