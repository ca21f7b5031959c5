use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use convoy_core::TaskId;

const MAX_RECORDS: usize = 512;
const MAX_STREAM_BYTES: usize = 128 * 1024;

/// Captured diagnostics for one task: the literal command issued and the tail
/// of each output stream. Values here are raw; redaction happens when the
/// scheduler persists or surfaces them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutputRecord {
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

static OUTPUTS: OnceLock<Mutex<BTreeMap<u64, TaskOutputRecord>>> = OnceLock::new();

fn outputs() -> &'static Mutex<BTreeMap<u64, TaskOutputRecord>> {
    OUTPUTS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn with_record(task_id: TaskId, apply: impl FnOnce(&mut TaskOutputRecord)) {
    let Ok(mut map) = outputs().lock() else {
        return;
    };
    if !map.contains_key(&task_id.0) && map.len() >= MAX_RECORDS {
        if let Some(oldest) = map.keys().next().copied() {
            map.remove(&oldest);
        }
    }
    apply(map.entry(task_id.0).or_default());
}

pub fn record_command(task_id: TaskId, command: &str) {
    with_record(task_id, |record| {
        record.command = Some(command.to_string());
    });
}

pub fn record_streams(task_id: TaskId, stdout: &[u8], stderr: &[u8]) {
    with_record(task_id, |record| {
        record.stdout = normalize(stdout);
        record.stderr = normalize(stderr);
    });
}

pub fn get(task_id: TaskId) -> Option<TaskOutputRecord> {
    outputs().lock().ok()?.get(&task_id.0).cloned()
}

pub fn clear() {
    if let Ok(mut map) = outputs().lock() {
        map.clear();
    }
}

/// Keeps the tail window of a stream; partial leading UTF-8 is replaced
/// lossily. Empty and whitespace-only streams collapse to `None`.
fn normalize(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let window = if bytes.len() > MAX_STREAM_BYTES {
        &bytes[bytes.len() - MAX_STREAM_BYTES..]
    } else {
        bytes
    };
    let text = String::from_utf8_lossy(window).to_string();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_command_and_streams_per_task() {
        let id = TaskId(900_001);
        record_command(id, "brew outdated");
        record_streams(id, b"ripgrep 14.0 -> 14.1\n", b"");

        let record = get(id).expect("record should exist");
        assert_eq!(record.command.as_deref(), Some("brew outdated"));
        assert_eq!(record.stdout.as_deref(), Some("ripgrep 14.0 -> 14.1\n"));
        assert_eq!(record.stderr, None);
    }

    #[test]
    fn long_streams_keep_only_the_tail() {
        let id = TaskId(900_002);
        let noise = vec![b'x'; MAX_STREAM_BYTES + 100];
        record_streams(id, &noise, b"");
        let record = get(id).expect("record should exist");
        assert_eq!(record.stdout.map(|s| s.len()), Some(MAX_STREAM_BYTES));
    }
}
