//! Append-only JSONL provenance journal, one per stack.

use super::error::StateError;
use super::types::{StackEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 UTC timestamp without a chrono dependency.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (y, m, d) = civil_from_days((secs / 86400) as i64);
    let rem = secs % 86400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days-since-epoch to proleptic Gregorian (y, m, d).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe as i64 + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run id.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the journal path for a stack.
pub fn journal_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("journal.jsonl")
}

/// Append an event to the stack's journal.
pub fn append_event(state_dir: &Path, stack: &str, event: StackEvent) -> Result<(), StateError> {
    let path = journal_path(state_dir, stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let entry = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&entry).map_err(|e| StateError::Corrupt {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
    writeln!(file, "{}", json).map_err(|source| StateError::Io { path, source })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso8601_shape() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(365), (1971, 1, 1));
        // 2000-02-29 is day 11016: leap century
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        // 2026-08-06 is day 20_671
        assert_eq!(civil_from_days(20_671), (2026, 8, 6));
    }

    #[test]
    fn test_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert!(id.len() > 4);
    }

    #[test]
    fn test_journal_path() {
        let p = journal_path(Path::new("/state"), "site");
        assert_eq!(p, PathBuf::from("/state/site/journal.jsonl"));
    }

    #[test]
    fn test_append_event() {
        let dir = tempfile::tempdir().unwrap();
        let event = StackEvent::ApplyStarted {
            stack: "site".to_string(),
            run_id: "r-abc".to_string(),
            engine_version: "0.3.0".to_string(),
        };
        append_event(dir.path(), "site", event).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("site/journal.jsonl")).unwrap();
        assert!(content.contains("apply_started"));
        assert!(content.contains("r-abc"));
    }

    #[test]
    fn test_append_multiple_lines() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let event = StackEvent::ResourceCreated {
                stack: "site".to_string(),
                resource: format!("r{}", i),
                physical_id: format!("p-{}", i),
                duration_seconds: 0.1,
            };
            append_event(dir.path(), "site", event).unwrap();
        }
        let content =
            std::fs::read_to_string(dir.path().join("site/journal.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 3);
    }
}
