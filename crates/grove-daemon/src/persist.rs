//! Persisted instance metadata: one JSON record per instance.
//!
//! Records are best-effort and last-write-wins; the registry rewrites any
//! record found in a non-terminal state as `CRASHED` on reload.

use std::path::Path;

use grove_proto::InstanceInfo;
use grove_types::GroveError;

/// Write an instance record, creating the parent directory if needed.
pub fn write_record(path: &Path, info: &InstanceInfo) -> Result<(), GroveError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(info)
        .map_err(|e| GroveError::Protocol(format!("serialize instance record: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read every parseable `.json` record in a directory. Unreadable or
/// malformed files are skipped with a warning.
pub fn load_records(dir: &Path) -> Vec<InstanceInfo> {
    let mut records = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return records;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(data) = std::fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<InstanceInfo>(&data) {
            Ok(info) => records.push(info),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed instance record");
            }
        }
    }
    records
}

/// Delete an instance record; missing files are fine.
pub fn remove_record(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove instance record");
        }
    }
}
