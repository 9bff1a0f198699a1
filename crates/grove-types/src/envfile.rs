//! Dotenv-style environment file parsing and environment merging.
//!
//! The agent environment is assembled from the data root's `env` file plus
//! per-request overrides, then merged over the daemon's own environment when
//! the agent child is spawned.

use std::collections::HashMap;
use std::path::Path;

/// Read a dotenv-style file and return its key/value pairs.
///
/// Lines starting with `#` and blank lines are skipped; a line without `=`
/// produces no entry; keys and values are whitespace-trimmed. A missing file
/// yields an empty map rather than an error.
pub fn load(path: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return env;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        env.insert(key.trim().to_string(), value.trim().to_string());
    }
    env
}

/// Merge `K=V` override entries into a base `K=V` environment.
///
/// Base entries whose key is overridden are replaced in place; remaining
/// base entries are preserved; overrides with new keys are appended.
pub fn env_with<I>(base: &[String], overrides: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut merged: Vec<String> = base.to_vec();
    for entry in overrides {
        let key = entry.split('=').next().unwrap_or("").to_string();
        let prefix = format!("{key}=");
        if let Some(existing) = merged.iter_mut().find(|e| e.starts_with(&prefix)) {
            *existing = entry;
        } else {
            merged.push(entry);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn load_parses_entries() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "ANTHROPIC_API_KEY=sk-test").unwrap();
        writeln!(f, "  SPACED  =  value  ").unwrap();
        writeln!(f, "no-equals-here").unwrap();
        writeln!(f, "EMPTY=").unwrap();

        let env = load(f.path());
        assert_eq!(env.len(), 3);
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-test");
        assert_eq!(env["SPACED"], "value");
        assert_eq!(env["EMPTY"], "");
    }

    #[test]
    fn load_missing_file_is_empty() {
        assert!(load(Path::new("/nonexistent/grove-env")).is_empty());
    }

    #[test]
    fn env_with_overrides_existing_key() {
        let base = strings(&["A=1", "B=2", "C=3"]);
        let merged = env_with(&base, strings(&["A=99"]));
        assert!(merged.contains(&"A=99".to_string()));
        assert!(!merged.contains(&"A=1".to_string()));
        assert!(merged.contains(&"B=2".to_string()));
        assert!(merged.contains(&"C=3".to_string()));
    }

    #[test]
    fn env_with_adds_new_key() {
        let base = strings(&["A=1"]);
        let merged = env_with(&base, strings(&["D=4"]));
        assert!(merged.contains(&"A=1".to_string()));
        assert!(merged.contains(&"D=4".to_string()));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn env_with_multiple_overrides() {
        let base = strings(&["A=1", "B=2", "C=3"]);
        let merged = env_with(&base, strings(&["A=99", "B=88"]));
        assert!(merged.contains(&"A=99".to_string()));
        assert!(merged.contains(&"B=88".to_string()));
        assert!(merged.contains(&"C=3".to_string()));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn env_with_empty_base() {
        let merged = env_with(&[], strings(&["X=1"]));
        assert_eq!(merged, strings(&["X=1"]));
    }

    #[test]
    fn env_with_no_overrides() {
        let base = strings(&["A=1", "B=2"]);
        assert_eq!(env_with(&base, std::iter::empty()), base);
    }

    #[test]
    fn env_with_does_not_match_key_prefixes() {
        let base = strings(&["PATH=/usr/bin", "PATH_EXTRA=x"]);
        let merged = env_with(&base, strings(&["PATH=/opt/bin"]));
        assert!(merged.contains(&"PATH=/opt/bin".to_string()));
        assert!(merged.contains(&"PATH_EXTRA=x".to_string()));
        assert_eq!(merged.len(), 2);
    }
}
