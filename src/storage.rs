use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File persistence rooted at a base directory. Owns no data, just two
/// guarantees: whole-file writes are atomic (temp + rename), and JSONL
/// appends tolerate a partial trailing line after a crash.
#[derive(Debug, Clone)]
pub struct Storage {
    base: PathBuf,
}

impl Storage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    fn io_err(path: &Path, source: std::io::Error) -> StorageError {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound { path: path.into() }
        } else {
            StorageError::Io {
                path: path.into(),
                source,
            }
        }
    }

    fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.into(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Write the whole file atomically: temp file in the target directory,
    /// then rename over the destination.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        Self::ensure_parent(path)?;
        let nonce = format!(
            "{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".{nonce}.tmp"));
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(|e| StorageError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, path).map_err(|e| StorageError::Io {
            path: path.into(),
            source: e,
        })
    }

    /// Parse a whole JSON file.
    pub fn read_json<T: DeserializeOwned>(&self, rel: &str) -> Result<T, StorageError> {
        let path = self.resolve(rel);
        let text = fs::read_to_string(&path).map_err(|e| Self::io_err(&path, e))?;
        serde_json::from_str(&text).map_err(|e| StorageError::Corrupt {
            path,
            line: e.line(),
            source: e,
        })
    }

    /// Atomically replace a JSON file. Pretty-printed, trailing newline.
    pub fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<(), StorageError> {
        let path = self.resolve(rel);
        let mut text = serde_json::to_string_pretty(value).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            line: 0,
            source: e,
        })?;
        text.push('\n');
        Self::write_atomic(&path, text.as_bytes())
    }

    /// Append one entry as a JSONL line. A crash mid-append may leave a
    /// partial trailing line; `read_all_jsonl` tolerates exactly that.
    pub fn append_jsonl<T: Serialize>(&self, rel: &str, entry: &T) -> Result<(), StorageError> {
        let path = self.resolve(rel);
        Self::ensure_parent(&path)?;
        let mut line = serde_json::to_string(entry).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            line: 0,
            source: e,
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Self::io_err(&path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| StorageError::Io {
            path: path.clone(),
            source: e,
        })
    }

    /// Read every entry of a JSONL file. The trailing line is a crash
    /// artifact when it is missing its terminator or fails to parse, and is
    /// skipped; a parse failure on any earlier line is corruption and
    /// surfaces as an error.
    pub fn read_all_jsonl<T: DeserializeOwned>(&self, rel: &str) -> Result<Vec<T>, StorageError> {
        let path = self.resolve(rel);
        let text = fs::read_to_string(&path).map_err(|e| Self::io_err(&path, e))?;

        // An unterminated final line never survives, even when it happens
        // to parse. A crash between the payload write and the newline is
        // indistinguishable from one mid-payload.
        let terminated = match text.rfind('\n') {
            Some(idx) => &text[..=idx],
            None => "",
        };

        let lines: Vec<(usize, &str)> = terminated
            .split('\n')
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .collect();

        let mut entries = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (i, (line_idx, line)) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(_) if i == last => break,
                Err(e) => {
                    return Err(StorageError::Corrupt {
                        path,
                        line: line_idx + 1,
                        source: e,
                    })
                }
            }
        }
        Ok(entries)
    }

    /// Atomically rewrite a JSONL file. An empty slice produces an empty
    /// file, not a missing one.
    pub fn write_jsonl<T: Serialize>(&self, rel: &str, entries: &[T]) -> Result<(), StorageError> {
        let path = self.resolve(rel);
        let mut buf = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry).map_err(|e| StorageError::Corrupt {
                path: path.clone(),
                line: 0,
                source: e,
            })?;
            buf.push_str(&line);
            buf.push('\n');
        }
        Self::write_atomic(&path, buf.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
        s: String,
    }

    fn entry(n: u32) -> Entry {
        Entry {
            n,
            s: format!("entry {n}"),
        }
    }

    #[test]
    fn json_roundtrip_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.write_json("meta.json", &entry(1)).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("meta.json")).unwrap();
        assert!(raw.ends_with('\n'));

        let back: Entry = storage.read_json("meta.json").unwrap();
        assert_eq!(back, entry(1));
    }

    #[test]
    fn write_json_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.write_json("a/b/meta.json", &entry(7)).unwrap();
        let back: Entry = storage.read_json("a/b/meta.json").unwrap();
        assert_eq!(back.n, 7);
    }

    #[test]
    fn write_json_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.write_json("meta.json", &entry(1)).unwrap();
        storage.write_json("meta.json", &entry(2)).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["meta.json".to_string()]);
    }

    #[test]
    fn read_json_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let err = storage.read_json::<Entry>("nope.json").unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn read_json_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let storage = Storage::new(dir.path());
        let err = storage.read_json::<Entry>("bad.json").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn jsonl_append_then_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        for n in 0..3 {
            storage.append_jsonl("log.jsonl", &entry(n)).unwrap();
        }
        let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
        assert_eq!(back, vec![entry(0), entry(1), entry(2)]);
    }

    #[test]
    fn jsonl_rewrite_matches_input() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let entries = vec![entry(1), entry(2)];
        storage.write_jsonl("log.jsonl", &entries).unwrap();
        let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn jsonl_empty_rewrite_leaves_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.write_jsonl::<Entry>("log.jsonl", &[]).unwrap();

        let raw = std::fs::read(dir.path().join("log.jsonl")).unwrap();
        assert!(raw.is_empty());
        let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn jsonl_partial_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let entries = vec![entry(1), entry(2), entry(3)];
        storage.write_jsonl("log.jsonl", &entries).unwrap();

        // Chop a byte off the end, as a crash mid-append would.
        let path = dir.path().join("log.jsonl");
        let mut raw = std::fs::read(&path).unwrap();
        raw.truncate(raw.len() - 2);
        std::fs::write(&path, raw).unwrap();

        let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
        assert_eq!(back, vec![entry(1), entry(2)]);
    }

    #[test]
    fn jsonl_partial_tail_any_truncation_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let entries = vec![entry(1), entry(2)];
        storage.write_jsonl("log.jsonl", &entries).unwrap();
        let full = std::fs::read(dir.path().join("log.jsonl")).unwrap();
        let second_line_start = full
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap();

        // Every truncation point within the second line, including the one
        // that only removes the terminator, loses exactly that line.
        for cut in second_line_start + 1..full.len() {
            std::fs::write(dir.path().join("log.jsonl"), &full[..cut]).unwrap();
            let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
            assert_eq!(back, vec![entry(1)], "cut at byte {cut}");
        }
    }

    #[test]
    fn jsonl_unterminated_tail_is_dropped_even_when_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1,\"s\":\"a\"}\n{\"n\":2,\"s\":\"b\"}").unwrap();

        let storage = Storage::new(dir.path());
        let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
        assert_eq!(back, vec![entry(1)]);
    }

    #[test]
    fn jsonl_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(
            &path,
            "{\"n\":1,\"s\":\"a\"}\nnot json at all\n{\"n\":3,\"s\":\"c\"}\n",
        )
        .unwrap();

        let storage = Storage::new(dir.path());
        let err = storage.read_all_jsonl::<Entry>("log.jsonl").unwrap_err();
        match err {
            StorageError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn jsonl_blank_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "\n{\"n\":1,\"s\":\"a\"}\n\n{\"n\":2,\"s\":\"b\"}\n\n").unwrap();

        let storage = Storage::new(dir.path());
        let back: Vec<Entry> = storage.read_all_jsonl("log.jsonl").unwrap();
        assert_eq!(back, vec![entry(1), entry(2)]);
    }
}
