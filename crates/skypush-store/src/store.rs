//! Append-only log-backed multi-map.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::{Codec, IdentityCodec, StoreError};

/// How to treat log lines that cannot be parsed during replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayMode {
    /// Refuse to open the store.
    #[default]
    Strict,
    /// Log the line and keep replaying.
    Lenient,
}

/// Options for [`KvStore::open_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub replay: ReplayMode,
}

/// A single logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Add,
    Remove,
}

impl Command {
    fn symbol(self) -> char {
        match self {
            Command::Add => '+',
            Command::Remove => '-',
        }
    }
}

struct Inner {
    /// Compressed key -> compressed values.
    map: HashMap<String, BTreeSet<String>>,
    log: File,
}

/// Durable multi-map from string keys to sets of string values.
///
/// Every mutation that changes the in-memory mirror appends exactly one line
/// to the backing file; no-op mutations write nothing. Reopening the file
/// replays those lines in order and reconstructs the same mirror.
///
/// Keys and values must be non-empty and must not contain spaces or line
/// breaks; [`KvStore::add`] rejects anything else.
pub struct KvStore {
    path: PathBuf,
    codec: Box<dyn Codec>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").field("path", &self.path).finish()
    }
}

impl KvStore {
    /// Open (or create) a store that stores keys and values verbatim.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, IdentityCodec, StoreOptions::default())
    }

    /// Open (or create) a store with a codec and replay options.
    pub fn open_with(
        path: impl AsRef<Path>,
        codec: impl Codec + 'static,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let map = if path.exists() {
            replay(&path, options.replay)?
        } else {
            HashMap::new()
        };

        let log = open_append(&path)?;

        info!(
            path = %path.display(),
            keys = map.len(),
            "store opened"
        );

        Ok(Self {
            path,
            codec: Box::new(codec),
            inner: Mutex::new(Inner { map, log }),
        })
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert `value` into the set for `key`.
    ///
    /// Returns `Ok(false)` without touching the disk if the pair already exists,
    /// and [`StoreError::InvalidEntry`] if either string cannot be logged.
    pub fn add(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let key = self.codec.compress(key);
        let value = self.codec.compress(value);
        check_entry("key", &key)?;
        check_entry("value", &value)?;
        let mut inner = self.lock();

        if inner
            .map
            .get(&*key)
            .is_some_and(|set| set.contains(&*value))
        {
            return Ok(false);
        }

        self.append(&mut inner.log, Command::Add, &key, &value)?;
        inner
            .map
            .entry(key.into_owned())
            .or_default()
            .insert(value.into_owned());
        Ok(true)
    }

    /// Remove `value` from the set for `key`.
    ///
    /// Returns `Ok(false)` without touching the disk if the pair is absent.
    pub fn remove(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let key = self.codec.compress(key);
        let value = self.codec.compress(value);
        let mut inner = self.lock();

        if !inner
            .map
            .get(&*key)
            .is_some_and(|set| set.contains(&*value))
        {
            return Ok(false);
        }

        self.append(&mut inner.log, Command::Remove, &key, &value)?;
        remove_from(&mut inner.map, &key, &value);
        Ok(true)
    }

    /// Snapshot of the values for `key`, or `None` if it has none.
    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let key = self.codec.compress(key);
        let inner = self.lock();
        inner.map.get(&*key).map(|set| {
            set.iter()
                .map(|v| self.codec.uncompress(v).into_owned())
                .collect()
        })
    }

    /// Whether `key` has at least one value.
    pub fn has(&self, key: &str) -> bool {
        let key = self.codec.compress(key);
        self.lock().map.contains_key(&*key)
    }

    /// All keys that currently have values.
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .map
            .keys()
            .map(|k| self.codec.uncompress(k).into_owned())
            .collect()
    }

    /// Number of values stored under `key`.
    pub fn num_entries(&self, key: &str) -> usize {
        let key = self.codec.compress(key);
        self.lock().map.get(&*key).map_or(0, BTreeSet::len)
    }

    /// Number of keys with at least one value.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Number of values across all keys.
    pub fn total_entries(&self) -> usize {
        self.lock().map.values().map(BTreeSet::len).sum()
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64, StoreError> {
        fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Flush appended lines to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.lock()
            .log
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Rewrite the log so it holds exactly one `+` line per live pair.
    ///
    /// The snapshot is written to a sibling temp file and renamed over the
    /// log, so a crash leaves either the old or the new file in place.
    /// Returns the number of lines in the new log.
    pub fn compact(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let tmp_path = self.path.with_extension("compact");

        let mut lines = 0;
        {
            let tmp = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
            let mut writer = BufWriter::new(tmp);
            let mut keys: Vec<&String> = inner.map.keys().collect();
            keys.sort();
            for key in keys {
                for value in &inner.map[key] {
                    writeln!(writer, "{} {} {}", Command::Add.symbol(), key, value)
                        .map_err(|e| StoreError::io(&tmp_path, e))?;
                    lines += 1;
                }
            }
            let file = writer
                .into_inner()
                .map_err(|e| StoreError::io(&tmp_path, e.into_error()))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        inner.log = open_append(&self.path)?;

        info!(path = %self.path.display(), lines, "store compacted");
        Ok(lines)
    }

    fn append(
        &self,
        log: &mut File,
        command: Command,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let line = format!("{} {} {}\n", command.symbol(), key, value);
        log.write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))
}

/// Only strings that survive a round trip through [`parse_line`] may be logged.
fn check_entry(field: &'static str, entry: &str) -> Result<(), StoreError> {
    if entry.is_empty() || entry.contains([' ', '\n', '\r']) {
        return Err(StoreError::InvalidEntry {
            field,
            entry: entry.to_string(),
        });
    }
    Ok(())
}

fn remove_from(map: &mut HashMap<String, BTreeSet<String>>, key: &str, value: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

/// Parse one log line into its command, key, and value.
fn parse_line(line: &str) -> Option<(Command, &str, &str)> {
    let mut parts = line.split(' ');
    let command = match parts.next()? {
        "+" => Command::Add,
        "-" => Command::Remove,
        _ => return None,
    };
    let key = parts.next().filter(|k| !k.is_empty())?;
    let value = parts.next().filter(|v| !v.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some((command, key, value))
}

/// Replay a log file into a fresh map.
fn replay(
    path: &Path,
    mode: ReplayMode,
) -> Result<HashMap<String, BTreeSet<String>>, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut skipped = 0usize;
    let mut replayed = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.is_empty() {
            continue;
        }

        match parse_line(&line) {
            Some((Command::Add, key, value)) => {
                map.entry(key.to_string())
                    .or_default()
                    .insert(value.to_string());
            }
            Some((Command::Remove, key, value)) => remove_from(&mut map, key, value),
            None => match mode {
                ReplayMode::Strict => {
                    return Err(StoreError::Corrupt {
                        path: path.to_path_buf(),
                        line: index + 1,
                        content: line,
                    });
                }
                ReplayMode::Lenient => {
                    warn!(
                        path = %path.display(),
                        line = index + 1,
                        content = %line,
                        "skipping malformed log line"
                    );
                    skipped += 1;
                    continue;
                }
            },
        }
        replayed += 1;
    }

    debug!(path = %path.display(), replayed, skipped, "log replayed");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrefixCodec;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn read_log(store: &KvStore) -> Vec<String> {
        fs::read_to_string(store.path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_open_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tokens.log");
        let store = KvStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.is_empty());
        assert_eq!(store.file_size().unwrap(), 0);
    }

    #[test]
    fn test_add_writes_one_line() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path().join("s.log")).unwrap();

        assert!(store.add("did:plc:a", "tok1").unwrap());
        assert!(!store.add("did:plc:a", "tok1").unwrap());

        assert_eq!(read_log(&store), vec!["+ did:plc:a tok1"]);
        assert_eq!(store.get("did:plc:a"), Some(vec!["tok1".to_string()]));
    }

    #[test]
    fn test_add_rejects_unloggable_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.log");
        let store = KvStore::open_with(&path, PrefixCodec::atproto(), StoreOptions::default()).unwrap();

        for (key, value) in [
            ("at://did:plc:b/app.bsky.feed.post/a b", "at://did:plc:c/app.bsky.feed.post/r"),
            ("did:plc:b", "tok\n+ did:plc:x evil"),
            ("did:plc:b", "tok\r"),
            ("", "tok"),
            ("did:plc:b", ""),
        ] {
            let err = store.add(key, value).unwrap_err();
            assert!(matches!(err, StoreError::InvalidEntry { .. }), "{err}");
        }
        assert!(!store.remove("did:plc:b", "a b").unwrap());
        store.add("did:plc:b", "tok").unwrap();
        drop(store);

        // Strict replay still accepts the log.
        let reopened = KvStore::open_with(&path, PrefixCodec::atproto(), StoreOptions::default()).unwrap();
        assert_eq!(reopened.keys(), vec!["did:plc:b".to_string()]);
        assert_eq!(reopened.get("did:plc:b"), Some(vec!["tok".to_string()]));
    }

    #[test]
    fn test_remove_absent_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path().join("s.log")).unwrap();

        assert!(!store.remove("did:plc:a", "tok1").unwrap());
        store.add("did:plc:a", "tok1").unwrap();
        assert!(!store.remove("did:plc:a", "tok2").unwrap());
        assert!(store.remove("did:plc:a", "tok1").unwrap());
        assert!(!store.remove("did:plc:a", "tok1").unwrap());

        assert_eq!(read_log(&store), vec!["+ did:plc:a tok1", "- did:plc:a tok1"]);
        assert_eq!(store.get("did:plc:a"), None);
        assert!(!store.has("did:plc:a"));
    }

    #[test]
    fn test_reads() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path().join("s.log")).unwrap();
        store.add("k1", "a").unwrap();
        store.add("k1", "b").unwrap();
        store.add("k2", "c").unwrap();

        assert!(store.has("k1"));
        assert!(!store.has("k3"));
        assert_eq!(store.num_entries("k1"), 2);
        assert_eq!(store.num_entries("k3"), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_entries(), 3);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.log");
        {
            let store = KvStore::open(&path).unwrap();
            store.add("k", "a").unwrap();
            store.add("k", "b").unwrap();
            store.remove("k", "a").unwrap();
            store.add("j", "c").unwrap();
            store.remove("j", "c").unwrap();
        }

        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.get("k"), Some(vec!["b".to_string()]));
        assert_eq!(store.get("j"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_codec_applies_to_file_and_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quotes.log");
        let quoted = "at://did:plc:bbb/app.bsky.feed.post/abc";
        let quoting = "at://did:plc:ccc/app.bsky.feed.post/xyz";
        {
            let store =
                KvStore::open_with(&path, PrefixCodec::atproto(), StoreOptions::default()).unwrap();
            store.add(quoted, quoting).unwrap();
            assert_eq!(
                read_log(&store),
                vec!["+ ~0bbb/app.bsky.feed.post/abc ~0ccc/app.bsky.feed.post/xyz"]
            );
        }

        let store =
            KvStore::open_with(&path, PrefixCodec::atproto(), StoreOptions::default()).unwrap();
        assert_eq!(store.get(quoted), Some(vec![quoting.to_string()]));
        assert_eq!(store.keys(), vec![quoted.to_string()]);
        assert!(store.has(quoted));
    }

    #[test]
    fn test_strict_replay_rejects_corrupt_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.log");
        fs::write(&path, "+ k a\n* k b\n").unwrap();

        let err = KvStore::open(&path).unwrap_err();
        match err {
            StoreError::Corrupt { line, content, .. } => {
                assert_eq!(line, 2);
                assert_eq!(content, "* k b");
            }
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[test]
    fn test_lenient_replay_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.log");
        fs::write(&path, "+ k a\n+ k\n+ k b c\n\n- k a\n+ k d\n").unwrap();

        let options = StoreOptions {
            replay: ReplayMode::Lenient,
        };
        let store = KvStore::open_with(&path, IdentityCodec, options).unwrap();
        assert_eq!(store.get("k"), Some(vec!["d".to_string()]));
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("+ k v"), Some((Command::Add, "k", "v")));
        assert_eq!(parse_line("- k v"), Some((Command::Remove, "k", "v")));
        assert_eq!(parse_line("+ k"), None);
        assert_eq!(parse_line("+  v"), None);
        assert_eq!(parse_line("+ k v extra"), None);
        assert_eq!(parse_line("x k v"), None);
    }

    #[test]
    fn test_compact_rewrites_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.log");
        let store = KvStore::open(&path).unwrap();
        store.add("k", "a").unwrap();
        store.add("k", "b").unwrap();
        store.remove("k", "a").unwrap();
        store.add("j", "c").unwrap();

        assert_eq!(store.compact().unwrap(), 2);
        assert_eq!(read_log(&store), vec!["+ j c", "+ k b"]);

        // Appends continue on the compacted file.
        store.add("k", "e").unwrap();
        assert_eq!(read_log(&store), vec!["+ j c", "+ k b", "+ k e"]);
        drop(store);

        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.get("k"), Some(vec!["b".to_string(), "e".to_string()]));
        assert_eq!(store.get("j"), Some(vec!["c".to_string()]));
    }
}
