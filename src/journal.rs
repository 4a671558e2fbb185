//! Pretty-printed JSON array files used as append-mostly logs.

use std::fs;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::{AppError, AppResult};

struct Contents<T> {
    entries: Vec<T>,
    /// Some of the file could not be read.
    damaged: bool,
}

pub struct Journal<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _entries: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Journal {
            path: path.into(),
            lock: Mutex::new(()),
            _entries: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in file order. A missing file is empty. Entries that do
    /// not deserialize are skipped with a warning; a file that is not a JSON
    /// array reads as empty.
    pub fn read(&self) -> AppResult<Vec<T>> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        Ok(self.read_unlocked()?.entries)
    }

    /// Applies `change` to the entries and writes them back when it returns
    /// true. The whole read-modify-write holds the journal lock.
    ///
    /// When the file had unreadable content, it is copied to `<path>.bak`
    /// before being rewritten, so skipped entries can still be recovered.
    pub fn update<R>(&self, change: impl FnOnce(&mut Vec<T>) -> (bool, R)) -> AppResult<R> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let Contents { mut entries, damaged } = self.read_unlocked()?;
        let (dirty, result) = change(&mut entries);
        if dirty {
            if damaged {
                let backup = self.backup_path();
                fs::copy(&self.path, &backup)?;
                warn!("Kept a copy of {} as {} before rewriting it", self.path.display(), backup.display());
            }
            self.write_unlocked(&entries)?;
        }
        Ok(result)
    }

    /// Where a damaged file is copied before it is rewritten.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    fn read_unlocked(&self) -> AppResult<Contents<T>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(Contents {
                    entries: Vec::new(),
                    damaged: false,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&text) {
            Ok(values) => values,
            Err(err) => {
                warn!("Ignoring unreadable log {}: {}", self.path.display(), err);
                return Ok(Contents {
                    entries: Vec::new(),
                    damaged: true,
                });
            }
        };

        let mut damaged = false;
        let entries = values
            .into_iter()
            .enumerate()
            .filter_map(|(i, value)| match serde_json::from_value(value) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping entry {} of {}: {}", i, self.path.display(), err);
                    damaged = true;
                    None
                }
            })
            .collect();
        Ok(Contents { entries, damaged })
    }

    fn write_unlocked(&self, entries: &[T]) -> AppResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(entries)?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(json.as_bytes())?;
        file.persist(&self.path).map_err(|err| AppError::Io(err.error))?;
        Ok(())
    }
}

fn poisoned() -> AppError {
    AppError::Io(std::io::Error::other("journal lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn update_then_read() {
        let dir = TempDir::new().unwrap();
        let journal: Journal<u32> = Journal::new(dir.path().join("log.json"));
        assert!(journal.read().unwrap().is_empty());

        let len = journal
            .update(|entries| {
                entries.extend([1, 2]);
                (true, entries.len())
            })
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(journal.read().unwrap(), vec![1, 2]);

        journal.update(|entries| {
            entries.clear();
            (false, ())
        })
        .unwrap();
        assert_eq!(journal.read().unwrap(), vec![1, 2]);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        fs::write(&path, "[{not json").unwrap();
        let journal: Journal<u32> = Journal::new(&path);
        assert!(journal.read().unwrap().is_empty());
    }

    #[test]
    fn bad_entries_are_skipped_and_backed_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        fs::write(&path, r#"[1, "deux", 3]"#).unwrap();
        let journal: Journal<u32> = Journal::new(&path);
        assert_eq!(journal.read().unwrap(), vec![1, 3]);

        journal
            .update(|entries| {
                entries.push(4);
                (true, ())
            })
            .unwrap();
        assert_eq!(journal.read().unwrap(), vec![1, 3, 4]);
        let backup = fs::read_to_string(journal.backup_path()).unwrap();
        assert!(backup.contains("deux"));
    }

    #[test]
    fn clean_file_gets_no_backup() {
        let dir = TempDir::new().unwrap();
        let journal: Journal<u32> = Journal::new(dir.path().join("log.json"));
        journal.update(|entries| (true, entries.push(1))).unwrap();
        journal.update(|entries| (true, entries.push(2))).unwrap();
        assert!(!journal.backup_path().exists());
    }
}
