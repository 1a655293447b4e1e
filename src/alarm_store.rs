/// File-backed alarm facility.
///
/// One JSON entry per timer kind under `<data_dir>/alarms/`, written with the
/// atomic temp-file + rename pattern. The entries outlive the process that
/// armed them; `revive alarmd` consumes them when they come due.
///
/// Host and daemon both touch the directory, so each operation holds an
/// exclusive advisory lock on `alarms/.lock`. The lock is only ever tried,
/// with a short bounded retry: a stuck holder turns into an `AlarmError::Lock`
/// rather than a blocked caller.
use crate::data_dir::DataDir;
use crate::timer::{AlarmError, AlarmFacility, TimerKind};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// A persisted pending fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmEntry {
    pub kind: TimerKind,
    pub fire_at: DateTime<Utc>,
    pub armed_at: DateTime<Utc>,
    /// PID of the process that armed the alarm.
    pub pid: u32,
}

impl AlarmEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct FileAlarmStore {
    data_dir: DataDir,
}

/// Held for the duration of one store operation; unlocks on drop.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileAlarmStore {
    /// Open the store, creating the alarms directory if needed.
    ///
    /// Fails when the directory cannot be created; callers treat that as
    /// "alarm facility unavailable".
    pub fn open(data_dir: DataDir) -> Result<Self, AlarmError> {
        let dir = data_dir.alarms_dir();
        std::fs::create_dir_all(&dir).map_err(|e| AlarmError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    fn lock(&self) -> Result<StoreLock, AlarmError> {
        let path = self.data_dir.alarms_lock();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| AlarmError::Lock {
                path: path.clone(),
                source: e,
            })?;
        let contended = fs2::lock_contended_error().raw_os_error();
        let mut attempt = 1;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(StoreLock { file }),
                Err(e) if e.raw_os_error() == contended && attempt < LOCK_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), attempt, "alarm store lock not acquired");
                    return Err(AlarmError::Lock { path, source: e });
                }
            }
        }
    }

    fn write_entry(&self, entry: &AlarmEntry) -> Result<(), AlarmError> {
        let json =
            serde_json::to_string_pretty(entry).map_err(|e| AlarmError::Serialize { source: e })?;
        let path = self.data_dir.alarm_file(entry.kind);
        let tmp_path = self.data_dir.alarms_dir().join(format!(
            ".{}.tmp.{}",
            entry.kind.as_str(),
            std::process::id()
        ));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| AlarmError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| AlarmError::Io { path, source: e })
    }

    fn remove_entry(path: &Path) -> Result<(), AlarmError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AlarmError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Paths of every stored entry.
    fn entry_paths(&self) -> Vec<PathBuf> {
        let pattern = self.data_dir.alarms_dir().join("*.json");
        let pattern = pattern.to_string_lossy();
        match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "invalid alarm glob pattern");
                Vec::new()
            }
        }
    }

    fn read_entry(path: &Path) -> Option<AlarmEntry> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt alarm entry");
                None
            }
        }
    }

    /// Store `entry`, replacing any pending entry of the same kind.
    pub fn put(&self, entry: &AlarmEntry) -> Result<(), AlarmError> {
        let _lock = self.lock()?;
        self.write_entry(entry)
    }

    /// All pending entries, ordered by fire time.
    pub fn pending(&self) -> Result<Vec<AlarmEntry>, AlarmError> {
        let _lock = self.lock()?;
        let mut entries: Vec<AlarmEntry> = self
            .entry_paths()
            .iter()
            .filter_map(|p| Self::read_entry(p))
            .collect();
        entries.sort_by_key(|e| e.fire_at);
        Ok(entries)
    }

    /// Remove and return every entry due at `now`, ordered by fire time.
    ///
    /// Each fire is one-shot: the arming side re-arms on delivery.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<AlarmEntry>, AlarmError> {
        let _lock = self.lock()?;
        let mut due = Vec::new();
        for path in self.entry_paths() {
            let Some(entry) = Self::read_entry(&path) else {
                continue;
            };
            if entry.is_due(now) {
                Self::remove_entry(&path)?;
                due.push(entry);
            }
        }
        due.sort_by_key(|e| e.fire_at);
        Ok(due)
    }
}

impl AlarmFacility for FileAlarmStore {
    fn arm(&self, kind: TimerKind, fire_at: DateTime<Utc>) -> Result<(), AlarmError> {
        self.put(&AlarmEntry {
            kind,
            fire_at,
            armed_at: Utc::now(),
            pid: std::process::id(),
        })
    }

    fn cancel(&self, kind: TimerKind) -> Result<(), AlarmError> {
        let _lock = self.lock()?;
        Self::remove_entry(&self.data_dir.alarm_file(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, FileAlarmStore) {
        let tmp = tempdir().unwrap();
        let store = FileAlarmStore::open(DataDir::new(tmp.path().join(".revive"))).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_arm_writes_one_entry_per_kind() {
        let (_tmp, store) = store();
        let at = Utc::now() + Duration::seconds(3);

        store.arm(TimerKind::Short, at).unwrap();
        store.arm(TimerKind::Short, at + Duration::seconds(1)).unwrap();
        store.arm(TimerKind::Long, at + Duration::seconds(30)).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, TimerKind::Short);
        assert_eq!(pending[0].fire_at, at + Duration::seconds(1));
        assert_eq!(pending[0].pid, std::process::id());
        assert_eq!(pending[1].kind, TimerKind::Long);
    }

    #[test]
    fn test_entry_file_is_json() {
        let (_tmp, store) = store();
        store.arm(TimerKind::Long, Utc::now()).unwrap();

        let path = store.data_dir().alarm_file(TimerKind::Long);
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["kind"], "long");
        assert!(parsed["fire_at"].is_string());

        // No temp file left behind by the rename.
        let tmp_path = store
            .data_dir()
            .alarms_dir()
            .join(format!(".long.tmp.{}", std::process::id()));
        assert!(!tmp_path.exists());
    }

    #[test]
    fn test_cancel_removes_entry_and_is_idempotent() {
        let (_tmp, store) = store();
        store.arm(TimerKind::Short, Utc::now()).unwrap();
        store.cancel(TimerKind::Short).unwrap();
        assert!(store.pending().unwrap().is_empty());
        store.cancel(TimerKind::Short).unwrap();
    }

    #[test]
    fn test_take_due_only_returns_due_entries() {
        let (_tmp, store) = store();
        let now = Utc::now();
        store.arm(TimerKind::Short, now - Duration::milliseconds(10)).unwrap();
        store.arm(TimerKind::Long, now + Duration::seconds(30)).unwrap();

        let due = store.take_due(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, TimerKind::Short);

        // Consumed: a second take returns nothing, the long entry remains.
        assert!(store.take_due(now).unwrap().is_empty());
        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TimerKind::Long);
    }

    #[test]
    fn test_fire_at_exactly_now_is_due() {
        let (_tmp, store) = store();
        let now = Utc::now();
        store.arm(TimerKind::Long, now).unwrap();
        assert_eq!(store.take_due(now).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_skipped() {
        let (_tmp, store) = store();
        std::fs::write(store.data_dir().alarm_file(TimerKind::Short), "not json").unwrap();
        store.arm(TimerKind::Long, Utc::now()).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TimerKind::Long);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let tmp = tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".revive"));
        let at = Utc::now() + Duration::seconds(3);
        FileAlarmStore::open(dd.clone())
            .unwrap()
            .arm(TimerKind::Short, at)
            .unwrap();

        let reopened = FileAlarmStore::open(dd).unwrap();
        let pending = reopened.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fire_at, at);
    }

    #[test]
    fn test_open_fails_when_dir_cannot_be_created() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = FileAlarmStore::open(DataDir::new(blocker.join(".revive"))).unwrap_err();
        assert!(matches!(err, AlarmError::Io { .. }));
    }

    #[test]
    fn test_held_lock_fails_fast_instead_of_blocking() {
        let (_tmp, store) = store();
        let holder = File::create(store.data_dir().alarms_lock()).unwrap();
        holder.lock_exclusive().unwrap();

        let started = std::time::Instant::now();
        let err = store
            .arm(TimerKind::Short, Utc::now() + Duration::seconds(3))
            .unwrap_err();
        assert!(matches!(err, AlarmError::Lock { .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        FileExt::unlock(&holder).unwrap();
        store
            .arm(TimerKind::Short, Utc::now() + Duration::seconds(3))
            .unwrap();
        assert_eq!(store.pending().unwrap().len(), 1);
    }
}
