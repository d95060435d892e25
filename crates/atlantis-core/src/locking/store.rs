//! SQLite-backed implementation of the lock store.
//!
//! All lock state lives in a single `atlantis.db` file inside the data
//! directory. Writes run inside immediate transactions so check-and-put
//! is atomic; reads see committed state only.
//!
//! A sidecar advisory file lock (`atlantis.db.lock`) is taken exclusively
//! at open time. If another process holds it the open fails within one
//! second with a diagnostic, which prevents two server instances sharing
//! one data directory.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use super::{LockError, LockStore, ProjectLock, lock_key};

/// File name of the store inside the data directory.
const DB_FILE: &str = "atlantis.db";

/// Schema for lock storage.
const LOCKS_SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 1000;

CREATE TABLE IF NOT EXISTS locks (
    key  TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
";

/// How long to retry the advisory lock before concluding another
/// instance owns the store.
const OPEN_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Durable lock store over a single SQLite file.
pub struct SqliteLockStore {
    conn: Mutex<Connection>,
    // Held for the lifetime of the store; dropping it releases the
    // advisory lock.
    _guard: File,
}

impl std::fmt::Debug for SqliteLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLockStore").finish_non_exhaustive()
    }
}

impl SqliteLockStore {
    /// Opens (creating if necessary) the lock store under `data_dir`.
    ///
    /// The data directory is created mode 0700 and the store file mode
    /// 0600.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyOpen`] if another process holds the
    /// store, [`LockError::Io`] on filesystem failures and
    /// [`LockError::Storage`] if the schema cannot be initialised.
    pub fn new(data_dir: &Path) -> Result<Self, LockError> {
        create_private_dir(data_dir)?;

        let db_path = data_dir.join(DB_FILE);
        let guard = acquire_open_lock(&db_path)?;

        let conn = Connection::open(&db_path)?;
        restrict_mode(&db_path, 0o600)?;
        conn.execute_batch(LOCKS_SCHEMA)?;
        debug!(path = %db_path.display(), "lock store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            _guard: guard,
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-transaction;
        // the transaction was rolled back, so the connection is usable.
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn decode(key: &str, data: &str) -> Result<ProjectLock, LockError> {
    serde_json::from_str(data).map_err(|source| LockError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn create_private_dir(dir: &Path) -> Result<(), LockError> {
    fs::create_dir_all(dir)?;
    restrict_mode(dir, 0o700)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_mode(path: &Path, mode: u32) -> Result<(), LockError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _mode: u32) -> Result<(), LockError> {
    Ok(())
}

/// Takes the sidecar advisory lock, retrying for up to one second.
fn acquire_open_lock(db_path: &Path) -> Result<File, LockError> {
    let lock_path = sidecar_path(db_path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    restrict_mode(&lock_path, 0o600)?;

    let deadline = Instant::now() + OPEN_LOCK_TIMEOUT;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                return Err(LockError::AlreadyOpen {
                    path: db_path.display().to_string(),
                });
            }
        }
    }
}

fn sidecar_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.file_name().map_or_else(
        || DB_FILE.to_string(),
        |n| n.to_string_lossy().into_owned(),
    );
    name.push_str(".lock");
    db_path.with_file_name(name)
}

impl LockStore for SqliteLockStore {
    fn try_lock(&self, new_lock: &ProjectLock) -> Result<(bool, ProjectLock), LockError> {
        let key = lock_key(&new_lock.project, &new_lock.workspace);
        let encoded =
            serde_json::to_string(new_lock).map_err(LockError::Serialize)?;

        let mut conn = self.lock_conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row("SELECT data FROM locks WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        let result = match existing {
            None => {
                tx.execute(
                    "INSERT INTO locks (key, data) VALUES (?1, ?2)",
                    params![key, encoded],
                )?;
                (true, new_lock.clone())
            }
            Some(data) => (false, decode(&key, &data)?),
        };
        tx.commit()?;
        Ok(result)
    }

    fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row("SELECT data FROM locks WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        tx.execute("DELETE FROM locks WHERE key = ?1", params![key])?;
        tx.commit()?;

        existing.map(|data| decode(key, &data)).transpose()
    }

    fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        let conn = self.lock_conn();
        let existing: Option<String> = conn
            .query_row("SELECT data FROM locks WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        existing.map(|data| decode(key, &data)).transpose()
    }

    fn list(&self) -> Result<Vec<(String, ProjectLock)>, LockError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT key, data FROM locks ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut locks = Vec::new();
        for row in rows {
            let (key, data) = row?;
            let lock = decode(&key, &data)?;
            locks.push((key, lock));
        }
        Ok(locks)
    }

    fn unlock_by_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<ProjectLock>, LockError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut matching: Vec<(String, ProjectLock)> = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT key, data FROM locks ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, data) = row?;
                let lock = decode(&key, &data)?;
                if lock.project.repo_full_name == repo_full_name && lock.pull.num == pull_num
                {
                    matching.push((key, lock));
                }
            }
        }

        for (key, _) in &matching {
            tx.execute("DELETE FROM locks WHERE key = ?1", params![key])?;
        }
        tx.commit()?;

        Ok(matching.into_iter().map(|(_, lock)| lock).collect())
    }
}
