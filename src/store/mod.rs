//! Device-local key/value storage.
//!
//! Holds the handful of strings that must survive restarts: username, user id,
//! assigned variant and the cached personal best per variant. A single SQLite
//! connection lives on its own thread; async callers hand it closures and await
//! the reply on a oneshot channel.

use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;

mod migrations;

use migrations::run_migrations;

pub const USERNAME_KEY: &str = "simulator_username";
pub const USER_ID_KEY: &str = "simulator_user_id";
pub const VARIANT_KEY: &str = "simulator_variant";

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

enum Location {
    File(PathBuf),
    Memory,
}

#[derive(Clone)]
pub struct DeviceStore {
    inner: Arc<StoreInner>,
}

impl DeviceStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }
        Self::spawn(Location::File(path))
    }

    /// Store that lives only as long as the process; used by tests and `--ephemeral`.
    pub fn in_memory() -> Result<Self> {
        Self::spawn(Location::Memory)
    }

    fn spawn(location: Location) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path = match &location {
            Location::File(path) => Some(path.clone()),
            Location::Memory => None,
        };

        let worker = thread::Builder::new()
            .name("ab-sim-store".into())
            .spawn(move || {
                let opened = match &location {
                    Location::File(path) => Connection::open(path),
                    Location::Memory => Connection::open_in_memory(),
                };
                let mut conn = match opened {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open device store")));
                        return;
                    }
                };

                if matches!(location, Location::File(_)) {
                    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                        error!("Failed to enable WAL mode: {err}");
                    }
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run store migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Device store thread shutting down");
            })
            .context("failed to spawn device store worker thread")?;

        ready_rx
            .recv()
            .context("device store worker exited before signaling readiness")??;

        match &path {
            Some(path) => info!("Device store opened at {}", path.display()),
            None => info!("Device store opened in memory"),
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("device store thread terminated unexpectedly"))?
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read key {key}"))
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to write key {key}"))?;
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.execute(move |conn| {
            let removed = conn
                .execute("DELETE FROM kv WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete key {key}"))?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = DeviceStore::in_memory().unwrap();
        assert_eq!(store.get(USERNAME_KEY).await.unwrap(), None);

        store.set(USERNAME_KEY, "Brave Otter").await.unwrap();
        assert_eq!(
            store.get(USERNAME_KEY).await.unwrap().as_deref(),
            Some("Brave Otter")
        );
    }

    #[tokio::test]
    async fn set_overwrites_existing_value() {
        let store = DeviceStore::in_memory().unwrap();
        store.set(VARIANT_KEY, "A").await.unwrap();
        store.set(VARIANT_KEY, "B").await.unwrap();
        assert_eq!(store.get(VARIANT_KEY).await.unwrap().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn remove_reports_whether_key_existed() {
        let store = DeviceStore::in_memory().unwrap();
        store.set(USER_ID_KEY, "user_abc").await.unwrap();
        assert!(store.remove(USER_ID_KEY).await.unwrap());
        assert!(!store.remove(USER_ID_KEY).await.unwrap());
        assert_eq!(store.get(USER_ID_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let path = std::env::temp_dir()
            .join(format!("ab-sim-store-{}", uuid::Uuid::new_v4()))
            .join("device.sqlite3");
        {
            let store = DeviceStore::new(path.clone()).unwrap();
            store.set(VARIANT_KEY, "A").await.unwrap();
        }
        let reopened = DeviceStore::new(path).unwrap();
        assert_eq!(reopened.get(VARIANT_KEY).await.unwrap().as_deref(), Some("A"));
    }
}
