//! Durable bet storage shared by every connection.
//!
//! [`BetStore`] is the storage seam; [`Ledger`] wraps one store in the single
//! mutex through which every batch write and the draw read pass.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::task::JoinError;
use tracing::warn;

use crate::{
    bet::Bet,
    codec::{decode, encode, CodecError},
    framer::{FIELD_DELIMITER, RECORD_TERMINATOR},
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("ledger line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: CodecError,
    },
    #[error("storage worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// Append-only storage of bets.
pub trait BetStore: Send {
    /// Stores every bet or none of them.
    fn store_batch(&mut self, bets: &[Bet]) -> Result<(), StorageError>;

    /// Every stored bet, in the order it was stored.
    fn load_all(&mut self) -> Result<Vec<Bet>, StorageError>;
}

/// Bets kept one per line in a plain text file, in wire field order.
#[derive(Debug, Clone)]
pub struct FileBetStore {
    path: PathBuf,
}

impl FileBetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, contents: &[u8]) -> Result<(), StorageError> {
        self.append_with(|file| file.write_all(contents).and_then(|()| file.sync_data()))
    }

    /// Runs `write` against the ledger file. On failure the file is cut back
    /// to its length before the call.
    fn append_with(&self, write: impl FnOnce(&mut File) -> io::Result<()>) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let committed = file.metadata()?.len();

        if let Err(err) = write(&mut file) {
            if let Err(rollback) = file.set_len(committed) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "could not roll back partially written batch"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl BetStore for FileBetStore {
    fn store_batch(&mut self, bets: &[Bet]) -> Result<(), StorageError> {
        if bets.is_empty() {
            return Ok(());
        }

        let delimiter = FIELD_DELIMITER.to_string();
        let mut contents = String::new();
        for bet in bets {
            contents.push_str(&encode(bet).join(delimiter.as_str()));
            contents.push(RECORD_TERMINATOR);
        }
        self.append(contents.as_bytes())
    }

    fn load_all(&mut self) -> Result<Vec<Bet>, StorageError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut bets = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<String> = line.split(FIELD_DELIMITER).map(str::to_owned).collect();
            let bet = decode::<Bet>(&fields).map_err(|source| StorageError::Corrupt {
                line: index + 1,
                source,
            })?;
            bets.push(bet);
        }
        Ok(bets)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryBetStore {
    bets: Vec<Bet>,
}

impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BetStore for MemoryBetStore {
    fn store_batch(&mut self, bets: &[Bet]) -> Result<(), StorageError> {
        self.bets.extend_from_slice(bets);
        Ok(())
    }

    fn load_all(&mut self) -> Result<Vec<Bet>, StorageError> {
        Ok(self.bets.clone())
    }
}

/// The server-wide handle to bet storage.
pub struct Ledger {
    store: Mutex<Box<dyn BetStore>>,
}

impl Ledger {
    pub fn new(store: impl BetStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
        }
    }

    pub fn store_batch(&self, bets: &[Bet]) -> Result<(), StorageError> {
        self.lock().store_batch(bets)
    }

    pub fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
        self.lock().load_all()
    }

    /// Loads every bet and runs `f` over them without releasing the lock, so
    /// no batch can land between the load and the computation.
    pub fn read<T>(&self, f: impl FnOnce(&[Bet]) -> T) -> Result<T, StorageError> {
        let mut store = self.lock();
        let bets = store.load_all()?;
        Ok(f(&bets))
    }

    /// Runs `f` against the ledger on the blocking pool, keeping file I/O and
    /// lock waits off the async workers.
    pub async fn offload<T, F>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> Result<T, StorageError> + Send + 'static,
    {
        let ledger = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&ledger)).await?
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn BetStore>> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn bet(agency: u32, document: u64, number: u32) -> Bet {
        Bet {
            agency,
            first_name: "Laura".into(),
            last_name: "Pérez".into(),
            document,
            birthdate: NaiveDate::from_ymd_opt(1985, 11, 2).expect("valid date"),
            number,
        }
    }

    #[test]
    fn file_store_appends_batches_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bets.csv");
        let mut store = FileBetStore::new(&path);

        assert!(store.load_all().expect("missing file").is_empty());

        store
            .store_batch(&[bet(1, 10, 7574), bet(1, 11, 12)])
            .expect("first batch");
        store.store_batch(&[bet(2, 20, 99)]).expect("second batch");

        let loaded = store.load_all().expect("load");
        let documents: Vec<u64> = loaded.iter().map(|bet| bet.document).collect();
        assert_eq!(documents, vec![10, 11, 20]);
        assert_eq!(loaded[0], bet(1, 10, 7574));

        let raw = std::fs::read_to_string(&path).expect("read ledger");
        assert_eq!(raw.lines().next(), Some("1,Laura,Pérez,10,1985-11-02,7574"));
    }

    #[test]
    fn corrupt_line_is_reported_with_its_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bets.csv");
        std::fs::write(&path, "1,Laura,Pérez,10,1985-11-02,7574\n1,Laura,Pérez,ten\n")
            .expect("seed ledger");

        let err = FileBetStore::new(&path).load_all().expect_err("corrupt");
        assert!(matches!(err, StorageError::Corrupt { line: 2, .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_is_reported() {
        let mut store = FileBetStore::new("/dev/full");
        let err = store.store_batch(&[bet(1, 10, 1)]).expect_err("device is full");
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn failed_batch_leaves_no_partial_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileBetStore::new(dir.path().join("bets.csv"));
        store.store_batch(&[bet(1, 10, 7574)]).expect("seed");

        let err = store
            .append_with(|file| {
                file.write_all(b"1,Laura,P\xc3\xa9rez,11,1985-11-02,7574\n1,Lau")?;
                Err(io::Error::other("disk went away"))
            })
            .expect_err("write fails halfway");
        assert!(matches!(err, StorageError::Io(_)));

        assert_eq!(store.load_all().expect("load"), vec![bet(1, 10, 7574)]);
        store.store_batch(&[bet(1, 12, 3)]).expect("next batch");
        let documents: Vec<u64> = store.load_all().expect("load").iter().map(|bet| bet.document).collect();
        assert_eq!(documents, vec![10, 12]);
    }

    #[tokio::test]
    async fn offloaded_work_runs_against_the_ledger() {
        let ledger = Arc::new(Ledger::new(MemoryBetStore::new()));
        let bets = vec![bet(1, 10, 5), bet(1, 11, 6)];
        ledger
            .offload(move |ledger| ledger.store_batch(&bets))
            .await
            .expect("store");

        let count = ledger.offload(|ledger| ledger.load_all()).await.expect("load").len();
        assert_eq!(count, 2);
    }

    #[test]
    fn ledger_read_sees_a_consistent_snapshot() {
        let ledger = Ledger::new(MemoryBetStore::new());
        ledger.store_batch(&[bet(1, 10, 5)]).expect("store");
        ledger.store_batch(&[bet(2, 20, 5), bet(2, 21, 6)]).expect("store");

        let count = ledger
            .read(|bets| bets.iter().filter(|bet| bet.has_won(5)).count())
            .expect("read");
        assert_eq!(count, 2);
        assert_eq!(ledger.load_all().expect("load").len(), 3);
    }
}
