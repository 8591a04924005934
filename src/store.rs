//! Persistent Spill Store
//!
//! An append-only ordered map backed by LMDB (via heed). Items that could
//! not be handed directly to a worker are written here and survive a
//! process restart. Keys are monotonically increasing 64-bit counters
//! stored big-endian, so LMDB's native key order is insertion order and
//! the pump can drain oldest-first with a simple range scan.
//!
//! Every mutation commits its own transaction, so an entry is durable
//! before `append` or `remove` returns. Out-of-space conditions
//! (`MDB_MAP_FULL` or the filesystem itself) surface as the distinguished
//! [`QueueError::NoSpace`]; everything else maps to [`QueueError::Io`].

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use heed::byteorder::BigEndian;
use heed::types::{Bytes, U64};
use heed::{Database, Env, EnvOpenOptions};

use crate::error::{QueueError, QueueResult};

type SpillDb = Database<U64<BigEndian>, Bytes>;

pub(crate) struct SpillStore {
    env: Env,
    db: SpillDb,
    next_key: AtomicU64,
}

fn map_heed(err: heed::Error) -> QueueError {
    match err {
        heed::Error::Mdb(heed::MdbError::MapFull) => QueueError::NoSpace,
        heed::Error::Io(ref io) if io.kind() == std::io::ErrorKind::StorageFull => {
            QueueError::NoSpace
        }
        other => QueueError::io(other),
    }
}

impl SpillStore {
    /// Open or create the named map under `path`. The next key resumes
    /// one past the largest existing key, so keys never decrease across
    /// a process lifetime.
    pub fn open(path: &Path, name: &str, map_size: usize) -> QueueResult<Self> {
        std::fs::create_dir_all(path).map_err(QueueError::io)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path)
                .map_err(map_heed)?
        };

        let mut txn = env.write_txn().map_err(map_heed)?;
        let db = env
            .create_database::<U64<BigEndian>, Bytes>(&mut txn, Some(name))
            .map_err(map_heed)?;
        let next_key = db
            .last(&txn)
            .map_err(map_heed)?
            .map(|(key, _)| key + 1)
            .unwrap_or(0);
        txn.commit().map_err(map_heed)?;

        log::debug!(
            "spill store '{}' opened at {} (next key {})",
            name,
            path.display(),
            next_key
        );

        Ok(Self {
            env,
            db,
            next_key: AtomicU64::new(next_key),
        })
    }

    /// Durably write `bytes` under the next key and return it. Appends
    /// are serialized by the write transaction, so allocated keys follow
    /// call-arrival order.
    pub fn append(&self, bytes: &[u8]) -> QueueResult<u64> {
        let mut txn = self.env.write_txn().map_err(map_heed)?;
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.db.put(&mut txn, &key, bytes).map_err(map_heed)?;
        txn.commit().map_err(map_heed)?;
        Ok(key)
    }

    /// Least entry with a key strictly greater than `cursor`, or the
    /// first entry when `cursor` is `None`. Powers the pump's in-order
    /// scan.
    pub fn next_after(&self, cursor: Option<u64>) -> QueueResult<Option<(u64, Vec<u8>)>> {
        let txn = self.env.read_txn().map_err(map_heed)?;
        let entry = match cursor {
            None => self.db.first(&txn).map_err(map_heed)?,
            Some(key) => {
                let range = (Bound::Excluded(key), Bound::Unbounded);
                self.db
                    .range(&txn, &range)
                    .map_err(map_heed)?
                    .next()
                    .transpose()
                    .map_err(map_heed)?
            }
        };
        Ok(entry.map(|(key, bytes)| (key, bytes.to_vec())))
    }

    /// Durably delete an entry. Returns whether the key existed.
    pub fn remove(&self, key: u64) -> QueueResult<bool> {
        let mut txn = self.env.write_txn().map_err(map_heed)?;
        let existed = self.db.delete(&mut txn, &key).map_err(map_heed)?;
        txn.commit().map_err(map_heed)?;
        Ok(existed)
    }

    pub fn len(&self) -> QueueResult<u64> {
        let txn = self.env.read_txn().map_err(map_heed)?;
        self.db.len(&txn).map_err(map_heed)
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }
}
