//! The RocksDB-backed engine.

use super::{prefix_upper_bound, Batch, BatchOp, Error, KvEngine, KvIterator, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct RocksEngine {
    db: Arc<rocksdb::DB>,
    path: PathBuf,
}

impl RocksEngine {
    /// Open (creating if missing) an engine rooted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = rocksdb::DB::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    fn iterate(&self, begin: &[u8], end: Option<&[u8]>) -> Box<dyn KvIterator> {
        let mut opts = rocksdb::ReadOptions::default();
        opts.set_iterate_lower_bound(begin.to_vec());
        if let Some(end) = end {
            opts.set_iterate_upper_bound(end.to_vec());
        }

        // RocksDB iterators pin an implicit snapshot at creation, giving the
        // point-in-time semantics of the engine contract.
        let iter = self.db.raw_iterator_opt(opts);

        // Safety: `iter` borrows only from the DB held by the Arc stored
        // alongside it in RocksIterator, whose field order drops the
        // iterator before the Arc. The ReadOptions are owned by the
        // iterator itself.
        let mut iter: rocksdb::DBRawIterator<'static> = unsafe { std::mem::transmute(iter) };
        iter.seek_to_first();

        Box::new(RocksIterator {
            iter,
            _db: self.db.clone(),
        })
    }
}

struct RocksIterator {
    // Declaration order: `iter` must drop before `_db`.
    iter: rocksdb::DBRawIterator<'static>,
    _db: Arc<rocksdb::DB>,
}

impl KvIterator for RocksIterator {
    fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.iter.valid() {
            self.iter.status()?;
            return Ok(None);
        }
        let pair = (
            self.iter.key().expect("valid iterator has a key").to_vec(),
            self.iter
                .value()
                .expect("valid iterator has a value")
                .to_vec(),
        );
        self.iter.next();
        Ok(Some(pair))
    }
}

impl KvEngine for RocksEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.db
            .multi_get(keys)
            .into_iter()
            .map(|res| res.map_err(Error::from))
            .collect()
    }

    fn prefix(&self, prefix: &[u8]) -> Result<Box<dyn KvIterator>> {
        let end = prefix_upper_bound(prefix);
        Ok(self.iterate(prefix, end.as_deref()))
    }

    fn range(&self, begin: &[u8], end: &[u8]) -> Result<Box<dyn KvIterator>> {
        Ok(self.iterate(begin, Some(end)))
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => wb.put(key, value),
                BatchOp::Remove(key) => wb.delete(key),
                BatchOp::RemoveRange(begin, end) => wb.delete_range(begin, end),
            }
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn ingest_sst_files(&self, paths: &[PathBuf]) -> Result<()> {
        self.db.ingest_external_file(paths.to_vec())?;
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn update_options(&self, options: &std::collections::BTreeMap<String, String>) -> Result<()> {
        for (name, value) in options {
            if let Err(err) = self.db.set_options(&[(name.as_str(), value.as_str())]) {
                // Knobs are an opaque pass-through; the engine is the
                // authority on which it accepts.
                tracing::warn!(%name, %value, %err, "engine rejected option");
            }
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;
        match err.kind() {
            ErrorKind::Corruption => Error::Corruption(err.into_string()),
            ErrorKind::ColumnFamilyDropped | ErrorKind::ShutdownInProgress => Error::CfClosed,
            ErrorKind::IOError => {
                let text = err.into_string();
                if text.contains("No space left") {
                    Error::DiskFull(text)
                } else {
                    Error::Io(text)
                }
            }
            _ => Error::Io(err.into_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(mut it: Box<dyn KvIterator>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(pair) = it.next_pair().unwrap() {
            out.push(pair);
        }
        out
    }

    #[test]
    fn test_write_read_scan() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = RocksEngine::open(dir.path()).unwrap();

        let mut batch = Batch::new();
        batch.put(&b"a1"[..], &b"1"[..]);
        batch.put(&b"a2"[..], &b"2"[..]);
        batch.put(&b"b1"[..], &b"3"[..]);
        engine.write(batch).unwrap();

        assert_eq!(engine.get(b"a1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"nope").unwrap(), None);

        let pairs = drain(engine.prefix(b"a").unwrap());
        assert_eq!(
            pairs,
            vec![
                (b"a1".to_vec(), b"1".to_vec()),
                (b"a2".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_snapshot_isolation() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = RocksEngine::open(dir.path()).unwrap();

        let mut batch = Batch::new();
        batch.put(&b"k1"[..], &b"v1"[..]);
        engine.write(batch).unwrap();

        let it = engine.prefix(b"k").unwrap();

        let mut batch = Batch::new();
        batch.put(&b"k2"[..], &b"v2"[..]);
        engine.write(batch).unwrap();

        assert_eq!(drain(it), vec![(b"k1".to_vec(), b"v1".to_vec())]);
    }

    #[test]
    fn test_remove_range_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let engine = RocksEngine::open(dir.path()).unwrap();
            let mut batch = Batch::new();
            for key in [&b"a"[..], b"b", b"c", b"d"] {
                batch.put(key, &b"x"[..]);
            }
            batch.remove_range(&b"b"[..], &b"d"[..]);
            engine.write(batch).unwrap();
            engine.flush().unwrap();
        }

        let engine = RocksEngine::open(dir.path()).unwrap();
        let keys: Vec<_> = drain(engine.prefix(b"").unwrap())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"d".to_vec()]);
    }
}
