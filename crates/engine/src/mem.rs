//! An ordered in-memory engine: the `engine_type=memory` backend and the
//! test double for everything layered above the engine.

use super::{prefix_upper_bound, Batch, BatchOp, Error, KvEngine, KvIterator, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

#[derive(Default)]
pub struct MemEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

// Snapshot isolation by materialization: the matching range is copied out
// under the read lock at iterator creation.
struct MemIterator {
    pairs: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl KvIterator for MemIterator {
    fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.pairs.next())
    }
}

impl MemEngine {
    fn collect(&self, begin: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Box<dyn KvIterator> {
        let map = self.map.read().unwrap();
        let pairs: Vec<_> = map
            .range((begin, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(MemIterator {
            pairs: pairs.into_iter(),
        })
    }
}

impl KvEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    fn prefix(&self, prefix: &[u8]) -> Result<Box<dyn KvIterator>> {
        let end = match prefix_upper_bound(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Ok(self.collect(Bound::Included(prefix.to_vec()), end))
    }

    fn range(&self, begin: &[u8], end: &[u8]) -> Result<Box<dyn KvIterator>> {
        Ok(self.collect(
            Bound::Included(begin.to_vec()),
            Bound::Excluded(end.to_vec()),
        ))
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let mut map = self.map.write().unwrap();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Remove(key) => {
                    map.remove(&key);
                }
                BatchOp::RemoveRange(begin, end) => {
                    let doomed: Vec<_> = map
                        .range(begin..end)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn ingest_sst_files(&self, _paths: &[std::path::PathBuf]) -> Result<()> {
        Err(Error::NotSupported("sst ingest on the memory engine"))
    }

    fn compact(&self) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn update_options(&self, _options: &std::collections::BTreeMap<String, String>) -> Result<()> {
        Ok(())
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
    fn test_batch_and_reads() {
        let engine = MemEngine::new();
        let mut batch = Batch::new();
        batch.put(&b"a1"[..], &b"1"[..]);
        batch.put(&b"a2"[..], &b"2"[..]);
        batch.put(&b"b1"[..], &b"3"[..]);
        engine.write(batch).unwrap();

        assert_eq!(engine.get(b"a2").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.get(b"zz").unwrap(), None);

        let pairs = drain(engine.prefix(b"a").unwrap());
        assert_eq!(
            pairs,
            vec![
                (b"a1".to_vec(), b"1".to_vec()),
                (b"a2".to_vec(), b"2".to_vec()),
            ]
        );

        let pairs = drain(engine.range(b"a2", b"b2").unwrap());
        assert_eq!(
            pairs,
            vec![
                (b"a2".to_vec(), b"2".to_vec()),
                (b"b1".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_is_a_snapshot() {
        let engine = MemEngine::new();
        let mut batch = Batch::new();
        batch.put(&b"k1"[..], &b"v1"[..]);
        engine.write(batch).unwrap();

        let it = engine.prefix(b"k").unwrap();

        // A write landing after iterator creation is not observed.
        let mut batch = Batch::new();
        batch.put(&b"k2"[..], &b"v2"[..]);
        engine.write(batch).unwrap();

        assert_eq!(drain(it), vec![(b"k1".to_vec(), b"v1".to_vec())]);
    }

    #[test]
    fn test_remove_range() {
        let engine = MemEngine::new();
        let mut batch = Batch::new();
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            batch.put(key, &b"x"[..]);
        }
        engine.write(batch).unwrap();

        let mut batch = Batch::new();
        batch.remove_range(&b"b"[..], &b"d"[..]);
        engine.write(batch).unwrap();

        let keys: Vec<_> = drain(engine.prefix(b"").unwrap())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"d".to_vec()]);
    }
}
