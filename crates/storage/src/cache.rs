//! The optional leader-only tag-row cache. Striped locking bounds
//! contention; eviction on apply is mandatory for correctness, so the
//! apply path evicts every `(vertexId, tagId)` a plan touches and only
//! the current leader populates entries.

use models::TagId;
use std::collections::HashMap;
use std::sync::Mutex;

const STRIPES: usize = 64;

pub struct VertexCache {
    stripes: Vec<Mutex<HashMap<(Vec<u8>, TagId), Vec<u8>>>>,
    per_stripe_cap: usize,
}

impl VertexCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
            per_stripe_cap: (capacity / STRIPES).max(16),
        }
    }

    fn stripe(&self, vid: &[u8], tag: TagId) -> &Mutex<HashMap<(Vec<u8>, TagId), Vec<u8>>> {
        let h = fxhash::hash64(&(vid, tag));
        &self.stripes[(h % STRIPES as u64) as usize]
    }

    pub fn get(&self, vid: &[u8], tag: TagId) -> Option<Vec<u8>> {
        self.stripe(vid, tag)
            .lock()
            .unwrap()
            .get(&(vid.to_vec(), tag))
            .cloned()
    }

    pub fn put(&self, vid: &[u8], tag: TagId, row: Vec<u8>) {
        let mut stripe = self.stripe(vid, tag).lock().unwrap();
        if stripe.len() >= self.per_stripe_cap {
            // Coarse reclamation; entries repopulate on read.
            stripe.clear();
        }
        stripe.insert((vid.to_vec(), tag), row);
    }

    pub fn evict(&self, vid: &[u8], tag: TagId) {
        self.stripe(vid, tag)
            .lock()
            .unwrap()
            .remove(&(vid.to_vec(), tag));
    }

    /// Drop everything, e.g. on losing leadership.
    pub fn clear(&self) {
        for stripe in &self.stripes {
            stripe.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_put_get_evict() {
        let cache = VertexCache::new(1024);
        cache.put(b"v1", 3, b"row".to_vec());
        assert_eq!(cache.get(b"v1", 3), Some(b"row".to_vec()));
        assert_eq!(cache.get(b"v1", 4), None);

        cache.evict(b"v1", 3);
        assert_eq!(cache.get(b"v1", 3), None);
    }

    #[test]
    fn test_clear() {
        let cache = VertexCache::new(1024);
        cache.put(b"a", 1, vec![1]);
        cache.put(b"b", 2, vec![2]);
        cache.clear();
        assert_eq!(cache.get(b"a", 1), None);
        assert_eq!(cache.get(b"b", 2), None);
    }
}
