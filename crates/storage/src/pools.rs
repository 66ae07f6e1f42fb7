//! Admission control for read traffic, by priority class. Each class
//! owns a fixed number of slots; control-plane traffic in a high class
//! is never starved by a flood of best-effort scans. Every server-side
//! read handler acquires a permit from its request's class before
//! touching the engine.

use proto_storage::storage::RequestPriority;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Priority {
    HighImportant = 0,
    High = 1,
    Important = 2,
    Normal = 3,
    BestEffort = 4,
}

impl Priority {
    /// Map a request's wire priority; unknown values fall back to
    /// `Normal`, matching the wire default.
    pub fn from_wire(value: i32) -> Priority {
        match RequestPriority::try_from(value) {
            Ok(RequestPriority::HighImportant) => Priority::HighImportant,
            Ok(RequestPriority::High) => Priority::High,
            Ok(RequestPriority::Important) => Priority::Important,
            Ok(RequestPriority::BestEffort) => Priority::BestEffort,
            Ok(RequestPriority::Normal) | Err(_) => Priority::Normal,
        }
    }
}

pub struct PriorityPools {
    pools: Vec<Arc<Semaphore>>,
}

impl PriorityPools {
    /// `sizes` lists slot counts, highest priority class first; a short
    /// list reuses its last entry for the remaining classes.
    pub fn new(sizes: &[usize]) -> PriorityPools {
        let last = *sizes.last().unwrap_or(&1);
        let pools = (0..=Priority::BestEffort as usize)
            .map(|class| {
                let size = sizes.get(class).copied().unwrap_or(last);
                Arc::new(Semaphore::new(size.max(1)))
            })
            .collect();
        PriorityPools { pools }
    }

    pub async fn admit(&self, priority: Priority) -> OwnedSemaphorePermit {
        self.pools[priority as usize]
            .clone()
            .acquire_owned()
            .await
            .expect("admission pools never close")
    }

    pub fn available(&self, priority: Priority) -> usize {
        self.pools[priority as usize].available_permits()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_classes_are_isolated() {
        let pools = PriorityPools::new(&[1, 2]);

        let held = pools.admit(Priority::HighImportant).await;
        assert_eq!(pools.available(Priority::HighImportant), 0);
        // Exhausting one class leaves the others untouched.
        assert_eq!(pools.available(Priority::High), 2);
        assert_eq!(pools.available(Priority::BestEffort), 2);

        drop(held);
        assert_eq!(pools.available(Priority::HighImportant), 1);
    }

    #[test]
    fn test_wire_mapping_defaults_to_normal() {
        assert_eq!(Priority::from_wire(0), Priority::Normal);
        assert_eq!(
            Priority::from_wire(RequestPriority::HighImportant as i32),
            Priority::HighImportant
        );
        assert_eq!(
            Priority::from_wire(RequestPriority::BestEffort as i32),
            Priority::BestEffort
        );
        assert_eq!(Priority::from_wire(42), Priority::Normal);
    }
}
