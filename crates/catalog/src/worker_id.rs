//! Snowflake id generation, seeded by the catalog-issued WorkerId:
//! 41 bits of milliseconds since a fixed epoch, 10 bits of worker, 12
//! bits of per-millisecond sequence.

use std::sync::Mutex;

const EPOCH_MS: i64 = 1480166465631;
const SEQUENCE_BITS: u32 = 12;
const WORKER_BITS: u32 = 10;
const MAX_WORKER_ID: i64 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

pub struct Snowflake {
    worker_id: i64,
    clock_ms: Box<dyn Fn() -> i64 + Send + Sync>,
    state: Mutex<State>,
}

struct State {
    last_ms: i64,
    sequence: i64,
}

impl Snowflake {
    /// `worker_id` is issued by the metadata service and must fit 10 bits.
    pub fn new(worker_id: i64) -> Self {
        Self::with_clock(worker_id, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock precedes the unix epoch")
                .as_millis() as i64
        })
    }

    pub fn with_clock(worker_id: i64, clock_ms: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        assert!(
            (0..=MAX_WORKER_ID).contains(&worker_id),
            "worker id {worker_id} exceeds {WORKER_BITS} bits"
        );
        Self {
            worker_id,
            clock_ms: Box::new(clock_ms),
            state: Mutex::new(State {
                last_ms: -1,
                sequence: 0,
            }),
        }
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        let mut now = (self.clock_ms)();

        // A rewound clock would mint duplicate ids; hold the line instead.
        if now < state.last_ms {
            tracing::warn!(
                last_ms = state.last_ms,
                now_ms = now,
                "clock moved backwards; waiting it out"
            );
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; spin to the next.
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = (self.clock_ms)();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - EPOCH_MS) << (SEQUENCE_BITS + WORKER_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let clock = Arc::new(AtomicI64::new(EPOCH_MS + 1_000));
        let clock_ref = clock.clone();
        let flake = Snowflake::with_clock(5, move || clock_ref.load(Ordering::SeqCst));

        let mut last = 0;
        for i in 0..10_000 {
            if i % 100 == 0 {
                clock.fetch_add(1, Ordering::SeqCst);
            }
            let id = flake.next_id();
            assert!(id > last, "{id} !> {last}");
            last = id;
        }
    }

    #[test]
    fn test_worker_id_is_embedded() {
        let flake = Snowflake::with_clock(37, || EPOCH_MS + 42);
        let id = flake.next_id();
        assert_eq!((id >> SEQUENCE_BITS) & MAX_WORKER_ID, 37);
        assert_eq!(id >> (SEQUENCE_BITS + WORKER_BITS), 42);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_oversized_worker_id_panics() {
        let _ = Snowflake::with_clock(MAX_WORKER_ID + 1, || 0);
    }
}
