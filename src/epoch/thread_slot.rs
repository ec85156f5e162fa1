//! Per-thread slot ids for epoch tables
//!
//! Every thread that enters a protected region needs a small integer id indexing the
//! epoch table. Ids are handed out lazily and returned to a free list when the
//! thread exits, so short-lived threads (test harnesses, blocking pools) do not use
//! up the table.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::constants::MAX_THREADS;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
static FREE_SLOTS: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

struct SlotHolder {
    id: usize,
}

impl SlotHolder {
    fn acquire() -> Self {
        if let Some(id) = FREE_SLOTS.lock().pop() {
            return Self { id };
        }
        let id = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        if id >= MAX_THREADS {
            panic!(
                "more than {MAX_THREADS} threads are using epoch protection at the same time"
            );
        }
        Self { id }
    }
}

impl Drop for SlotHolder {
    fn drop(&mut self) {
        FREE_SLOTS.lock().push(self.id);
    }
}

thread_local! {
    static THREAD_SLOT: SlotHolder = SlotHolder::acquire();
}

/// Slot id of the calling thread
///
/// Stable for the thread's lifetime. After the thread exits the id may be given to
/// another thread.
///
/// # Panics
///
/// Panics if `MAX_THREADS` threads already hold a slot.
#[inline]
pub fn thread_slot() -> usize {
    THREAD_SLOT.with(|slot| slot.id)
}
