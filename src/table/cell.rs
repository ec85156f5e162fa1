//! Swappable pointer to a table's current generation
//!
//! Readers pin the current generation inside an epoch-protected region; the refresh
//! side replaces it with a single atomic swap and retires the old one through the
//! epoch's drain list.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crate::epoch::{thread_slot, LightEpoch};
use crate::table::generation::Generation;

/// Displaced generation waiting for readers to leave
struct RetiredGeneration(NonNull<Generation>);

// SAFETY: the pointer came from `Box::into_raw` and is owned by this wrapper once
// unlinked; `Generation` itself is `Send`.
unsafe impl Send for RetiredGeneration {}

impl RetiredGeneration {
    fn reclaim(self) {
        // SAFETY: no reader can reach the generation once its epoch is safe.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// Atomically swappable owner of one table's current [`Generation`]
pub struct GenerationCell {
    current: AtomicPtr<Generation>,
    epoch: Arc<LightEpoch>,
    published: AtomicU64,
    retired: AtomicU64,
    freed: Arc<AtomicU64>,
}

impl GenerationCell {
    /// Create an empty cell reclaiming through `epoch`.
    pub fn new(epoch: Arc<LightEpoch>) -> Self {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
            epoch,
            published: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            freed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pin the current generation, or `None` before the first publish.
    pub fn pin(&self) -> Option<GenerationRef<'_>> {
        let thread_id = thread_slot();
        self.epoch.reentrant_protect(thread_id);
        let current = self.current.load(Ordering::SeqCst);
        match NonNull::new(current) {
            Some(generation) => Some(GenerationRef {
                generation,
                epoch: &self.epoch,
                thread_id,
                _not_send: PhantomData,
            }),
            None => {
                self.epoch.reentrant_unprotect(thread_id);
                None
            }
        }
    }

    /// Make `generation` current and retire the one it replaces.
    ///
    /// Returns the sequence number of the retired generation, if any. Must not be
    /// called while the calling thread holds a pin.
    pub fn publish(&self, generation: Generation) -> Option<u64> {
        let fresh = Box::into_raw(Box::new(generation));
        let previous = self.current.swap(fresh, Ordering::SeqCst);
        self.published.fetch_add(1, Ordering::Relaxed);

        let previous = NonNull::new(previous)?;
        // SAFETY: still alive; only the drain action below frees it.
        let sequence = unsafe { previous.as_ref() }.sequence();
        self.retired.fetch_add(1, Ordering::Relaxed);

        let retired = RetiredGeneration(previous);
        let freed = self.freed.clone();
        self.epoch.bump_current_epoch_with_action(move || {
            retired.reclaim();
            freed.fetch_add(1, Ordering::Relaxed);
        });
        Some(sequence)
    }

    /// Whether a generation has been published
    pub fn is_published(&self) -> bool {
        !self.current.load(Ordering::Acquire).is_null()
    }

    /// Generations published into this cell
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Generations displaced by a publish
    pub fn retired_count(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Retired generations whose memory has been released
    pub fn freed_count(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}

impl Drop for GenerationCell {
    fn drop(&mut self) {
        let current = *self.current.get_mut();
        if !current.is_null() {
            // SAFETY: `&mut self` rules out outstanding pins.
            drop(unsafe { Box::from_raw(current) });
        }
    }
}

impl std::fmt::Debug for GenerationCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationCell")
            .field("published", &self.published_count())
            .field("retired", &self.retired_count())
            .field("freed", &self.freed_count())
            .finish()
    }
}

/// A pinned generation
///
/// Keeps the generation alive until dropped. Not `Send`: the pin belongs to the
/// thread that took it, so it cannot be held across an `.await`.
pub struct GenerationRef<'a> {
    generation: NonNull<Generation>,
    epoch: &'a LightEpoch,
    thread_id: usize,
    _not_send: PhantomData<*const ()>,
}

impl Deref for GenerationRef<'_> {
    type Target = Generation;

    fn deref(&self) -> &Generation {
        // SAFETY: the epoch pin keeps the generation from being reclaimed.
        unsafe { self.generation.as_ref() }
    }
}

impl Drop for GenerationRef<'_> {
    fn drop(&mut self) {
        self.epoch.reentrant_unprotect(self.thread_id);
    }
}
