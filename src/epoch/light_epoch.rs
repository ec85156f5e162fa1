//! LightEpoch - epoch-based reclamation for published generations
//!
//! Readers announce the global epoch they entered at in a per-thread table. A writer
//! that unlinks shared data bumps the epoch and registers a drop action tagged with
//! the epoch before the bump. The action runs once every protected thread has moved
//! past that epoch.
//!
//! The announce store, the epoch bump and the table scan are all `SeqCst`. Together
//! with a `SeqCst` pointer swap on the writer side this guarantees that a reader
//! missed by the scan loads the new pointer, never the retired one.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};

/// Epoch value marking a thread as not protected
pub const UNPROTECTED: u64 = 0;

/// Number of deferred actions that can be pending at once
const DRAIN_LIST_SIZE: usize = 64;

/// Full passes over a saturated drain list before reclaiming synchronously
const PUSH_RETRIES: usize = 16;

/// Entry in the epoch table (one per thread slot)
#[repr(C, align(64))]
struct Entry {
    local_current_epoch: AtomicU64,
    reentrant: AtomicU32,
    _padding: [u8; CACHE_LINE_BYTES - 12],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            _padding: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Deferred action waiting for an epoch to become safe
struct EpochAction {
    /// Trigger epoch, or one of the `FREE` / `LOCKED` markers
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Callback>>,
}

impl EpochAction {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Take and run the callback if the slot still holds `trigger_epoch`.
    fn try_run(&self, trigger_epoch: u64) -> bool {
        if self
            .epoch
            .compare_exchange(trigger_epoch, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: the LOCKED marker gives this thread exclusive access to the cell.
        let callback = unsafe { (*self.callback.get()).take() };
        self.epoch.store(Self::FREE, Ordering::Release);
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Claim a free slot for `callback`, handing it back on contention.
    fn try_fill(&self, trigger_epoch: u64, callback: Callback) -> Result<(), Callback> {
        if self
            .epoch
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: exclusive access while LOCKED.
        unsafe {
            *self.callback.get() = Some(callback);
        }
        self.epoch.store(trigger_epoch, Ordering::Release);
        Ok(())
    }

    /// Replace a ready action with `callback`, running the one it displaces.
    fn try_replace(
        &self,
        ready_epoch: u64,
        trigger_epoch: u64,
        callback: Callback,
    ) -> Result<(), Callback> {
        if self
            .epoch
            .compare_exchange(ready_epoch, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: exclusive access while LOCKED.
        let ready = unsafe { (*self.callback.get()).replace(callback) };
        self.epoch.store(trigger_epoch, Ordering::Release);
        if let Some(ready) = ready {
            ready();
        }
        Ok(())
    }
}

// SAFETY: the callback cell is only touched by the thread holding the LOCKED marker.
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Lightweight epoch protection framework
///
/// One instance is shared by every table of a registry. Readers use
/// [`reentrant_protect`](Self::reentrant_protect) / [`reentrant_unprotect`](Self::reentrant_unprotect)
/// with their [`thread_slot`](crate::epoch::thread_slot); the refresh side retires
/// displaced generations with [`bump_current_epoch_with_action`](Self::bump_current_epoch_with_action).
pub struct LightEpoch {
    table: Box<[Entry]>,
    drain_list: Box<[EpochAction]>,
    drain_count: AtomicU32,
    current_epoch: AtomicU64,
    safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new LightEpoch instance
    pub fn new() -> Self {
        Self {
            table: (0..MAX_THREADS).map(|_| Entry::new()).collect(),
            drain_list: (0..DRAIN_LIST_SIZE).map(|_| EpochAction::new()).collect(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Current global epoch
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Last computed safe-to-reclaim epoch
    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> u64 {
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Number of deferred actions not yet run
    #[inline]
    pub fn pending_actions(&self) -> u32 {
        self.drain_count.load(Ordering::Acquire)
    }

    /// Enter the protected region. Nested calls only count depth.
    ///
    /// Returns the epoch the outermost call entered at.
    #[inline]
    pub fn reentrant_protect(&self, thread_id: usize) -> u64 {
        let entry = &self.table[thread_id];
        if entry.reentrant.fetch_add(1, Ordering::AcqRel) == 0 {
            let epoch = self.current_epoch.load(Ordering::SeqCst);
            entry.local_current_epoch.store(epoch, Ordering::SeqCst);
            epoch
        } else {
            entry.local_current_epoch.load(Ordering::Acquire)
        }
    }

    /// Leave one level of protection. The outermost call clears the slot.
    #[inline]
    pub fn reentrant_unprotect(&self, thread_id: usize) {
        let entry = &self.table[thread_id];
        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            entry
                .local_current_epoch
                .store(UNPROTECTED, Ordering::Release);
        }
    }

    /// Check if the thread is currently protected
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Increment the global epoch and run whatever became safe.
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the epoch and defer `callback` until the prior epoch is safe.
    ///
    /// If every drain slot stays busy the caller waits for the prior epoch to
    /// become safe and runs `callback` itself. The caller must not be inside a
    /// protected region.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let next_epoch = self.bump_current_epoch();
        let trigger_epoch = next_epoch - 1;
        let mut callback: Callback = Box::new(callback);

        for _ in 0..PUSH_RETRIES {
            for action in self.drain_list.iter() {
                let slot_epoch = action.epoch.load(Ordering::Acquire);
                if slot_epoch == EpochAction::FREE {
                    match action.try_fill(trigger_epoch, callback) {
                        Ok(()) => {
                            self.drain_count.fetch_add(1, Ordering::AcqRel);
                            return next_epoch;
                        }
                        Err(returned) => callback = returned,
                    }
                } else if slot_epoch != EpochAction::LOCKED && self.is_safe_to_reclaim(slot_epoch)
                {
                    match action.try_replace(slot_epoch, trigger_epoch, callback) {
                        Ok(()) => return next_epoch,
                        Err(returned) => callback = returned,
                    }
                }
            }
            self.compute_new_safe_to_reclaim_epoch(self.current_epoch());
            thread::yield_now();
        }

        tracing::warn!(
            pending = self.pending_actions(),
            "epoch drain list saturated, reclaiming synchronously"
        );
        self.spin_wait_for_safe_to_reclaim(trigger_epoch);
        callback();
        next_epoch
    }

    /// Compute the new safe-to-reclaim epoch by scanning all thread slots
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let oldest_ongoing = self
            .table
            .iter()
            .map(|entry| entry.local_current_epoch.load(Ordering::SeqCst))
            .filter(|&epoch| epoch != UNPROTECTED)
            .fold(current_epoch, u64::min);

        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Spin until `target_epoch` is safe to reclaim
    pub fn spin_wait_for_safe_to_reclaim(&self, target_epoch: u64) {
        loop {
            let safe = self.compute_new_safe_to_reclaim_epoch(self.current_epoch());
            if safe >= target_epoch {
                return;
            }
            thread::yield_now();
        }
    }

    /// Check if an epoch is safe to reclaim
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Run every pending action whose epoch is now safe.
    pub fn drain(&self, current_epoch: u64) {
        let safe = self.compute_new_safe_to_reclaim_epoch(current_epoch);
        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch <= safe
                && trigger_epoch != EpochAction::FREE
                && trigger_epoch != EpochAction::LOCKED
                && action.try_run(trigger_epoch)
                && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LightEpoch {
    fn drop(&mut self) {
        // Nothing can be protected any more; run what is left.
        for action in self.drain_list.iter_mut() {
            if let Some(callback) = action.callback.get_mut().take() {
                callback();
            }
            *action.epoch.get_mut() = EpochAction::FREE;
        }
        *self.drain_count.get_mut() = 0;
    }
}

impl std::fmt::Debug for LightEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightEpoch")
            .field("current_epoch", &self.current_epoch())
            .field("safe_to_reclaim_epoch", &self.safe_to_reclaim_epoch())
            .field("pending_actions", &self.pending_actions())
            .finish()
    }
}

/// RAII guard for epoch protection on the calling thread
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
    thread_id: usize,
    // Slot ids are per thread; the guard must not move.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<'a> EpochGuard<'a> {
    /// Protect the calling thread until the guard is dropped
    pub fn new(epoch: &'a LightEpoch) -> Self {
        let thread_id = crate::epoch::thread_slot();
        epoch.reentrant_protect(thread_id);
        Self {
            epoch,
            thread_id,
            _not_send: std::marker::PhantomData,
        }
    }

    /// Get the thread slot id
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.reentrant_unprotect(self.thread_id);
    }
}
