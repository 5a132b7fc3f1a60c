//! Grace-period tracking for the published dispatch map.
//!
//! The topology has exactly one writer (the control-plane thread) and many
//! readers (vCPU threads) that must never block. Readers announce the epoch
//! they entered before touching the published map and announce quiescence
//! when they leave; the writer publishes a new map, advances the epoch, and
//! waits until every registered reader has either passed a checkpoint in the
//! new epoch or is quiescent before reclaiming. This is deferred reclamation,
//! not reference counting: the read side is two sequentially-consistent
//! stores per access, with no shared-counter contention. Superseded
//! structures are parked on a retire queue with [`EpochDomain::retire`] and
//! dropped by the [`EpochDomain::synchronize`] that proves them unreachable.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Slot value meaning "not inside a read-side critical section".
const QUIESCENT: u64 = 0;

/// State shared between the domain and every reader handle.
struct Shared {
    /// Monotonic epoch counter; starts above [`QUIESCENT`] so the sentinel
    /// is unambiguous.
    global: AtomicU64,
}

struct ReaderSlot {
    /// Epoch the reader pinned, or [`QUIESCENT`].
    epoch: AtomicU64,
    /// Set when the owning handle is dropped; the writer prunes the slot.
    retired: AtomicBool,
}

/// One address space's epoch domain.
pub struct EpochDomain {
    shared: Arc<Shared>,
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    /// Objects awaiting a grace period before destruction.
    retired: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl EpochDomain {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                global: AtomicU64::new(1),
            }),
            readers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Park `garbage` until the next [`synchronize`] proves no reader can
    /// still reach it.
    ///
    /// [`synchronize`]: EpochDomain::synchronize
    pub fn retire(&self, garbage: Box<dyn Any + Send>) {
        self.retired
            .lock()
            .expect("epoch retire queue poisoned")
            .push(garbage);
    }

    /// Register a reader thread. One handle per thread; handles are `Send`
    /// but deliberately not `Sync`.
    pub fn register_reader(&self) -> ReaderHandle {
        let slot = Arc::new(ReaderSlot {
            epoch: AtomicU64::new(QUIESCENT),
            retired: AtomicBool::new(false),
        });
        let mut readers = self.readers.lock().expect("epoch reader list poisoned");
        // Transient handles (IOMMU hops) retire constantly; prune here so
        // the slot list tracks live readers, not registration history.
        readers.retain(|s| !s.retired.load(Ordering::Acquire));
        readers.push(Arc::clone(&slot));
        drop(readers);
        ReaderHandle {
            slot,
            shared: Arc::clone(&self.shared),
            _not_sync: std::marker::PhantomData,
        }
    }

    /// Advance the epoch and block until every registered reader has left
    /// any critical section entered before the advance, then drop the
    /// garbage that was already parked when the advance happened.
    ///
    /// A reader that pins *after* the advance observes the new epoch and
    /// does not hold the writer up, so a steady stream of accesses cannot
    /// starve reclamation.
    pub fn synchronize(&self) {
        // Claim the queue before advancing: only objects retired (hence
        // already unreachable) before the advance are proven safe by this
        // grace period. A concurrent retire waits for the next cycle.
        let mut garbage = std::mem::take(
            &mut *self.retired.lock().expect("epoch retire queue poisoned"),
        );

        let target = self.shared.global.fetch_add(1, Ordering::SeqCst) + 1;

        // Snapshot the slot list, then wait without holding the lock: a
        // reader mid-access may register a fresh handle (IOMMU hops land
        // back in this space), and that registration must not queue behind
        // the wait.
        let snapshot: Vec<Arc<ReaderSlot>> = {
            let mut readers = self.readers.lock().expect("epoch reader list poisoned");
            readers.retain(|slot| !slot.retired.load(Ordering::Acquire));
            readers.clone()
        };

        for slot in snapshot.iter() {
            loop {
                let seen = slot.epoch.load(Ordering::SeqCst);
                if seen == QUIESCENT || seen >= target {
                    break;
                }
                if slot.retired.load(Ordering::Acquire) {
                    break;
                }
                std::thread::yield_now();
            }
        }

        // Grace period over: nothing claimed above is reachable.
        garbage.clear();
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread registration with an [`EpochDomain`].
pub struct ReaderHandle {
    slot: Arc<ReaderSlot>,
    shared: Arc<Shared>,
    /// A slot tracks one thread's announcements; sharing a handle across
    /// threads would interleave them.
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl ReaderHandle {
    /// Enter a read-side critical section.
    ///
    /// While the guard lives, anything loaded from the domain's published
    /// pointer stays allocated. The sequentially-consistent store orders the
    /// announcement before any subsequent pointer load; combined with the
    /// writer's publish-then-advance order, a writer that observes this slot
    /// quiescent knows the reader can only load the *new* pointer.
    #[inline]
    pub fn pin(&self) -> EpochGuard<'_> {
        let e = self.shared.global.load(Ordering::SeqCst);
        self.slot.epoch.store(e, Ordering::SeqCst);
        EpochGuard { slot: &self.slot }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.slot.epoch.store(QUIESCENT, Ordering::SeqCst);
        self.slot.retired.store(true, Ordering::Release);
    }
}

/// Active read-side critical section; unpins on drop.
pub struct EpochGuard<'a> {
    slot: &'a Arc<ReaderSlot>,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.slot.epoch.store(QUIESCENT, Ordering::SeqCst);
    }
}
