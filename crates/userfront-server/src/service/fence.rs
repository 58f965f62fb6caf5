//! Ordering between read write-backs and writes of the same user.
//!
//! A read takes a [`Snapshot`] of the write epoch before it goes to storage.
//! Writers stamp the user's id with a fresh epoch after storage accepted the
//! write and before they touch the cache. A write-back whose snapshot is
//! older than the stamp carries a value that may predate the write and must
//! not stay in the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Stamps kept before the table is pruned.
const PRUNE_ABOVE: usize = 1024;

#[derive(Debug, Default)]
pub(crate) struct WriteFence {
    epoch: AtomicU64,
    stamps: DashMap<i64, u64>,
    /// Epochs of snapshots still held, with their holder counts.
    live: Mutex<BTreeMap<u64, usize>>,
}

/// Write epoch observed by a read. Held until the read's write-back ends.
#[derive(Debug)]
pub(crate) struct Snapshot {
    epoch: u64,
    fence: Arc<WriteFence>,
}

impl WriteFence {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn snapshot(self: &Arc<Self>) -> Snapshot {
        let mut live = self.live.lock();
        let epoch = self.epoch.load(Ordering::SeqCst);
        *live.entry(epoch).or_default() += 1;
        Snapshot {
            epoch,
            fence: Arc::clone(self),
        }
    }

    /// Marks `id` as written. Call after the storage write succeeded.
    pub(crate) fn stamp(&self, id: i64) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.stamps.insert(id, epoch);
        if self.stamps.len() > PRUNE_ABOVE {
            self.prune();
        }
    }

    /// Drops stamps no held snapshot can be older than.
    fn prune(&self) {
        let live = self.live.lock();
        let floor = live
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.epoch.load(Ordering::SeqCst));
        self.stamps.retain(|_, stamp| *stamp > floor);
    }

    #[cfg(test)]
    fn stamped(&self) -> usize {
        self.stamps.len()
    }
}

impl Snapshot {
    /// True when `id` was written after this snapshot was taken.
    pub(crate) fn is_stale(&self, id: i64) -> bool {
        self.fence
            .stamps
            .get(&id)
            .is_some_and(|stamp| *stamp > self.epoch)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut live = self.fence.live.lock();
        if let Some(count) = live.get_mut(&self.epoch) {
            *count -= 1;
            if *count == 0 {
                live.remove(&self.epoch);
            }
        }
    }
}
