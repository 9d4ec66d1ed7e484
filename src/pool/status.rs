//! Shared idle/active table
//!
//! One slot per worker behind a single lock. Waiters are woken on every
//! change instead of polling the table.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    idle: bool,
    /// Set once the worker has reported since the table was reset
    reported: bool,
}

impl Slot {
    const FRESH: Slot = Slot {
        idle: true,
        reported: false,
    };
}

#[derive(Debug)]
pub struct IdleTable {
    slots: watch::Sender<Vec<Slot>>,
}

impl Default for IdleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTable {
    pub fn new() -> Self {
        let (slots, _) = watch::channel(Vec::new());
        Self { slots }
    }

    /// Size the table for `size` workers, all idle and none reported yet
    pub fn reset(&self, size: usize) {
        self.slots.send_replace(vec![Slot::FRESH; size]);
    }

    pub fn mark_active(&self, worker: usize) {
        self.set(worker, false);
    }

    pub fn mark_idle(&self, worker: usize) {
        self.set(worker, true);
    }

    /// Mark every slot idle, e.g. after the workers were killed
    pub fn mark_all_idle(&self) {
        self.slots.send_modify(|slots| {
            for slot in slots.iter_mut() {
                *slot = Slot {
                    idle: true,
                    reported: true,
                };
            }
        });
    }

    fn set(&self, worker: usize, idle: bool) {
        self.slots.send_modify(|slots| {
            if let Some(slot) = slots.get_mut(worker) {
                *slot = Slot {
                    idle,
                    reported: true,
                };
            }
        });
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_idle(&self) -> bool {
        self.slots.borrow().iter().all(|slot| slot.idle)
    }

    pub fn count_idle(&self) -> usize {
        self.slots.borrow().iter().filter(|slot| slot.idle).count()
    }

    /// Wait until every worker has reported in and is idle
    pub async fn wait_until_idle(&self) {
        let mut rx = self.slots.subscribe();
        loop {
            if rx
                .borrow_and_update()
                .iter()
                .all(|slot| slot.idle && slot.reported)
            {
                return;
            }
            // The sender lives in `self`, so the channel cannot close under us.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
