//! Tracking of deliveries currently being handled.
//!
//! A delivery id enters the set when a dispatch slot claims the message and
//! leaves it when the handler returns and the delivery has been settled. The
//! broker can hand out the same delivery id again after a lock expires; the
//! set is what keeps two handlers from running on it at the same time.

use crate::message::DeliveryId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[cfg(test)]
#[path = "in_flight_tests.rs"]
mod tests;

/// Who settles a delivery: the handler's slot or the drain timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Running,
    Settling,
    Revoked,
}

#[derive(Default)]
struct InFlightInner {
    entries: Mutex<HashMap<DeliveryId, Claim>>,
    drained: Notify,
}

impl InFlightInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<DeliveryId, Claim>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Set of delivery ids with a handler running
#[derive(Clone, Default)]
pub struct InFlightSet {
    inner: Arc<InFlightInner>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `delivery_id`.
    ///
    /// Returns `None` when the id is already in flight. The claim is released
    /// when the returned guard is dropped.
    pub fn try_insert(&self, delivery_id: DeliveryId) -> Option<InFlightGuard> {
        let mut entries = self.inner.entries();
        if entries.contains_key(&delivery_id) {
            return None;
        }
        entries.insert(delivery_id.clone(), Claim::Running);

        Some(InFlightGuard {
            set: self.clone(),
            delivery_id,
        })
    }

    pub fn contains(&self, delivery_id: &DeliveryId) -> bool {
        self.inner.entries().contains_key(delivery_id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently in flight, in no particular order
    pub fn snapshot(&self) -> Vec<DeliveryId> {
        self.inner.entries().keys().cloned().collect()
    }

    /// Resolve once the set is empty
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Take over settlement of every entry whose handler has not started
    /// settling, returning their ids.
    ///
    /// Handlers keep running, but [`InFlightGuard::try_settle`] fails for them
    /// so each delivery is settled exactly once.
    pub(crate) fn revoke_all(&self) -> Vec<DeliveryId> {
        let mut entries = self.inner.entries();
        entries
            .iter_mut()
            .filter(|(_, claim)| **claim == Claim::Running)
            .map(|(id, claim)| {
                *claim = Claim::Revoked;
                id.clone()
            })
            .collect()
    }

    fn release(&self, delivery_id: &DeliveryId) {
        let now_empty = {
            let mut entries = self.inner.entries();
            entries.remove(delivery_id);
            entries.is_empty()
        };

        if now_empty {
            self.inner.drained.notify_waiters();
        }
    }
}

/// Claim on one delivery id; releases it on drop
pub struct InFlightGuard {
    set: InFlightSet,
    delivery_id: DeliveryId,
}

impl InFlightGuard {
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery_id
    }

    /// Whether settlement was taken over by [`InFlightSet::revoke_all`]
    pub fn is_revoked(&self) -> bool {
        self.claim() == Claim::Revoked
    }

    /// Claim the right to ack or nack this delivery.
    ///
    /// Returns `false` when the delivery was revoked; after a successful claim
    /// [`InFlightSet::revoke_all`] leaves the entry alone.
    pub fn try_settle(&self) -> bool {
        let mut entries = self.set.inner.entries();
        match entries.get_mut(&self.delivery_id) {
            Some(claim) if *claim == Claim::Running => {
                *claim = Claim::Settling;
                true
            }
            _ => false,
        }
    }

    fn claim(&self) -> Claim {
        self.set
            .inner
            .entries()
            .get(&self.delivery_id)
            .copied()
            .unwrap_or(Claim::Revoked)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.release(&self.delivery_id);
    }
}
