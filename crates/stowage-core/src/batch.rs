//! Notification batching
//!
//! Mutations queue notifications here instead of invoking callbacks inline.
//! The store drains the queue once per burst of writes. In
//! [`DeliveryMode::Batched`] a later notification for the same registration
//! and key overwrites the earlier one in place, so each callback sees the last
//! value once; [`DeliveryMode::EveryChange`] keeps every entry.

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::DeliveryMode;

/// Payload of a queued notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// A resolved value (`None`: the key became absent)
    Value(Option<Value>),
    /// The collection snapshot, read from the cache at flush time
    Snapshot(String),
}

/// One queued delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub registration_id: u64,
    /// Key reported to the callback
    pub source_key: String,
    pub payload: Pending,
}

#[derive(Default)]
struct BatchState {
    entries: Vec<Scheduled>,
    /// (registration, key) -> index into `entries`; batched mode only
    positions: HashMap<(u64, String), usize>,
}

/// Queue of notifications waiting for the end of the current burst.
pub struct NotificationBatcher {
    mode: DeliveryMode,
    state: Mutex<BatchState>,
}

impl NotificationBatcher {
    pub fn new(mode: DeliveryMode) -> Self {
        Self { mode, state: Mutex::new(BatchState::default()) }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Queue a delivery.
    pub fn schedule(&self, registration_id: u64, source_key: &str, payload: Pending) {
        let mut state = self.state.lock();
        if self.mode == DeliveryMode::Batched {
            let slot = (registration_id, source_key.to_owned());
            if let Some(&index) = state.positions.get(&slot) {
                state.entries[index].payload = payload;
                return;
            }
            let index = state.entries.len();
            state.positions.insert(slot, index);
        }
        let source_key = source_key.to_owned();
        state.entries.push(Scheduled { registration_id, source_key, payload });
    }

    /// Drain the queue in scheduling order.
    pub fn take(&self) -> Vec<Scheduled> {
        let mut state = self.state.lock();
        state.positions.clear();
        std::mem::take(&mut state.entries)
    }

    /// Drop queued deliveries for a registration that went away.
    pub fn forget_registration(&self, registration_id: u64) {
        let mut state = self.state.lock();
        state.entries.retain(|entry| entry.registration_id != registration_id);
        let reindexed: Vec<((u64, String), usize)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| ((entry.registration_id, entry.source_key.clone()), index))
            .collect();
        state.positions.clear();
        if self.mode == DeliveryMode::Batched {
            state.positions.extend(reindexed);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(v: Value) -> Pending {
        Pending::Value(Some(v))
    }

    #[test]
    fn test_batched_keeps_last_value_in_first_position() {
        let batcher = NotificationBatcher::new(DeliveryMode::Batched);
        batcher.schedule(1, "a", value(json!(1)));
        batcher.schedule(2, "b", value(json!(1)));
        batcher.schedule(1, "a", value(json!(2)));
        batcher.schedule(1, "a", Pending::Value(None));

        let drained = batcher.take();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].registration_id, 1);
        assert_eq!(drained[0].payload, Pending::Value(None));
        assert_eq!(drained[1].source_key, "b");
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_every_change_keeps_all() {
        let batcher = NotificationBatcher::new(DeliveryMode::EveryChange);
        batcher.schedule(1, "a", value(json!(1)));
        batcher.schedule(1, "a", value(json!(2)));
        let payloads: Vec<Pending> =
            batcher.take().into_iter().map(|entry| entry.payload).collect();
        assert_eq!(payloads, vec![value(json!(1)), value(json!(2))]);
    }

    #[test]
    fn test_per_member_keys_are_separate_slots() {
        let batcher = NotificationBatcher::new(DeliveryMode::Batched);
        batcher.schedule(1, "c_1", value(json!(1)));
        batcher.schedule(1, "c_2", value(json!(2)));
        batcher.schedule(3, "c_", Pending::Snapshot("c_".into()));
        batcher.schedule(3, "c_", Pending::Snapshot("c_".into()));
        assert_eq!(batcher.len(), 3);
    }

    #[test]
    fn test_forget_registration() {
        let batcher = NotificationBatcher::new(DeliveryMode::Batched);
        batcher.schedule(1, "a", value(json!(1)));
        batcher.schedule(2, "b", value(json!(1)));
        batcher.forget_registration(1);
        batcher.schedule(2, "b", value(json!(5)));

        let drained = batcher.take();
        assert_eq!(
            drained,
            vec![Scheduled { registration_id: 2, source_key: "b".into(), payload: value(json!(5)) }]
        );
    }
}
