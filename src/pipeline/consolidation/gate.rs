//! Per-(patient, entity type) mutual exclusion.
//!
//! Two batches for the same patient and type would otherwise read the same
//! snapshot and both create the same entity. Batches with different keys run
//! in parallel. Slots are created on demand and dropped once no batch holds
//! or waits for them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use crate::models::enums::EntityType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateKey {
    pub patient_id: String,
    pub entity_type: EntityType,
}

impl GateKey {
    pub fn new(patient_id: &str, entity_type: EntityType) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            entity_type,
        }
    }
}

type Slot = Arc<TokioMutex<()>>;

#[derive(Clone, Default)]
pub struct SerializationGate {
    slots: Arc<Mutex<HashMap<GateKey, Slot>>>,
}

impl SerializationGate {
    pub fn new() -> Self {
        Self::default()
    }

    // The map is only touched in short non-async sections; a poisoned lock
    // still holds a consistent map.
    fn slots(&self) -> MutexGuard<'_, HashMap<GateKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until no other batch holds `key`.
    pub async fn acquire(&self, key: GateKey) -> GatePermit {
        let slot = self.slots().entry(key.clone()).or_default().clone();

        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(
                    entity_type = %key.entity_type,
                    "Batch waiting for in-flight batch on same patient and type"
                );
                slot.clone().lock_owned().await
            }
        };

        GatePermit {
            gate: self.clone(),
            key,
            slot,
            guard: Some(guard),
        }
    }

    /// Run `fut` while holding `key`.
    pub async fn run_exclusive<F, T>(&self, key: GateKey, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(key).await;
        fut.await
    }

    /// Keys currently held or waited on.
    pub fn active_slots(&self) -> usize {
        self.slots().len()
    }
}

/// Held for the duration of one batch.
pub struct GatePermit {
    gate: SerializationGate,
    key: GateKey,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.gate.slots();
        // Only the map and this permit still reference the slot: nobody waits.
        if Arc::strong_count(&self.slot) == 2
            && slots
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.slot))
        {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn overlap(gate: &SerializationGate, keys: Vec<GateKey>) -> usize {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let gate = gate.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    gate.run_exclusive(key, async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn same_key_runs_one_at_a_time() {
        let gate = SerializationGate::new();
        let keys = vec![GateKey::new("p1", EntityType::Problem); 4];
        assert_eq!(overlap(&gate, keys).await, 1);
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let gate = SerializationGate::new();
        let keys = vec![
            GateKey::new("p1", EntityType::Problem),
            GateKey::new("p1", EntityType::Medication),
            GateKey::new("p2", EntityType::Problem),
            GateKey::new("p3", EntityType::Lab),
        ];
        assert_eq!(overlap(&gate, keys).await, 4);
    }

    #[tokio::test]
    async fn idle_slots_are_reclaimed() {
        let gate = SerializationGate::new();
        let keys = vec![
            GateKey::new("p1", EntityType::Problem),
            GateKey::new("p1", EntityType::Problem),
            GateKey::new("p2", EntityType::Imaging),
        ];
        overlap(&gate, keys).await;
        assert_eq!(gate.active_slots(), 0);
    }

    #[tokio::test]
    async fn held_permit_keeps_slot() {
        let gate = SerializationGate::new();
        let permit = gate.acquire(GateKey::new("p1", EntityType::Lab)).await;
        assert_eq!(gate.active_slots(), 1);
        drop(permit);
        assert_eq!(gate.active_slots(), 0);
    }
}
