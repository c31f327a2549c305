use uuid::Uuid;

use crate::models::enums::EntityStatus;
use crate::models::CanonicalEntity;

/// In-memory view of a patient's entities for the batch in flight. Updated
/// only after the matching store write succeeded, so later changes in the
/// batch see earlier ones.
#[derive(Debug, Clone, Default)]
pub struct WorkingSnapshot {
    entities: Vec<CanonicalEntity>,
}

/// Where following `superseded_by` from a referenced entity ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageLookup {
    /// Not a UUID, or not one of this patient's entities of this type.
    Unknown,
    /// Chain broken, cyclic or deeper than allowed.
    Broken,
    Found { id: Uuid, hops: usize },
}

impl WorkingSnapshot {
    pub fn new(entities: Vec<CanonicalEntity>) -> Self {
        Self { entities }
    }

    pub fn entities(&self) -> &[CanonicalEntity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&CanonicalEntity> {
        self.entities.iter().find(|e| e.id == *id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut CanonicalEntity> {
        self.entities.iter_mut().find(|e| e.id == *id)
    }

    pub fn insert(&mut self, entity: CanonicalEntity) {
        self.entities.push(entity);
    }

    /// Resolve an oracle-supplied id, following lineage to the live end of
    /// the chain.
    pub fn follow_reference(&self, raw_id: &str, max_depth: usize) -> LineageLookup {
        let Ok(id) = Uuid::parse_str(raw_id.trim()) else {
            return LineageLookup::Unknown;
        };
        let Some(mut current) = self.get(&id) else {
            return LineageLookup::Unknown;
        };

        let mut hops = 0;
        while current.status == EntityStatus::Superseded {
            if hops >= max_depth {
                return LineageLookup::Broken;
            }
            let next = match current.superseded_by.and_then(|next| self.get(&next)) {
                Some(next) => next,
                None => return LineageLookup::Broken,
            };
            current = next;
            hops += 1;
        }
        LineageLookup::Found { id: current.id, hops }
    }
}
