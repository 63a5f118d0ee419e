use crate::core::Payload;
use std::collections::{BTreeMap, BTreeSet};

/// Replicated state of one session, stored under the session id.
///
/// `owners` is the system of record for garbage collection. A release is a
/// set removal, so a retried release cannot delete a session that another
/// process still holds. `reference_count` only carries anonymous holds taken
/// through `AdjustOwnerCount`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub owners: BTreeSet<String>,
    pub reference_count: i32,
    pub attributes: BTreeMap<String, Payload>,
}

impl SessionState {
    /// Creates an empty record held by `owner_id`.
    pub fn owned_by(owner_id: &str) -> Self {
        let mut state = Self::default();
        state.add_owner(owner_id);
        state
    }

    /// Registers `owner_id` as a holder. Returns true if it was not one yet.
    pub fn add_owner(&mut self, owner_id: &str) -> bool {
        if self.owners.contains(owner_id) {
            return false;
        }
        self.owners.insert(owner_id.to_string())
    }

    /// Releases `owner_id`. Releasing an absent owner is a no-op.
    pub fn release_owner(&mut self, owner_id: &str) -> bool {
        self.owners.remove(owner_id)
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owners.contains(owner_id)
    }

    /// Owners plus anonymous holds.
    pub fn holder_count(&self) -> i32 {
        (self.owners.len() as i32).saturating_add(self.reference_count.max(0))
    }

    /// True while anyone still holds the record.
    pub fn is_held(&self) -> bool {
        self.holder_count() > 0
    }

    pub fn attribute_names(&self) -> BTreeSet<String> {
        self.attributes.keys().cloned().collect()
    }

    /// Applies one upsert (`Some`) or tombstone (`None`).
    pub fn apply_update(&mut self, name: &str, value: Option<&Payload>) {
        match value {
            Some(payload) => {
                self.attributes.insert(name.to_string(), payload.clone());
            }
            None => {
                self.attributes.remove(name);
            }
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionState{{owners={}, referenceCount={}, attributes={}, keys={:?}}}",
            self.owners.len(),
            self.reference_count,
            self.attributes.len(),
            self.attributes.keys().collect::<Vec<_>>()
        )
    }
}
