use super::state::SessionState;
use crate::core::{Payload, Result, SessionError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Atomic single-key operations executed by the store against one session
/// record.
///
/// The store runs [`SessionOperation::apply`] with exclusive access to the
/// key, so no other operation interleaves on the same session while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOperation {
    /// Reads the whole record and registers the caller as an owner.
    GetSessionState { owner_id: String },
    /// Reads one attribute and registers the caller as an owner.
    GetAttribute {
        attribute_name: String,
        owner_id: String,
    },
    /// Reads the attribute names and registers the caller as an owner.
    GetAttributeNames { owner_id: String },
    /// Upserts (`Some`) or removes (`None`) each named attribute, creating the
    /// record when it does not exist yet.
    UpdateAttributes {
        owner_id: String,
        updates: BTreeMap<String, Option<Payload>>,
    },
    /// Releases the caller's hold. The record is dropped on `invalidate` or
    /// once nobody holds it anymore.
    DeleteSession { owner_id: String, invalidate: bool },
    /// Adjusts the anonymous hold counter.
    AdjustOwnerCount { increment: bool },
}

/// Discriminant of [`SessionOperation`], used in logs and wire type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    GetSessionState,
    GetAttribute,
    GetAttributeNames,
    UpdateAttributes,
    DeleteSession,
    AdjustOwnerCount,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetSessionState => "get_session_state",
            Self::GetAttribute => "get_attribute",
            Self::GetAttributeNames => "get_attribute_names",
            Self::UpdateAttributes => "update_attributes",
            Self::DeleteSession => "delete_session",
            Self::AdjustOwnerCount => "adjust_owner_count",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value returned to the caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    State(Option<SessionState>),
    Attribute(Option<Payload>),
    Names(Option<BTreeSet<String>>),
    Updated(bool),
    /// `true` when the record was removed by this call.
    Deleted(bool),
    OwnerCount(i32),
}

impl OperationResult {
    pub fn into_state(self) -> Result<Option<SessionState>> {
        match self {
            Self::State(state) => Ok(state),
            other => Err(unexpected("state", &other)),
        }
    }

    pub fn into_attribute(self) -> Result<Option<Payload>> {
        match self {
            Self::Attribute(value) => Ok(value),
            other => Err(unexpected("attribute", &other)),
        }
    }

    pub fn into_names(self) -> Result<Option<BTreeSet<String>>> {
        match self {
            Self::Names(names) => Ok(names),
            other => Err(unexpected("names", &other)),
        }
    }

    pub fn into_updated(self) -> Result<bool> {
        match self {
            Self::Updated(flag) => Ok(flag),
            other => Err(unexpected("updated", &other)),
        }
    }

    pub fn into_deleted(self) -> Result<bool> {
        match self {
            Self::Deleted(flag) => Ok(flag),
            other => Err(unexpected("deleted", &other)),
        }
    }

    pub fn into_owner_count(self) -> Result<i32> {
        match self {
            Self::OwnerCount(count) => Ok(count),
            other => Err(unexpected("owner count", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &OperationResult) -> SessionError {
    SessionError::InvalidRecord(format!(
        "expected {} result, store returned {:?}",
        expected, got
    ))
}

/// Outcome of applying an operation: the record to store back (`None` deletes
/// it) and the caller-visible result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub state: Option<SessionState>,
    pub result: OperationResult,
}

impl SessionOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::GetSessionState { .. } => OperationKind::GetSessionState,
            Self::GetAttribute { .. } => OperationKind::GetAttribute,
            Self::GetAttributeNames { .. } => OperationKind::GetAttributeNames,
            Self::UpdateAttributes { .. } => OperationKind::UpdateAttributes,
            Self::DeleteSession { .. } => OperationKind::DeleteSession,
            Self::AdjustOwnerCount { .. } => OperationKind::AdjustOwnerCount,
        }
    }

    /// Owner stamped into the call, if the operation affects ownership.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Self::GetSessionState { owner_id }
            | Self::GetAttribute { owner_id, .. }
            | Self::GetAttributeNames { owner_id }
            | Self::UpdateAttributes { owner_id, .. }
            | Self::DeleteSession { owner_id, .. } => Some(owner_id.as_str()),
            Self::AdjustOwnerCount { .. } => None,
        }
    }

    /// Runs the operation against the current record.
    pub fn apply(&self, current: Option<SessionState>) -> Applied {
        match self {
            Self::GetSessionState { owner_id } => match current {
                None => Applied {
                    state: None,
                    result: OperationResult::State(None),
                },
                Some(mut state) => {
                    state.add_owner(owner_id);
                    Applied {
                        result: OperationResult::State(Some(state.clone())),
                        state: Some(state),
                    }
                }
            },
            Self::GetAttribute {
                attribute_name,
                owner_id,
            } => match current {
                None => Applied {
                    state: None,
                    result: OperationResult::Attribute(None),
                },
                Some(mut state) => {
                    state.add_owner(owner_id);
                    let value = state.attributes.get(attribute_name).cloned();
                    Applied {
                        state: Some(state),
                        result: OperationResult::Attribute(value),
                    }
                }
            },
            Self::GetAttributeNames { owner_id } => match current {
                None => Applied {
                    state: None,
                    result: OperationResult::Names(None),
                },
                Some(mut state) => {
                    state.add_owner(owner_id);
                    let names = state.attribute_names();
                    Applied {
                        state: Some(state),
                        result: OperationResult::Names(Some(names)),
                    }
                }
            },
            Self::UpdateAttributes { owner_id, updates } => {
                let mut state = current.unwrap_or_default();
                state.add_owner(owner_id);
                for (name, value) in updates {
                    state.apply_update(name, value.as_ref());
                }
                Applied {
                    state: Some(state),
                    result: OperationResult::Updated(true),
                }
            }
            Self::DeleteSession {
                owner_id,
                invalidate,
            } => match current {
                None => Applied {
                    state: None,
                    result: OperationResult::Deleted(false),
                },
                Some(mut state) => {
                    state.release_owner(owner_id);
                    if *invalidate || !state.is_held() {
                        Applied {
                            state: None,
                            result: OperationResult::Deleted(true),
                        }
                    } else {
                        Applied {
                            state: Some(state),
                            result: OperationResult::Deleted(false),
                        }
                    }
                }
            },
            Self::AdjustOwnerCount { increment } => match current {
                None => Applied {
                    state: None,
                    result: OperationResult::OwnerCount(0),
                },
                Some(mut state) => {
                    if *increment {
                        state.reference_count = state.reference_count.saturating_add(1);
                    } else {
                        state.reference_count = (state.reference_count - 1).max(0);
                    }
                    let count = state.holder_count();
                    if !*increment && count == 0 {
                        Applied {
                            state: None,
                            result: OperationResult::OwnerCount(0),
                        }
                    } else {
                        Applied {
                            state: Some(state),
                            result: OperationResult::OwnerCount(count),
                        }
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(owner: &str, entries: &[(&str, Option<&str>)]) -> SessionOperation {
        SessionOperation::UpdateAttributes {
            owner_id: owner.to_string(),
            updates: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(|s| s.as_bytes().to_vec())))
                .collect(),
        }
    }

    fn delete(owner: &str, invalidate: bool) -> SessionOperation {
        SessionOperation::DeleteSession {
            owner_id: owner.to_string(),
            invalidate,
        }
    }

    #[test]
    fn test_reads_on_absent_record_return_absent_and_create_nothing() {
        let ops = [
            SessionOperation::GetSessionState {
                owner_id: "p1".into(),
            },
            SessionOperation::GetAttribute {
                attribute_name: "a".into(),
                owner_id: "p1".into(),
            },
            SessionOperation::GetAttributeNames {
                owner_id: "p1".into(),
            },
            delete("p1", false),
        ];
        for op in ops {
            let applied = op.apply(None);
            assert!(applied.state.is_none(), "{} created a record", op.kind());
        }
    }

    #[test]
    fn test_update_creates_record_and_registers_writer() {
        let applied = update("p1", &[("a", Some("1"))]).apply(None);
        let state = applied.state.unwrap();
        assert!(state.is_owned_by("p1"));
        assert_eq!(state.attributes.get("a"), Some(&b"1".to_vec()));
        assert_eq!(applied.result, OperationResult::Updated(true));
    }

    #[test]
    fn test_tombstone_differs_from_leaving_unchanged() {
        let state = update("p1", &[("a", Some("1")), ("b", Some("2"))])
            .apply(None)
            .state;
        let state = update("p1", &[("a", None)]).apply(state).state.unwrap();
        assert!(!state.attributes.contains_key("a"));
        assert_eq!(state.attributes.get("b"), Some(&b"2".to_vec()));
    }

    #[test]
    fn test_read_registers_owner() {
        let state = update("p1", &[("a", Some("1"))]).apply(None).state;
        let applied = SessionOperation::GetAttribute {
            attribute_name: "a".into(),
            owner_id: "p2".into(),
        }
        .apply(state);
        assert_eq!(applied.result, OperationResult::Attribute(Some(b"1".to_vec())));
        assert!(applied.state.unwrap().is_owned_by("p2"));
    }

    #[test]
    fn test_release_by_stranger_keeps_owned_record() {
        let state = update("p1", &[]).apply(None).state;
        let applied = delete("p2", false).apply(state);
        assert_eq!(applied.result, OperationResult::Deleted(false));
        assert!(applied.state.unwrap().is_owned_by("p1"));
    }

    #[test]
    fn test_last_release_deletes_and_retry_is_noop() {
        let state = update("p1", &[]).apply(None).state;
        let applied = delete("p1", false).apply(state);
        assert_eq!(applied.result, OperationResult::Deleted(true));
        assert!(applied.state.is_none());

        let retried = delete("p1", false).apply(applied.state);
        assert_eq!(retried.result, OperationResult::Deleted(false));
        assert!(retried.state.is_none());
    }

    #[test]
    fn test_invalidate_deletes_regardless_of_owners() {
        let state = update("p1", &[]).apply(None).state;
        let state = SessionOperation::GetSessionState {
            owner_id: "p2".into(),
        }
        .apply(state)
        .state;
        let applied = delete("p1", true).apply(state);
        assert_eq!(applied.result, OperationResult::Deleted(true));
        assert!(applied.state.is_none());
    }

    #[test]
    fn test_anonymous_holds_block_release_deletion() {
        let state = update("p1", &[]).apply(None).state;
        let held = SessionOperation::AdjustOwnerCount { increment: true }.apply(state);
        assert_eq!(held.result, OperationResult::OwnerCount(2));

        let released = delete("p1", false).apply(held.state);
        assert_eq!(released.result, OperationResult::Deleted(false));

        let dropped = SessionOperation::AdjustOwnerCount { increment: false }.apply(released.state);
        assert_eq!(dropped.result, OperationResult::OwnerCount(0));
        assert!(dropped.state.is_none());
    }

    #[test]
    fn test_adjust_on_absent_record_is_noop() {
        let applied = SessionOperation::AdjustOwnerCount { increment: true }.apply(None);
        assert_eq!(applied.result, OperationResult::OwnerCount(0));
        assert!(applied.state.is_none());
    }

    #[test]
    fn test_mismatched_result_is_invalid_record() {
        let err = OperationResult::Updated(true).into_state().unwrap_err();
        assert!(matches!(err, SessionError::InvalidRecord(_)));
    }
}
