// Per-slice permissions carried by a FlowSpace entry.
//
// An entry grants each named slice a permission bitset over the traffic it
// matches. The set keeps insertion order (it is serialized in that order) and
// holds at most one permission per slice; a later write for a slice replaces
// the earlier one in place.

use crate::error::{FlowSpaceError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// PERMISSION BITS
// ============================================================================

/// Permission bitset granted to a slice.
///
/// Bits outside the known flags are preserved so records round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(u32);

impl Permission {
    /// Slice may hand this traffic to a sub-slice
    pub const DELEGATE: u32 = 1 << 0;
    /// Slice observes this traffic
    pub const READ: u32 = 1 << 1;
    /// Slice may install rules that act on this traffic
    pub const WRITE: u32 = 1 << 2;

    pub const fn from_bits(bits: u32) -> Self {
        Permission(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn none() -> Self {
        Permission(0)
    }

    /// DELEGATE | READ | WRITE
    pub const fn all() -> Self {
        Permission(Self::DELEGATE | Self::READ | Self::WRITE)
    }

    pub const fn has(&self, flag: u32) -> bool {
        (self.0 & flag) == flag
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn can_read(&self) -> bool {
        self.has(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.has(Self::WRITE)
    }

    pub fn can_delegate(&self) -> bool {
        self.has(Self::DELEGATE)
    }
}

impl From<u32> for Permission {
    fn from(bits: u32) -> Self {
        Permission(bits)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SLICE ACTION
// ============================================================================

/// One (slice, permission) grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceAction {
    #[serde(rename = "slice-name")]
    pub slice: String,
    pub permission: Permission,
}

impl SliceAction {
    pub fn new(slice: impl Into<String>, permission: impl Into<Permission>) -> Self {
        SliceAction {
            slice: slice.into(),
            permission: permission.into(),
        }
    }

    /// Parses a `{"slice-name": .., "permission": ..}` object. Both keys are
    /// required.
    pub fn from_json(value: &Value) -> Result<Self> {
        let slice = value
            .get("slice-name")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowSpaceError::missing("slice-name"))?;
        let permission = value
            .get("permission")
            .ok_or_else(|| FlowSpaceError::missing("permission"))?
            .as_u64()
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| {
                FlowSpaceError::config(format!("permission for slice {} is not a valid integer", slice))
            })?;
        Ok(SliceAction::new(slice, permission))
    }
}

impl fmt::Display for SliceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slice:{}={}", self.slice, self.permission)
    }
}

// ============================================================================
// SLICE ACTION SET
// ============================================================================

/// Ordered slice -> permission mapping for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceActions {
    actions: Vec<SliceAction>,
}

impl SliceActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the set from `(slice, permission)` pairs; a duplicate slice
    /// name keeps the last permission given for it.
    pub fn from_pairs<S, P, I>(pairs: I) -> Self
    where
        S: Into<String>,
        P: Into<Permission>,
        I: IntoIterator<Item = (S, P)>,
    {
        let mut set = SliceActions::new();
        for (slice, permission) in pairs {
            set.insert(slice, permission);
        }
        set
    }

    /// Builds the set from possibly incomplete pairs, failing with
    /// `MissingField` if either component of any pair is absent.
    pub fn try_from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Option<String>, Option<u32>)>,
    {
        let mut set = SliceActions::new();
        for (slice, permission) in pairs {
            let slice = slice.ok_or_else(|| FlowSpaceError::missing("slice-name"))?;
            let permission = permission.ok_or_else(|| FlowSpaceError::missing("permission"))?;
            set.insert(slice, permission);
        }
        Ok(set)
    }

    /// Parses a JSON list of slice action objects.
    pub fn from_json(value: &Value) -> Result<Self> {
        let list = value
            .as_array()
            .ok_or_else(|| FlowSpaceError::config("slice actions must be a list"))?;
        let mut set = SliceActions::new();
        for item in list {
            let action = SliceAction::from_json(item)?;
            set.insert(action.slice, action.permission);
        }
        Ok(set)
    }

    /// Grants `permission` to `slice`, replacing any earlier grant in place.
    pub fn insert(&mut self, slice: impl Into<String>, permission: impl Into<Permission>) {
        let slice = slice.into();
        let permission = permission.into();
        match self.actions.iter_mut().find(|a| a.slice == slice) {
            Some(existing) => existing.permission = permission,
            None => self.actions.push(SliceAction { slice, permission }),
        }
    }

    pub fn remove(&mut self, slice: &str) -> Option<Permission> {
        let pos = self.actions.iter().position(|a| a.slice == slice)?;
        Some(self.actions.remove(pos).permission)
    }

    /// Permission granted to `slice`, if any.
    pub fn permission(&self, slice: &str) -> Option<Permission> {
        self.actions
            .iter()
            .find(|a| a.slice == slice)
            .map(|a| a.permission)
    }

    pub fn contains(&self, slice: &str) -> bool {
        self.permission(slice).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SliceAction> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<'a> IntoIterator for &'a SliceActions {
    type Item = &'a SliceAction;
    type IntoIter = std::slice::Iter<'a, SliceAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_duplicate_slice_keeps_last_permission_at_first_position() {
        let set = SliceActions::from_pairs([("alice", 2u32), ("bob", 4), ("alice", 7)]);
        let names: Vec<&str> = set.iter().map(|a| a.slice.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(set.permission("alice"), Some(Permission::all()));
    }

    #[test]
    fn test_incomplete_pairs_are_missing_fields() {
        let err = SliceActions::try_from_pairs([(Some("alice".to_string()), None)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingField);
        let err = SliceActions::try_from_pairs([(None, Some(4))]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingField);
    }

    #[test]
    fn test_parses_json_actions() {
        let set = SliceActions::from_json(&json!([
            {"slice-name": "tenant1", "permission": 7},
            {"slice-name": "tenant2", "permission": 2}
        ]))
        .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.permission("tenant2").unwrap().can_read());
        assert!(!set.permission("tenant2").unwrap().can_write());

        let err = SliceActions::from_json(&json!([{"slice-name": "tenant1"}])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingField);
    }

    #[test]
    fn test_serializes_in_insertion_order() {
        let set = SliceActions::from_pairs([("b", 1u32), ("a", 2)]);
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!([
                {"slice-name": "b", "permission": 1},
                {"slice-name": "a", "permission": 2}
            ])
        );
    }
}
