// FlowSpace entries: one rule of the FlowSpace.
//
// An entry has an immutable identity (id, name) and mutable attributes
// (datapath, priority, pattern, queues, slice grants). Entries published in a
// flow map are shared behind Arc and never mutated in place; an update clones
// the entry, edits the clone and replaces the whole thing.

use crate::error::{FlowSpaceError, Result};
use crate::flow_match::{unique_queues, FlowMatch, HeaderFields};
use crate::slice_action::{Permission, SliceActions};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ============================================================================
// DATAPATH IDENTIFIER
// ============================================================================

/// Datapath (switch) identifier.
///
/// `Dpid::ALL` is the wildcard: an entry bound to it applies on every
/// datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dpid(u64);

impl Dpid {
    /// Wildcard datapath
    pub const ALL: Dpid = Dpid(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        Dpid(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Dpid::ALL
    }

    /// True when an entry bound to `self` applies on datapath `dpid`.
    pub fn covers(&self, dpid: Dpid) -> bool {
        self.is_wildcard() || *self == dpid
    }

    /// True when two entry datapaths can apply to a common datapath.
    pub fn intersects(&self, other: Dpid) -> bool {
        self.is_wildcard() || other.is_wildcard() || *self == other
    }

    /// Parses `any`/`all`/`all_dpids`/`*`, colon-separated hex
    /// (`00:00:00:00:00:00:00:01`), `0x` hex or decimal.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let lower = text.to_ascii_lowercase();
        if matches!(lower.as_str(), "*" | "any" | "all" | "all_dpids") {
            return Ok(Dpid::ALL);
        }

        let parsed = if text.contains(':') {
            let octets: Vec<&str> = text.split(':').collect();
            if octets.len() > 8 {
                None
            } else {
                octets.iter().try_fold(0u64, |acc, octet| {
                    if octet.is_empty() || octet.len() > 2 {
                        return None;
                    }
                    u8::from_str_radix(octet, 16)
                        .ok()
                        .map(|b| (acc << 8) | u64::from(b))
                })
            }
        } else if let Some(hex) = lower.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else {
            text.parse::<u64>().ok()
        };

        parsed
            .map(Dpid)
            .ok_or_else(|| FlowSpaceError::config(format!("invalid dpid '{}'", text)))
    }
}

impl From<u64> for Dpid {
    fn from(raw: u64) -> Self {
        Dpid(raw)
    }
}

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            return write!(f, "any");
        }
        let octets: Vec<String> = self
            .0
            .to_be_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        write!(f, "{}", octets.join(":"))
    }
}

impl Serialize for Dpid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dpid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Dpid(n)),
            Raw::Text(s) => Dpid::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

// ============================================================================
// FLOW ENTRY
// ============================================================================

/// Entry id: unique, assigned at creation, never reused.
pub type EntryId = u64;

/// One FlowSpace rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    id: EntryId,
    name: String,
    dpid: Dpid,
    priority: u32,
    rule_match: FlowMatch,
    queue_ids: Vec<u32>,
    forced_queue: Option<u32>,
    slice_actions: SliceActions,
}

impl FlowEntry {
    /// Starts building an entry.
    pub fn builder() -> FlowEntryBuilder {
        FlowEntryBuilder::default()
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dpid(&self) -> Dpid {
        self.dpid
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn rule_match(&self) -> &FlowMatch {
        &self.rule_match
    }

    pub fn queue_ids(&self) -> &[u32] {
        &self.queue_ids
    }

    pub fn forced_queue(&self) -> Option<u32> {
        self.forced_queue
    }

    pub fn slice_actions(&self) -> &SliceActions {
        &self.slice_actions
    }

    /// Permission this entry grants `slice`, if it names it.
    pub fn permission_for(&self, slice: &str) -> Option<Permission> {
        self.slice_actions.permission(slice)
    }

    pub fn set_dpid(&mut self, dpid: Dpid) {
        self.dpid = dpid;
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Replaces the pattern, carrying the entry's current queue bindings into
    /// the new pattern.
    pub fn set_match(&mut self, mut rule_match: FlowMatch) {
        rule_match.set_queues(self.queue_ids.clone());
        rule_match.set_forced_queue(self.forced_queue);
        self.rule_match = rule_match;
    }

    /// Duplicate ids are dropped, keeping first occurrences.
    pub fn set_queue_ids(&mut self, queue_ids: Vec<u32>) {
        self.rule_match.set_queues(queue_ids);
        self.queue_ids = self.rule_match.queue_ids().to_vec();
    }

    pub fn set_forced_queue(&mut self, forced_queue: Option<u32>) {
        self.rule_match.set_forced_queue(forced_queue);
        self.forced_queue = forced_queue;
    }

    pub fn set_slice_actions(&mut self, slice_actions: SliceActions) {
        self.slice_actions = slice_actions;
    }

    /// Replaces the slice grants from possibly incomplete pairs. Fails with
    /// `MissingField`, leaving the entry untouched, if any pair lacks a
    /// component.
    pub fn set_slice_actions_from_pairs<I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (Option<String>, Option<u32>)>,
    {
        self.slice_actions = SliceActions::try_from_pairs(pairs)?;
        Ok(())
    }

    /// Does this entry claim traffic with `header` on datapath `dpid`?
    pub fn matches(&self, dpid: Dpid, header: &HeaderFields) -> bool {
        self.dpid.covers(dpid) && self.rule_match.matches(header)
    }

    /// Could this entry and the (dpid, pattern) pair claim common traffic?
    pub fn intersects(&self, dpid: Dpid, pattern: &FlowMatch) -> bool {
        self.dpid.intersects(dpid) && self.rule_match.overlaps(pattern)
    }

    /// Total classification order: priority descending, then id ascending.
    pub fn precedes(&self, other: &FlowEntry) -> bool {
        self.order_key() < other.order_key()
    }

    pub(crate) fn order_key(&self) -> (std::cmp::Reverse<u32>, EntryId) {
        (std::cmp::Reverse(self.priority), self.id)
    }

    /// Copy of this entry under a new id. Used when a new entry is created
    /// from an id-less description.
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }
}

impl fmt::Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<String> = self.slice_actions.iter().map(|a| a.to_string()).collect();
        write!(
            f,
            "FlowEntry[id={},name={},dpid={},prio={},match={},actions=[{}]]",
            self.id,
            self.name,
            self.dpid,
            self.priority,
            self.rule_match,
            actions.join(",")
        )
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`FlowEntry`]. Only the name is required; everything else
/// defaults to "any datapath, priority 0, match everything, no grants".
#[derive(Debug, Clone, Default)]
pub struct FlowEntryBuilder {
    id: EntryId,
    name: Option<String>,
    dpid: Option<Dpid>,
    priority: u32,
    rule_match: FlowMatch,
    queue_ids: Vec<u32>,
    forced_queue: Option<u32>,
    slice_actions: SliceActions,
}

impl FlowEntryBuilder {
    pub fn id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn dpid(mut self, dpid: impl Into<Dpid>) -> Self {
        self.dpid = Some(dpid.into());
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn rule_match(mut self, rule_match: FlowMatch) -> Self {
        self.rule_match = rule_match;
        self
    }

    pub fn queue_ids(mut self, queue_ids: Vec<u32>) -> Self {
        self.queue_ids = queue_ids;
        self
    }

    pub fn forced_queue(mut self, forced_queue: Option<u32>) -> Self {
        self.forced_queue = forced_queue;
        self
    }

    pub fn slice_actions(mut self, slice_actions: SliceActions) -> Self {
        self.slice_actions = slice_actions;
        self
    }

    /// Grants one slice a permission, replacing an earlier grant to it.
    pub fn slice_action(mut self, slice: impl Into<String>, permission: impl Into<Permission>) -> Self {
        self.slice_actions.insert(slice, permission);
        self
    }

    /// Builds the entry; fails with `MissingField` when no name was given.
    pub fn build(self) -> Result<FlowEntry> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| FlowSpaceError::missing("name"))?;

        let queue_ids = unique_queues(self.queue_ids);
        let mut rule_match = self.rule_match;
        rule_match.set_queues(queue_ids.clone());
        rule_match.set_forced_queue(self.forced_queue);

        Ok(FlowEntry {
            id: self.id,
            name,
            dpid: self.dpid.unwrap_or(Dpid::ALL),
            priority: self.priority,
            rule_match,
            queue_ids,
            forced_queue: self.forced_queue,
            slice_actions: self.slice_actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_match::{FieldMatch, MatchField};
    use crate::ErrorKind;

    #[test]
    fn test_dpid_text_forms() {
        assert_eq!(Dpid::parse("00:00:00:00:00:00:00:01").unwrap(), Dpid::new(1));
        assert_eq!(Dpid::parse("0x1f").unwrap(), Dpid::new(31));
        assert_eq!(Dpid::parse("42").unwrap(), Dpid::new(42));
        assert_eq!(Dpid::parse("all_dpids").unwrap(), Dpid::ALL);
        assert_eq!(Dpid::new(1).to_string(), "00:00:00:00:00:00:00:01");
        assert_eq!(Dpid::ALL.to_string(), "any");
        assert_eq!(Dpid::parse("zz").unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn test_dpid_serde_accepts_numbers_and_strings() {
        let from_num: Dpid = serde_json::from_str("7").unwrap();
        let from_str: Dpid = serde_json::from_str("\"00:00:00:00:00:00:00:07\"").unwrap();
        assert_eq!(from_num, from_str);
        assert_eq!(serde_json::to_string(&Dpid::ALL).unwrap(), "\"any\"");
    }

    #[test]
    fn test_build_requires_name() {
        let err = FlowEntry::builder().priority(3).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingField);
    }

    #[test]
    fn test_replacing_match_keeps_queue_bindings() {
        let mut entry = FlowEntry::builder()
            .name("video")
            .queue_ids(vec![1, 2])
            .forced_queue(Some(2))
            .build()
            .unwrap();

        let replacement = FlowMatch::any()
            .with(MatchField::TpDst, FieldMatch::Exact(554))
            .unwrap();
        entry.set_match(replacement);

        assert_eq!(entry.rule_match().queue_ids(), &[1, 2]);
        assert_eq!(entry.rule_match().forced_queue(), Some(2));
        assert_eq!(entry.rule_match().get(MatchField::TpDst), FieldMatch::Exact(554));
    }

    #[test]
    fn test_queue_ids_are_an_ordered_set() {
        let mut entry = FlowEntry::builder().name("q").queue_ids(vec![3, 3, 1]).build().unwrap();
        assert_eq!(entry.queue_ids(), &[3, 1]);
        assert_eq!(entry.rule_match().queue_ids(), &[3, 1]);

        entry.set_queue_ids(vec![5, 2, 5, 2, 7]);
        assert_eq!(entry.queue_ids(), &[5, 2, 7]);
        assert_eq!(entry.rule_match().queue_ids(), &[5, 2, 7]);
    }

    #[test]
    fn test_failed_slice_update_leaves_entry_untouched() {
        let mut entry = FlowEntry::builder()
            .name("a")
            .slice_action("tenant1", 7u32)
            .build()
            .unwrap();
        let err = entry
            .set_slice_actions_from_pairs([(Some("tenant2".to_string()), None)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert_eq!(entry.permission_for("tenant1"), Some(Permission::all()));
    }

    #[test]
    fn test_ordering_is_priority_then_id() {
        let high = FlowEntry::builder().id(9).name("h").priority(10).build().unwrap();
        let low_old = FlowEntry::builder().id(1).name("l1").priority(5).build().unwrap();
        let low_new = FlowEntry::builder().id(2).name("l2").priority(5).build().unwrap();
        assert!(high.precedes(&low_old));
        assert!(low_old.precedes(&low_new));
        assert!(!low_new.precedes(&low_old));
    }
}
