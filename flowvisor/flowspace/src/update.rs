// Change descriptions for the FlowSpace.
//
// A change names its target by entry name. Everything else is optional: an
// unset attribute leaves the existing entry's value alone. Specs are pure
// data; resolving names to ids and applying changes in order is the mutation
// controller's job.
//
// JSON form (one object per change):
//   {"name": "web", "priority": 5, "dpid": "any",
//    "match": {"tp_dst": "80"},
//    "slice-action": [{"slice-name": "tenant1", "permission": 7}],
//    "queues": [1, 2], "force-enqueue": 2}

use crate::error::{FlowSpaceError, Result};
use crate::flow_entry::{Dpid, EntryId, FlowEntry};
use crate::flow_match::FlowMatch;
use crate::record::{parse_dpid, parse_forced_queue, parse_priority, parse_queues};
use crate::slice_action::{Permission, SliceActions};
use serde_json::{Map, Value};
use std::fmt;

pub const KEY_MATCH: &str = "match";
pub const KEY_SLICE_ACTION: &str = "slice-action";

// ============================================================================
// Update
// ============================================================================

/// Patch for one existing entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowSpaceUpdate {
    pub name: String,
    pub dpid: Option<Dpid>,
    pub priority: Option<u32>,
    pub rule_match: Option<FlowMatch>,
    pub slice_actions: Option<SliceActions>,
    pub queue_ids: Option<Vec<u32>>,
    /// `Some(None)` clears the forced queue
    pub forced_queue: Option<Option<u32>>,
}

impl FlowSpaceUpdate {
    pub fn new(name: impl Into<String>) -> Self {
        FlowSpaceUpdate {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dpid(mut self, dpid: impl Into<Dpid>) -> Self {
        self.dpid = Some(dpid.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_match(mut self, rule_match: FlowMatch) -> Self {
        self.rule_match = Some(rule_match);
        self
    }

    pub fn with_slice_actions(mut self, slice_actions: SliceActions) -> Self {
        self.slice_actions = Some(slice_actions);
        self
    }

    pub fn with_slice_action(mut self, slice: impl Into<String>, permission: impl Into<Permission>) -> Self {
        self.slice_actions
            .get_or_insert_with(SliceActions::new)
            .insert(slice, permission);
        self
    }

    pub fn with_queues(mut self, queue_ids: Vec<u32>) -> Self {
        self.queue_ids = Some(queue_ids);
        self
    }

    pub fn with_forced_queue(mut self, forced_queue: Option<u32>) -> Self {
        self.forced_queue = Some(forced_queue);
        self
    }

    /// Parses one change object.
    ///
    /// Fails with `MissingField` when `name` is absent or a slice action
    /// lacks `slice-name`/`permission`, with `UnrecognizedField` on an unknown
    /// match key, and with `ConfigError` on malformed values.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| FlowSpaceError::config("flowspace change must be a JSON object"))?;
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| FlowSpaceError::missing("name"))?;

        let mut update = FlowSpaceUpdate::new(name);
        if let Some(v) = object.get("dpid") {
            update.dpid = Some(parse_dpid(v)?);
        }
        if let Some(v) = object.get("priority") {
            update.priority = Some(parse_priority(v)?);
        }
        if let Some(v) = object.get(KEY_MATCH) {
            update.rule_match = Some(parse_match(v)?);
        }
        if let Some(v) = object.get(KEY_SLICE_ACTION).or_else(|| object.get("actions")) {
            update.slice_actions = Some(SliceActions::from_json(v)?);
        }
        if let Some(v) = object.get("queues") {
            update.queue_ids = Some(parse_queues(v)?);
        }
        if let Some(v) = object.get("force-enqueue") {
            update.forced_queue = Some(parse_forced_queue(v)?);
        }
        Ok(update)
    }

    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.dpid.is_none()
            && self.priority.is_none()
            && self.rule_match.is_none()
            && self.slice_actions.is_none()
            && self.queue_ids.is_none()
            && self.forced_queue.is_none()
    }

    /// Returns `current` with this patch applied.
    ///
    /// A replacement pattern first inherits the entry's current queues; an
    /// explicit queue or forced-queue value in the same patch then wins.
    pub fn apply(&self, current: &FlowEntry) -> FlowEntry {
        let mut next = current.clone();
        if let Some(dpid) = self.dpid {
            next.set_dpid(dpid);
        }
        if let Some(priority) = self.priority {
            next.set_priority(priority);
        }
        if let Some(rule_match) = &self.rule_match {
            next.set_match(rule_match.clone());
        }
        if let Some(queue_ids) = &self.queue_ids {
            next.set_queue_ids(queue_ids.clone());
        }
        if let Some(forced_queue) = self.forced_queue {
            next.set_forced_queue(forced_queue);
        }
        if let Some(slice_actions) = &self.slice_actions {
            next.set_slice_actions(slice_actions.clone());
        }
        next
    }
}

fn parse_match(value: &Value) -> Result<FlowMatch> {
    match value {
        Value::Object(fields) => FlowMatch::from_fields(fields.iter()),
        Value::Null => Ok(FlowMatch::any()),
        Value::String(s) if s.trim().is_empty() || s.eq_ignore_ascii_case("any") => Ok(FlowMatch::any()),
        Value::String(s) => parse_match_text(s),
        other => Err(FlowSpaceError::config(format!("match must be an object, got {}", other))),
    }
}

/// `"in_port=1,tp_dst=80"` style patterns.
fn parse_match_text(text: &str) -> Result<FlowMatch> {
    let mut fields = Map::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| FlowSpaceError::config(format!("malformed match term '{}'", part)))?;
        fields.insert(key.trim().to_string(), Value::from(value.trim()));
    }
    FlowMatch::from_fields(fields.iter())
}

// ============================================================================
// New entry
// ============================================================================

/// Description of an entry to create. The id is assigned when the change
/// is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFlowSpaceEntry {
    template: FlowSpaceUpdate,
}

impl NewFlowSpaceEntry {
    pub fn new(name: impl Into<String>) -> Self {
        NewFlowSpaceEntry {
            template: FlowSpaceUpdate::new(name),
        }
    }

    /// Wraps a patch; its unset attributes take entry defaults.
    pub fn from_update(template: FlowSpaceUpdate) -> Self {
        NewFlowSpaceEntry { template }
    }

    pub fn from_json_value(value: &Value) -> Result<Self> {
        FlowSpaceUpdate::from_json_value(value).map(Self::from_update)
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn with_dpid(mut self, dpid: impl Into<Dpid>) -> Self {
        self.template = self.template.with_dpid(dpid);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.template = self.template.with_priority(priority);
        self
    }

    pub fn with_match(mut self, rule_match: FlowMatch) -> Self {
        self.template = self.template.with_match(rule_match);
        self
    }

    pub fn with_slice_action(mut self, slice: impl Into<String>, permission: impl Into<Permission>) -> Self {
        self.template = self.template.with_slice_action(slice, permission);
        self
    }

    pub fn with_queues(mut self, queue_ids: Vec<u32>) -> Self {
        self.template = self.template.with_queues(queue_ids);
        self
    }

    pub fn with_forced_queue(mut self, forced_queue: Option<u32>) -> Self {
        self.template = self.template.with_forced_queue(forced_queue);
        self
    }

    /// Materializes the entry under `id`.
    pub fn build(&self, id: EntryId) -> Result<FlowEntry> {
        let blank = FlowEntry::builder().id(id).name(self.template.name.clone()).build()?;
        Ok(self.template.apply(&blank))
    }
}

// ============================================================================
// Change
// ============================================================================

/// One element of a mutation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSpaceChange {
    /// Patch an existing entry
    Update(FlowSpaceUpdate),
    /// Create a new entry
    Add(NewFlowSpaceEntry),
    /// Delete an entry
    Remove { name: String },
}

impl FlowSpaceChange {
    pub fn remove(name: impl Into<String>) -> Self {
        FlowSpaceChange::Remove { name: name.into() }
    }

    /// Name of the target entry.
    pub fn name(&self) -> &str {
        match self {
            FlowSpaceChange::Update(update) => &update.name,
            FlowSpaceChange::Add(entry) => entry.name(),
            FlowSpaceChange::Remove { name } => name,
        }
    }

    /// Parses `{"op": "update" | "add" | "remove", ...}`; `op` defaults to
    /// `update`.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let op = value.get("op").and_then(Value::as_str).unwrap_or("update");
        match op {
            "update" | "change" => FlowSpaceUpdate::from_json_value(value).map(FlowSpaceChange::Update),
            "add" => NewFlowSpaceEntry::from_json_value(value).map(FlowSpaceChange::Add),
            "remove" => {
                let name = value
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FlowSpaceError::missing("name"))?;
                Ok(FlowSpaceChange::remove(name))
            }
            other => Err(FlowSpaceError::config(format!("unknown flowspace operation '{}'", other))),
        }
    }
}

impl From<FlowSpaceUpdate> for FlowSpaceChange {
    fn from(update: FlowSpaceUpdate) -> Self {
        FlowSpaceChange::Update(update)
    }
}

impl From<NewFlowSpaceEntry> for FlowSpaceChange {
    fn from(entry: NewFlowSpaceEntry) -> Self {
        FlowSpaceChange::Add(entry)
    }
}

impl fmt::Display for FlowSpaceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowSpaceChange::Update(u) => write!(f, "update {}", u.name),
            FlowSpaceChange::Add(e) => write!(f, "add {}", e.name()),
            FlowSpaceChange::Remove { name } => write!(f, "remove {}", name),
        }
    }
}
