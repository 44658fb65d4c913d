// Persisted FlowSpace record: the stable JSON shape entries are stored,
// exported and re-imported in.
//
//   {"name": "web", "dpid": "00:00:00:00:00:00:00:01", "priority": 10,
//    "id": 4, "queues": [1, 2], "force-enqueue": -1,
//    "actions": [{"slice-name": "tenant1", "permission": 7}],
//    "tp_dst": "80", "nw_src": "10.0.0.0/8"}
//
// Metadata keys are reserved; every other key is a match field. A
// `force-enqueue` of -1 (or no key at all) means no forced queue.

use crate::error::{FlowSpaceError, Result};
use crate::flow_entry::{Dpid, EntryId, FlowEntry};
use crate::flow_match::{unique_queues, FlowMatch};
use crate::slice_action::SliceActions;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

pub const KEY_NAME: &str = "name";
pub const KEY_DPID: &str = "dpid";
pub const KEY_PRIORITY: &str = "priority";
pub const KEY_ID: &str = "id";
pub const KEY_QUEUES: &str = "queues";
pub const KEY_FORCE_ENQUEUE: &str = "force-enqueue";
pub const KEY_ACTIONS: &str = "actions";

/// Metadata keys that are never interpreted as match fields.
pub const RESERVED_KEYS: [&str; 7] = [
    KEY_NAME,
    KEY_DPID,
    KEY_PRIORITY,
    KEY_ID,
    KEY_QUEUES,
    KEY_FORCE_ENQUEUE,
    KEY_ACTIONS,
];

/// Forced-queue sentinel for "no override".
pub const NO_FORCED_QUEUE: i64 = -1;

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpaceRecord {
    pub name: String,
    pub dpid: Dpid,
    pub priority: u32,
    pub id: EntryId,
    pub queues: Vec<u32>,
    pub forced_queue: Option<u32>,
    pub actions: SliceActions,
    pub rule_match: FlowMatch,
}

impl FlowSpaceRecord {
    pub fn from_entry(entry: &FlowEntry) -> Self {
        FlowSpaceRecord {
            name: entry.name().to_string(),
            dpid: entry.dpid(),
            priority: entry.priority(),
            id: entry.id(),
            queues: entry.queue_ids().to_vec(),
            forced_queue: entry.forced_queue(),
            actions: entry.slice_actions().clone(),
            rule_match: entry.rule_match().clone(),
        }
    }

    pub fn to_entry(&self) -> Result<FlowEntry> {
        FlowEntry::builder()
            .id(self.id)
            .name(self.name.clone())
            .dpid(self.dpid)
            .priority(self.priority)
            .rule_match(self.rule_match.clone())
            .queue_ids(self.queues.clone())
            .forced_queue(self.forced_queue)
            .slice_actions(self.actions.clone())
            .build()
    }

    /// Parses one record object. `name` and `id` are required; the other
    /// metadata keys default to any datapath, priority 0, no queues, no
    /// forced queue and no grants.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| FlowSpaceError::config("flowspace record must be a JSON object"))?;

        let name = object
            .get(KEY_NAME)
            .and_then(Value::as_str)
            .ok_or_else(|| FlowSpaceError::missing(KEY_NAME))?
            .to_string();
        let id = object
            .get(KEY_ID)
            .ok_or_else(|| FlowSpaceError::missing(KEY_ID))?
            .as_u64()
            .ok_or_else(|| FlowSpaceError::config(format!("entry {}: id must be a non-negative integer", name)))?;

        let dpid = match object.get(KEY_DPID) {
            Some(v) => parse_dpid(v)?,
            None => Dpid::ALL,
        };
        let priority = match object.get(KEY_PRIORITY) {
            Some(v) => parse_priority(v)?,
            None => 0,
        };
        let queues = match object.get(KEY_QUEUES) {
            Some(v) => parse_queues(v)?,
            None => Vec::new(),
        };
        let forced_queue = match object.get(KEY_FORCE_ENQUEUE) {
            Some(v) => parse_forced_queue(v)?,
            None => None,
        };
        let actions = match object.get(KEY_ACTIONS) {
            Some(v) => SliceActions::from_json(v)?,
            None => SliceActions::new(),
        };
        let mut rule_match = match_from_object(object)?;
        rule_match.set_queues(queues.clone());
        rule_match.set_forced_queue(forced_queue);

        Ok(FlowSpaceRecord {
            name,
            dpid,
            priority,
            id,
            queues,
            forced_queue,
            actions,
            rule_match,
        })
    }

    pub fn to_json_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(KEY_NAME.to_string(), Value::from(self.name.clone()));
        object.insert(KEY_DPID.to_string(), Value::from(self.dpid.to_string()));
        object.insert(KEY_PRIORITY.to_string(), Value::from(self.priority));
        object.insert(KEY_ID.to_string(), Value::from(self.id));
        object.insert(KEY_QUEUES.to_string(), Value::from(self.queues.clone()));
        object.insert(
            KEY_FORCE_ENQUEUE.to_string(),
            Value::from(self.forced_queue.map(i64::from).unwrap_or(NO_FORCED_QUEUE)),
        );
        object.insert(
            KEY_ACTIONS.to_string(),
            serde_json::to_value(&self.actions).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        for (key, value) in self.rule_match.to_fields() {
            object.insert(key, value);
        }
        Value::Object(object)
    }
}

impl Serialize for FlowSpaceRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlowSpaceRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FlowSpaceRecord::from_json_value(&value).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// LIST PARSING
// ============================================================================

/// Parses a JSON array of records.
pub fn parse_records(json: &str) -> Result<Vec<FlowSpaceRecord>> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| FlowSpaceError::config(format!("flowspace JSON parse error: {}", e)))?;
    records_from_value(&value)
}

pub fn records_from_value(value: &Value) -> Result<Vec<FlowSpaceRecord>> {
    value
        .as_array()
        .ok_or_else(|| FlowSpaceError::config("flowspace records must be a JSON array"))?
        .iter()
        .map(FlowSpaceRecord::from_json_value)
        .collect()
}

/// Pretty-printed JSON array of records.
pub fn records_to_json(records: &[FlowSpaceRecord]) -> String {
    let list: Vec<Value> = records.iter().map(FlowSpaceRecord::to_json_value).collect();
    serde_json::to_string_pretty(&Value::Array(list)).unwrap_or_else(|_| "[]".to_string())
}

// ============================================================================
// FIELD PARSERS (shared with update specs)
// ============================================================================

pub(crate) fn parse_dpid(value: &Value) -> Result<Dpid> {
    match value {
        Value::String(s) => Dpid::parse(s),
        Value::Number(n) => n
            .as_u64()
            .map(Dpid::new)
            .ok_or_else(|| FlowSpaceError::config(format!("invalid dpid {}", n))),
        other => Err(FlowSpaceError::config(format!("invalid dpid {}", other))),
    }
}

pub(crate) fn parse_priority(value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|p| u32::try_from(p).ok())
        .ok_or_else(|| FlowSpaceError::config(format!("invalid priority {}", value)))
}

pub(crate) fn parse_queues(value: &Value) -> Result<Vec<u32>> {
    let list = value
        .as_array()
        .ok_or_else(|| FlowSpaceError::config("queues must be a list"))?;
    let queues = list
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|q| u32::try_from(q).ok())
                .ok_or_else(|| FlowSpaceError::config(format!("invalid queue id {}", item)))
        })
        .collect::<Result<Vec<u32>>>()?;
    Ok(unique_queues(queues))
}

pub(crate) fn parse_forced_queue(value: &Value) -> Result<Option<u32>> {
    match value.as_i64() {
        Some(q) if q < 0 => Ok(None),
        Some(q) => u32::try_from(q)
            .map(Some)
            .map_err(|_| FlowSpaceError::config(format!("invalid forced queue {}", q))),
        None if value.is_null() => Ok(None),
        None => Err(FlowSpaceError::config(format!("invalid forced queue {}", value))),
    }
}

/// Collects every non-reserved key of `object` into a pattern.
pub(crate) fn match_from_object(object: &Map<String, Value>) -> Result<FlowMatch> {
    FlowMatch::from_fields(object.iter().filter(|(key, _)| !is_reserved_key(key)))
}
