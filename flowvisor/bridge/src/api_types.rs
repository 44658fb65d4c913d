//! # API-Facing Data Contracts
//!
//! List-view projection of exported FlowSpace records, as returned to
//! administrative clients. The projection is a pure function of one exported
//! record: metadata keys are renamed or reshaped and every remaining key is
//! moved under `match`.

use flowspace::record::{
    KEY_ACTIONS, KEY_DPID, KEY_FORCE_ENQUEUE, KEY_ID, KEY_NAME, KEY_PRIORITY, KEY_QUEUES,
    NO_FORCED_QUEUE,
};
use flowspace::FlowSpaceRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One `(slice, permission)` pair in the list view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceActionListing {
    #[serde(rename = "slice-name")]
    pub slice_name: String,
    pub permission: u32,
}

/// List-view form of one FlowSpace entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowSpaceListing {
    pub name: String,
    pub queues: Vec<u32>,
    #[serde(rename = "force-enqueue")]
    pub force_enqueue: i64,
    pub dpid: String,
    pub priority: u32,
    pub id: u64,
    #[serde(rename = "slice-action")]
    pub slice_action: Vec<SliceActionListing>,
    #[serde(rename = "match")]
    pub flow_match: Map<String, Value>,
}

impl FlowSpaceListing {
    pub fn from_record(record: &FlowSpaceRecord) -> Self {
        Self::from_record_value(&record.to_json_value())
    }

    /// Reshapes an exported record object. Missing metadata takes the
    /// record defaults.
    pub fn from_record_value(value: &Value) -> Self {
        let mut fields = value.as_object().cloned().unwrap_or_default();

        let name = fields
            .remove(KEY_NAME)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let queues: Vec<u32> = fields
            .remove(KEY_QUEUES)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let force_enqueue = fields
            .remove(KEY_FORCE_ENQUEUE)
            .and_then(|v| v.as_i64())
            .unwrap_or(NO_FORCED_QUEUE);
        let dpid = fields
            .remove(KEY_DPID)
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_else(|| "any".to_string());
        let priority = fields
            .remove(KEY_PRIORITY)
            .and_then(|v| v.as_u64())
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or(0);
        let id = fields.remove(KEY_ID).and_then(|v| v.as_u64()).unwrap_or(0);
        let slice_action: Vec<SliceActionListing> = fields
            .remove(KEY_ACTIONS)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        FlowSpaceListing {
            name,
            queues,
            force_enqueue,
            dpid,
            priority,
            id,
            slice_action,
            flow_match: fields,
        }
    }
}
