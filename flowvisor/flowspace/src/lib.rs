pub mod error;
pub mod flow_match;
pub mod slice_action;
pub mod flow_entry;
pub mod flow_map;
pub mod record;
pub mod update;

pub use error::{ErrorKind, FlowSpaceError, Result};

pub use flow_match::{
    FieldMatch,             // Wildcard / exact / masked constraint
    FlowMatch,              // Full header pattern plus queue bindings
    HeaderFields,           // Concrete header values for a query
    MatchField,             // Closed set of matchable header fields
};

pub use slice_action::{Permission, SliceAction, SliceActions};

pub use flow_entry::{Dpid, EntryId, FlowEntry, FlowEntryBuilder};

pub use flow_map::{
    FlowMap,                // Single-writer working FlowSpace
    FlowMapReader,          // Shared read-only view
    FlowSnapshot,           // Immutable point-in-time view
    Matches,                // Lazy match sequence
};

pub use record::{parse_records, records_from_value, records_to_json, FlowSpaceRecord};

pub use update::{FlowSpaceChange, FlowSpaceUpdate, NewFlowSpaceEntry};
