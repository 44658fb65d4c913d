// Header-field patterns for FlowSpace entries.
//
// A FlowMatch constrains a closed set of packet header fields (the OpenFlow
// 1.0 twelve-tuple). Every field is either wildcarded, pinned to an exact
// value, or constrained by value+mask. Values are held as u64 under the bit
// width of their field.
//
// Two operations drive the engine:
// 1. matches(): does a concrete header satisfy the pattern?
// 2. overlaps(): can any header satisfy both patterns at once?

use crate::error::{FlowSpaceError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

// ============================================================================
// MATCH FIELDS
// ============================================================================

/// The fixed set of header fields a FlowSpace pattern may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchField {
    /// Switch ingress port
    InPort,
    /// Ethernet source address
    DlSrc,
    /// Ethernet destination address
    DlDst,
    /// 802.1Q VLAN id
    DlVlan,
    /// 802.1Q priority code point
    DlVlanPcp,
    /// Ethernet frame type
    DlType,
    /// IP type of service
    NwTos,
    /// IP protocol number
    NwProto,
    /// IPv4 source address
    NwSrc,
    /// IPv4 destination address
    NwDst,
    /// Transport source port
    TpSrc,
    /// Transport destination port
    TpDst,
}

/// How values of a field are written in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueFormat {
    Integer,
    Mac,
    Ipv4,
}

impl MatchField {
    /// Every field, in record/display order.
    pub const ALL: [MatchField; 12] = [
        MatchField::InPort,
        MatchField::DlSrc,
        MatchField::DlDst,
        MatchField::DlVlan,
        MatchField::DlVlanPcp,
        MatchField::DlType,
        MatchField::NwTos,
        MatchField::NwProto,
        MatchField::NwSrc,
        MatchField::NwDst,
        MatchField::TpSrc,
        MatchField::TpDst,
    ];

    /// Returns the record key for this field.
    pub fn key(&self) -> &'static str {
        match self {
            MatchField::InPort => "in_port",
            MatchField::DlSrc => "dl_src",
            MatchField::DlDst => "dl_dst",
            MatchField::DlVlan => "dl_vlan",
            MatchField::DlVlanPcp => "dl_vpcp",
            MatchField::DlType => "dl_type",
            MatchField::NwTos => "nw_tos",
            MatchField::NwProto => "nw_proto",
            MatchField::NwSrc => "nw_src",
            MatchField::NwDst => "nw_dst",
            MatchField::TpSrc => "tp_src",
            MatchField::TpDst => "tp_dst",
        }
    }

    /// Resolves a record key, accepting the long OpenFlow spelling of the
    /// VLAN priority field as well.
    pub fn from_key(key: &str) -> Result<Self> {
        let field = match key {
            "in_port" => MatchField::InPort,
            "dl_src" => MatchField::DlSrc,
            "dl_dst" => MatchField::DlDst,
            "dl_vlan" => MatchField::DlVlan,
            "dl_vpcp" | "dl_vlan_pcp" => MatchField::DlVlanPcp,
            "dl_type" => MatchField::DlType,
            "nw_tos" => MatchField::NwTos,
            "nw_proto" => MatchField::NwProto,
            "nw_src" => MatchField::NwSrc,
            "nw_dst" => MatchField::NwDst,
            "tp_src" => MatchField::TpSrc,
            "tp_dst" => MatchField::TpDst,
            other => return Err(FlowSpaceError::unrecognized(other)),
        };
        Ok(field)
    }

    /// Width of the field in bits.
    pub fn width(&self) -> u32 {
        match self {
            MatchField::InPort => 16,
            MatchField::DlSrc | MatchField::DlDst => 48,
            MatchField::DlVlan => 16,
            MatchField::DlVlanPcp => 3,
            MatchField::DlType => 16,
            MatchField::NwTos => 8,
            MatchField::NwProto => 8,
            MatchField::NwSrc | MatchField::NwDst => 32,
            MatchField::TpSrc | MatchField::TpDst => 16,
        }
    }

    /// All-ones mask covering the field width.
    pub fn full_mask(&self) -> u64 {
        (1u64 << self.width()) - 1
    }

    fn format(&self) -> ValueFormat {
        match self {
            MatchField::DlSrc | MatchField::DlDst => ValueFormat::Mac,
            MatchField::NwSrc | MatchField::NwDst => ValueFormat::Ipv4,
            _ => ValueFormat::Integer,
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

// ============================================================================
// FIELD MATCH - ONE CONSTRAINT
// ============================================================================

/// Constraint placed on a single header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FieldMatch {
    /// Matches any value
    #[default]
    Wildcard,
    /// Matches exactly one value
    Exact(u64),
    /// Matches every value `v` with `v & mask == value & mask`
    Masked { value: u64, mask: u64 },
}

impl FieldMatch {
    /// Returns the (value, mask) pair this constraint compares under.
    fn value_mask(&self, field: MatchField) -> (u64, u64) {
        match *self {
            FieldMatch::Wildcard => (0, 0),
            FieldMatch::Exact(v) => (v, field.full_mask()),
            FieldMatch::Masked { value, mask } => (value & mask, mask),
        }
    }

    /// Validates the constraint against the field width and folds it to its
    /// canonical form: a full mask becomes `Exact`, an empty mask `Wildcard`.
    pub fn normalize(self, field: MatchField) -> Result<FieldMatch> {
        let full = field.full_mask();
        match self {
            FieldMatch::Wildcard => Ok(FieldMatch::Wildcard),
            FieldMatch::Exact(v) => {
                if v & !full != 0 {
                    return Err(FlowSpaceError::config(format!(
                        "value {:#x} does not fit {} ({} bits)",
                        v,
                        field,
                        field.width()
                    )));
                }
                Ok(FieldMatch::Exact(v))
            }
            FieldMatch::Masked { value, mask } => {
                if value & !full != 0 || mask & !full != 0 {
                    return Err(FlowSpaceError::config(format!(
                        "masked value {:#x}/{:#x} does not fit {} ({} bits)",
                        value,
                        mask,
                        field,
                        field.width()
                    )));
                }
                if mask == 0 {
                    Ok(FieldMatch::Wildcard)
                } else if mask == full {
                    Ok(FieldMatch::Exact(value))
                } else {
                    Ok(FieldMatch::Masked {
                        value: value & mask,
                        mask,
                    })
                }
            }
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, FieldMatch::Wildcard)
    }

    /// Does a concrete header value satisfy this constraint?
    pub fn matches(&self, field: MatchField, header: u64) -> bool {
        let (value, mask) = self.value_mask(field);
        header & mask == value
    }

    /// Can a single value satisfy both constraints?
    pub fn overlaps(&self, field: MatchField, other: &FieldMatch) -> bool {
        let (v1, m1) = self.value_mask(field);
        let (v2, m2) = other.value_mask(field);
        let common = m1 & m2;
        v1 & common == v2 & common
    }

    /// Parses the textual form of a constraint for `field`.
    ///
    /// Accepted: `*` or `any` (wildcard), a bare value, or `value/mask`. IPv4
    /// masks may be a prefix length or a dotted quad.
    pub fn parse(field: MatchField, text: &str) -> Result<FieldMatch> {
        let text = text.trim();
        if text.is_empty() || text == "*" || text.eq_ignore_ascii_case("any") {
            return Ok(FieldMatch::Wildcard);
        }

        let parsed = match text.split_once('/') {
            None => FieldMatch::Exact(parse_value(field, text)?),
            Some((value, mask)) => FieldMatch::Masked {
                value: parse_value(field, value.trim())?,
                mask: parse_mask(field, mask.trim())?,
            },
        };
        parsed.normalize(field)
    }

    /// Converts a JSON record value. Numbers are exact values; strings use
    /// the textual form of [`FieldMatch::parse`].
    pub fn from_json(field: MatchField, value: &Value) -> Result<FieldMatch> {
        match value {
            Value::String(s) => FieldMatch::parse(field, s),
            Value::Number(n) => {
                let v = n.as_u64().ok_or_else(|| {
                    FlowSpaceError::config(format!("{} must be a non-negative integer", field))
                })?;
                FieldMatch::Exact(v).normalize(field)
            }
            Value::Null => Ok(FieldMatch::Wildcard),
            other => Err(FlowSpaceError::config(format!(
                "{} has unsupported value {}",
                field, other
            ))),
        }
    }

    /// Renders the constraint in its textual form; `None` for a wildcard.
    pub fn render(&self, field: MatchField) -> Option<String> {
        match *self {
            FieldMatch::Wildcard => None,
            FieldMatch::Exact(v) => Some(render_value(field, v)),
            FieldMatch::Masked { value, mask } => {
                if field.format() == ValueFormat::Ipv4 {
                    if let Some(prefix) = prefix_len(mask as u32) {
                        return Some(format!("{}/{}", render_value(field, value), prefix));
                    }
                }
                Some(format!(
                    "{}/{}",
                    render_value(field, value),
                    render_mask(field, mask)
                ))
            }
        }
    }
}

fn parse_integer(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok(),
    }
}

fn parse_mac(text: &str) -> Option<u64> {
    let octets: Vec<&str> = text.split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    octets.iter().try_fold(0u64, |acc, octet| {
        if octet.is_empty() || octet.len() > 2 {
            return None;
        }
        u8::from_str_radix(octet, 16)
            .ok()
            .map(|b| (acc << 8) | u64::from(b))
    })
}

fn parse_value(field: MatchField, text: &str) -> Result<u64> {
    let parsed = match field.format() {
        ValueFormat::Integer => parse_integer(text),
        ValueFormat::Mac => parse_mac(text),
        ValueFormat::Ipv4 => text.parse::<Ipv4Addr>().ok().map(|ip| u64::from(u32::from(ip))),
    };
    parsed.ok_or_else(|| FlowSpaceError::config(format!("invalid {} value '{}'", field, text)))
}

fn parse_mask(field: MatchField, text: &str) -> Result<u64> {
    if field.format() == ValueFormat::Ipv4 && !text.contains('.') {
        let prefix: u32 = text.parse().map_err(|_| {
            FlowSpaceError::config(format!("invalid {} prefix length '{}'", field, text))
        })?;
        if prefix > 32 {
            return Err(FlowSpaceError::config(format!(
                "{} prefix length {} exceeds 32",
                field, prefix
            )));
        }
        return Ok(prefix_mask(prefix));
    }
    parse_value(field, text)
}

fn prefix_mask(prefix: u32) -> u64 {
    if prefix == 0 {
        0
    } else {
        u64::from(u32::MAX << (32 - prefix))
    }
}

fn prefix_len(mask: u32) -> Option<u32> {
    let ones = mask.leading_ones();
    (mask.checked_shl(ones).unwrap_or(0) == 0).then_some(ones)
}

fn render_value(field: MatchField, v: u64) -> String {
    match field.format() {
        ValueFormat::Integer => v.to_string(),
        ValueFormat::Mac => (0..6)
            .rev()
            .map(|i| format!("{:02x}", (v >> (i * 8)) & 0xff))
            .collect::<Vec<_>>()
            .join(":"),
        ValueFormat::Ipv4 => Ipv4Addr::from(v as u32).to_string(),
    }
}

fn render_mask(field: MatchField, mask: u64) -> String {
    match field.format() {
        ValueFormat::Integer => format!("{:#x}", mask),
        _ => render_value(field, mask),
    }
}

// ============================================================================
// HEADER FIELDS - CONCRETE QUERY VALUES
// ============================================================================

/// Concrete header values a classification query is made against.
///
/// Fields the caller does not know are simply absent; an entry that
/// constrains an absent field does not match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeaderFields {
    values: BTreeMap<MatchField, u64>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, field: MatchField, value: u64) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn set(&mut self, field: MatchField, value: u64) {
        self.values.insert(field, value);
    }

    pub fn get(&self, field: MatchField) -> Option<u64> {
        self.values.get(&field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parses `(key, value)` text pairs, e.g. `("nw_src", "10.0.0.1")`.
    pub fn parse<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut header = HeaderFields::new();
        for (key, text) in pairs {
            let field = MatchField::from_key(key)?;
            header.set(field, parse_value(field, text.trim())?);
        }
        Ok(header)
    }
}

impl FromIterator<(MatchField, u64)> for HeaderFields {
    fn from_iter<T: IntoIterator<Item = (MatchField, u64)>>(iter: T) -> Self {
        HeaderFields {
            values: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// FLOW MATCH - FULL PATTERN
// ============================================================================

/// A header pattern plus the queue bindings that travel with it.
///
/// Only constrained fields are stored; every other field is a wildcard. The
/// queue ids and forced queue are not used for matching. They mirror the
/// owning entry's bindings so a replacement pattern can carry them forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMatch {
    fields: BTreeMap<MatchField, FieldMatch>,
    queue_ids: Vec<u32>,
    forced_queue: Option<u32>,
}

impl FlowMatch {
    /// A pattern that matches every header.
    pub fn any() -> Self {
        Self::default()
    }

    /// Builder-style constraint; validates the value against the field width.
    pub fn with(mut self, field: MatchField, constraint: FieldMatch) -> Result<Self> {
        self.set(field, constraint)?;
        Ok(self)
    }

    /// Sets (or clears, for a wildcard) the constraint on `field`.
    pub fn set(&mut self, field: MatchField, constraint: FieldMatch) -> Result<()> {
        match constraint.normalize(field)? {
            FieldMatch::Wildcard => {
                self.fields.remove(&field);
            }
            normalized => {
                self.fields.insert(field, normalized);
            }
        }
        Ok(())
    }

    pub fn get(&self, field: MatchField) -> FieldMatch {
        self.fields.get(&field).copied().unwrap_or_default()
    }

    /// Iterates over constrained (non-wildcard) fields in field order.
    pub fn constrained(&self) -> impl Iterator<Item = (MatchField, FieldMatch)> + '_ {
        self.fields.iter().map(|(f, m)| (*f, *m))
    }

    /// True when no field is constrained.
    pub fn is_any(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn queue_ids(&self) -> &[u32] {
        &self.queue_ids
    }

    /// Duplicate ids are dropped, keeping first occurrences.
    pub fn set_queues(&mut self, queue_ids: Vec<u32>) {
        self.queue_ids = unique_queues(queue_ids);
    }

    pub fn forced_queue(&self) -> Option<u32> {
        self.forced_queue
    }

    pub fn set_forced_queue(&mut self, forced_queue: Option<u32>) {
        self.forced_queue = forced_queue;
    }

    /// Does `header` satisfy every constrained field?
    pub fn matches(&self, header: &HeaderFields) -> bool {
        self.fields.iter().all(|(field, constraint)| match header.get(*field) {
            Some(value) => constraint.matches(*field, value),
            None => false,
        })
    }

    /// Two patterns overlap when every field is wildcarded in at least one
    /// of them or both constraints admit a common value.
    pub fn overlaps(&self, other: &FlowMatch) -> bool {
        self.fields.iter().all(|(field, constraint)| {
            constraint.overlaps(*field, &other.get(*field))
        })
    }

    /// Builds a pattern from record key/value pairs.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut pattern = FlowMatch::any();
        for (key, value) in fields {
            let field = MatchField::from_key(key)?;
            pattern.set(field, FieldMatch::from_json(field, value)?)?;
        }
        Ok(pattern)
    }

    /// Renders the constrained fields as record key/value pairs.
    pub fn to_fields(&self) -> BTreeMap<String, Value> {
        self.constrained()
            .filter_map(|(field, constraint)| {
                constraint
                    .render(field)
                    .map(|text| (field.key().to_string(), Value::String(text)))
            })
            .collect()
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "any");
        }
        let parts: Vec<String> = self
            .constrained()
            .filter_map(|(field, c)| c.render(field).map(|t| format!("{}={}", field, t)))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Queue ids form an ordered set.
pub(crate) fn unique_queues(queue_ids: Vec<u32>) -> Vec<u32> {
    let mut unique = Vec::with_capacity(queue_ids.len());
    for queue in queue_ids {
        if !unique.contains(&queue) {
            unique.push(queue);
        }
    }
    unique
}
