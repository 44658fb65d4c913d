// Ordered FlowSpace storage and the matching algorithm.
//
// Entries are kept in a single vector sorted by (priority desc, id asc), so a
// linear scan yields matches already in classification order. Lookups by id
// and by name go through hash indexes.
//
// Memory Model:
// - Readers: clone the current Arc<FlowSnapshot> under a short read lock and
//   work on that snapshot; it never changes underneath them.
// - Writer: clone the snapshot, modify the clone, swap it in.
// - A reader therefore sees either the pre-update or the post-update version
//   of any entry, never a partial write.

use crate::error::{FlowSpaceError, Result};
use crate::flow_entry::{Dpid, EntryId, FlowEntry};
use crate::flow_match::{FlowMatch, HeaderFields};
use crate::slice_action::Permission;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Immutable snapshot
// ============================================================================

/// Immutable view of the FlowSpace at one point in time.
#[derive(Debug, Clone, Default)]
pub struct FlowSnapshot {
    /// Sorted by priority descending, then id ascending
    entries: Vec<Arc<FlowEntry>>,
    by_id: HashMap<EntryId, Arc<FlowEntry>>,
    by_name: HashMap<String, EntryId>,
}

impl FlowSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in classification order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FlowEntry>> {
        self.entries.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Result<Arc<FlowEntry>> {
        self.by_name
            .get(name)
            .and_then(|id| self.by_id.get(id))
            .cloned()
            .ok_or_else(|| FlowSpaceError::not_found(format!("name={}", name)))
    }

    pub fn find_by_id(&self, id: EntryId) -> Result<Arc<FlowEntry>> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowSpaceError::not_found(format!("id={}", id)))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn contains_id(&self, id: EntryId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Largest id present, if any.
    pub fn max_id(&self) -> Option<EntryId> {
        self.by_id.keys().copied().max()
    }

    /// Lazily yields every entry claiming `header` on `dpid`, in
    /// classification order. The sequence owns the snapshot, so it can be
    /// cloned to restart and dropped early at no cost.
    pub fn matches(self: &Arc<Self>, dpid: Dpid, header: &HeaderFields) -> Matches {
        Matches {
            snapshot: Arc::clone(self),
            position: 0,
            dpid,
            header: header.clone(),
        }
    }

    /// Every entry on a compatible datapath whose pattern overlaps `pattern`,
    /// in classification order.
    pub fn intersect(&self, dpid: Dpid, pattern: &FlowMatch) -> Vec<Arc<FlowEntry>> {
        self.entries
            .iter()
            .filter(|e| e.intersects(dpid, pattern))
            .cloned()
            .collect()
    }

    /// Permission `slice` holds over `header` on `dpid`: taken from the first
    /// matching entry that names the slice.
    pub fn slice_permission(&self, dpid: Dpid, header: &HeaderFields, slice: &str) -> Option<Permission> {
        self.entries
            .iter()
            .filter(|e| e.matches(dpid, header))
            .find_map(|e| e.permission_for(slice))
    }

    fn insert(&mut self, entry: Arc<FlowEntry>) -> Result<()> {
        if self.by_name.contains_key(entry.name()) {
            return Err(FlowSpaceError::config(format!(
                "an entry named '{}' already exists",
                entry.name()
            )));
        }
        if self.by_id.contains_key(&entry.id()) {
            return Err(FlowSpaceError::config(format!(
                "an entry with id {} already exists",
                entry.id()
            )));
        }

        let key = entry.order_key();
        let position = self.entries.partition_point(|e| e.order_key() < key);
        self.by_name.insert(entry.name().to_string(), entry.id());
        self.by_id.insert(entry.id(), Arc::clone(&entry));
        self.entries.insert(position, entry);
        Ok(())
    }

    fn delete(&mut self, id: EntryId) -> Result<Arc<FlowEntry>> {
        let entry = self
            .by_id
            .remove(&id)
            .ok_or_else(|| FlowSpaceError::not_found(format!("id={}", id)))?;
        self.by_name.remove(entry.name());
        self.entries.retain(|e| e.id() != id);
        Ok(entry)
    }
}

/// Lazy match sequence produced by [`FlowSnapshot::matches`].
#[derive(Debug, Clone)]
pub struct Matches {
    snapshot: Arc<FlowSnapshot>,
    position: usize,
    dpid: Dpid,
    header: HeaderFields,
}

impl Iterator for Matches {
    type Item = Arc<FlowEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.snapshot.entries.get(self.position) {
            self.position += 1;
            if entry.matches(self.dpid, &self.header) {
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.snapshot.entries.len().saturating_sub(self.position)))
    }
}

// ============================================================================
// FlowMap
// ============================================================================

/// The working FlowSpace.
///
/// Reads are served from immutable snapshots; writes replace the current
/// snapshot wholesale. `FlowMap` itself is the write handle and is held by a
/// single owner; everyone else reads through a [`FlowMapReader`].
#[derive(Debug, Default)]
pub struct FlowMap {
    current: Arc<RwLock<Arc<FlowSnapshot>>>,
}

impl FlowMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from existing entries. Fails with `ConfigError` on a
    /// duplicate name or id.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = FlowEntry>,
    {
        let mut snapshot = FlowSnapshot::default();
        for entry in entries {
            snapshot.insert(Arc::new(entry))?;
        }
        Ok(FlowMap {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        })
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<FlowSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Read-only handle sharing this map's state.
    pub fn reader(&self) -> FlowMapReader {
        FlowMapReader {
            current: Arc::clone(&self.current),
        }
    }

    /// Inserts `entry` in classification order.
    pub fn add(&mut self, entry: FlowEntry) -> Result<Arc<FlowEntry>> {
        let entry = Arc::new(entry);
        let mut guard = self.current.write();
        let mut next = FlowSnapshot::clone(&guard);
        next.insert(Arc::clone(&entry))?;
        *guard = Arc::new(next);
        Ok(entry)
    }

    /// Removes and returns the entry with `id`.
    pub fn remove(&mut self, id: EntryId) -> Result<Arc<FlowEntry>> {
        let mut guard = self.current.write();
        let mut next = FlowSnapshot::clone(&guard);
        let removed = next.delete(id)?;
        *guard = Arc::new(next);
        Ok(removed)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Arc<FlowEntry>> {
        self.snapshot().find_by_name(name)
    }

    pub fn find_by_id(&self, id: EntryId) -> Result<Arc<FlowEntry>> {
        self.snapshot().find_by_id(id)
    }

    pub fn matches(&self, dpid: Dpid, header: &HeaderFields) -> Matches {
        self.snapshot().matches(dpid, header)
    }

    pub fn intersect(&self, dpid: Dpid, pattern: &FlowMatch) -> Vec<Arc<FlowEntry>> {
        self.snapshot().intersect(dpid, pattern)
    }

    pub fn slice_permission(&self, dpid: Dpid, header: &HeaderFields, slice: &str) -> Option<Permission> {
        self.snapshot().slice_permission(dpid, header, slice)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Shared read-only view of a [`FlowMap`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FlowMapReader {
    current: Arc<RwLock<Arc<FlowSnapshot>>>,
}

impl FlowMapReader {
    pub fn snapshot(&self) -> Arc<FlowSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn find_by_name(&self, name: &str) -> Result<Arc<FlowEntry>> {
        self.snapshot().find_by_name(name)
    }

    pub fn find_by_id(&self, id: EntryId) -> Result<Arc<FlowEntry>> {
        self.snapshot().find_by_id(id)
    }

    pub fn matches(&self, dpid: Dpid, header: &HeaderFields) -> Matches {
        self.snapshot().matches(dpid, header)
    }

    pub fn intersect(&self, dpid: Dpid, pattern: &FlowMatch) -> Vec<Arc<FlowEntry>> {
        self.snapshot().intersect(dpid, pattern)
    }

    pub fn slice_permission(&self, dpid: Dpid, header: &HeaderFields, slice: &str) -> Option<Permission> {
        self.snapshot().slice_permission(dpid, header, slice)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_match::{FieldMatch, MatchField};
    use crate::ErrorKind;

    fn entry(id: EntryId, name: &str, dpid: Dpid, priority: u32) -> FlowEntry {
        FlowEntry::builder()
            .id(id)
            .name(name)
            .dpid(dpid)
            .priority(priority)
            .slice_action("tenant1", 7u32)
            .build()
            .unwrap()
    }

    fn names(matches: Matches) -> Vec<String> {
        matches.map(|e| e.name().to_string()).collect()
    }

    #[test]
    fn test_matches_follow_priority_then_id() {
        let mut map = FlowMap::new();
        map.add(entry(3, "low", Dpid::new(1), 1)).unwrap();
        map.add(entry(2, "tie-b", Dpid::new(1), 5)).unwrap();
        map.add(entry(1, "tie-a", Dpid::new(1), 5)).unwrap();
        map.add(entry(4, "high", Dpid::ALL, 9)).unwrap();

        let found = names(map.matches(Dpid::new(1), &HeaderFields::new()));
        assert_eq!(found, vec!["high", "tie-a", "tie-b", "low"]);
    }

    #[test]
    fn test_unknown_dpid_without_wildcards_matches_nothing() {
        let mut map = FlowMap::new();
        map.add(entry(1, "a", Dpid::new(1), 1)).unwrap();
        map.add(entry(2, "b", Dpid::new(2), 1)).unwrap();
        assert_eq!(map.matches(Dpid::new(99), &HeaderFields::new()).count(), 0);
    }

    #[test]
    fn test_header_constraints_filter_matches() {
        let web = FlowEntry::builder()
            .id(1)
            .name("web")
            .priority(10)
            .rule_match(FlowMatch::any().with(MatchField::TpDst, FieldMatch::Exact(80)).unwrap())
            .build()
            .unwrap();
        let mut map = FlowMap::new();
        map.add(web).unwrap();
        map.add(entry(2, "rest", Dpid::ALL, 1)).unwrap();

        let http = HeaderFields::new().with(MatchField::TpDst, 80);
        let ssh = HeaderFields::new().with(MatchField::TpDst, 22);
        assert_eq!(names(map.matches(Dpid::new(5), &http)), vec!["web", "rest"]);
        assert_eq!(names(map.matches(Dpid::new(5), &ssh)), vec!["rest"]);
        assert_eq!(names(map.matches(Dpid::new(5), &HeaderFields::new())), vec!["rest"]);
    }

    #[test]
    fn test_match_sequence_is_restartable() {
        let mut map = FlowMap::new();
        map.add(entry(1, "a", Dpid::ALL, 2)).unwrap();
        map.add(entry(2, "b", Dpid::ALL, 1)).unwrap();

        let mut seq = map.matches(Dpid::new(1), &HeaderFields::new());
        let restart = seq.clone();
        assert_eq!(seq.next().unwrap().name(), "a");
        assert_eq!(names(restart), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicates_are_config_errors() {
        let mut map = FlowMap::new();
        map.add(entry(1, "a", Dpid::ALL, 1)).unwrap();
        let err = map.add(entry(2, "a", Dpid::ALL, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
        let err = map.add(entry(1, "b", Dpid::ALL, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_lookups_and_remove() {
        let mut map = FlowMap::new();
        map.add(entry(7, "a", Dpid::ALL, 1)).unwrap();
        assert_eq!(map.find_by_name("a").unwrap().id(), 7);
        assert_eq!(map.find_by_id(7).unwrap().name(), "a");
        assert_eq!(map.find_by_name("ghost").unwrap_err().kind(), ErrorKind::NotFound);

        let removed = map.remove(7).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(map.remove(7).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(map.find_by_name("a").unwrap_err().kind(), ErrorKind::NotFound);
        assert!(map.is_empty());
    }

    #[test]
    fn test_snapshots_are_isolated_from_later_writes() {
        let mut map = FlowMap::new();
        let reader = map.reader();
        map.add(entry(1, "a", Dpid::ALL, 1)).unwrap();
        let before = reader.snapshot();
        map.remove(1).unwrap();
        assert_eq!(before.len(), 1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_intersect_and_slice_permission() {
        let tenant_web = FlowEntry::builder()
            .id(1)
            .name("tenant2-web")
            .dpid(Dpid::new(1))
            .priority(20)
            .rule_match(FlowMatch::any().with(MatchField::TpDst, FieldMatch::Exact(80)).unwrap())
            .slice_action("tenant2", 2u32)
            .build()
            .unwrap();
        let mut map = FlowMap::new();
        map.add(tenant_web).unwrap();
        map.add(entry(2, "default", Dpid::ALL, 1)).unwrap();

        let ssh = FlowMatch::any().with(MatchField::TpDst, FieldMatch::Exact(22)).unwrap();
        let hits: Vec<String> = map
            .intersect(Dpid::new(1), &ssh)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(hits, vec!["default"]);
        assert_eq!(map.intersect(Dpid::ALL, &FlowMatch::any()).len(), 2);

        let http = HeaderFields::new().with(MatchField::TpDst, 80);
        assert_eq!(
            map.slice_permission(Dpid::new(1), &http, "tenant2"),
            Some(Permission::from_bits(Permission::READ))
        );
        assert_eq!(
            map.slice_permission(Dpid::new(1), &http, "tenant1"),
            Some(Permission::all())
        );
        assert_eq!(map.slice_permission(Dpid::new(2), &http, "tenant2"), None);
    }
}
