// examples/flow_map_usage.rs
//
// Building a FlowSpace, classifying traffic and exporting records

use flowspace::{
    records_to_json, Dpid, FieldMatch, FlowEntry, FlowMap, FlowMatch, FlowSpaceRecord,
    FlowSpaceUpdate, HeaderFields, MatchField, Permission,
};

fn main() -> Result<(), flowspace::FlowSpaceError> {
    println!("=== FlowMap Usage Examples ===\n");

    let mut map = populate()?;
    classify(&map);
    patch(&mut map)?;
    export(&map);

    println!("\n=== All Examples Completed Successfully ===");
    Ok(())
}

// ============================================================================
// Example 1: Populating the map
// ============================================================================

fn populate() -> Result<FlowMap, flowspace::FlowSpaceError> {
    println!("--- Example 1: Populate ---");

    let web = FlowEntry::builder()
        .id(1)
        .name("tenant2-web")
        .dpid(Dpid::parse("00:00:00:00:00:00:00:01")?)
        .priority(100)
        .rule_match(FlowMatch::any().with(MatchField::TpDst, FieldMatch::parse(MatchField::TpDst, "80")?)?)
        .slice_action("tenant2", Permission::READ | Permission::WRITE)
        .build()?;

    let default = FlowEntry::builder()
        .id(2)
        .name("tenant1-default")
        .priority(1)
        .slice_action("tenant1", Permission::all())
        .build()?;

    let mut map = FlowMap::new();
    map.add(web)?;
    map.add(default)?;
    println!("✓ {} entries\n", map.len());
    Ok(map)
}

// ============================================================================
// Example 2: Classification
// ============================================================================

fn classify(map: &FlowMap) {
    println!("--- Example 2: Classify ---");

    let http = HeaderFields::new().with(MatchField::TpDst, 80);
    for entry in map.matches(Dpid::new(1), &http) {
        println!("  {} (priority {})", entry.name(), entry.priority());
    }
    println!(
        "✓ tenant2 holds {:?} on HTTP\n",
        map.slice_permission(Dpid::new(1), &http, "tenant2")
    );
}

// ============================================================================
// Example 3: Replacing an entry
// ============================================================================

fn patch(map: &mut FlowMap) -> Result<(), flowspace::FlowSpaceError> {
    println!("--- Example 3: Patch ---");

    let current = map.find_by_name("tenant2-web")?;
    let next = FlowSpaceUpdate::new("tenant2-web").with_priority(0).apply(&current);
    map.remove(current.id())?;
    map.add(next)?;
    println!("✓ tenant2-web now at priority {}\n", map.find_by_name("tenant2-web")?.priority());
    Ok(())
}

// ============================================================================
// Example 4: Export
// ============================================================================

fn export(map: &FlowMap) {
    println!("--- Example 4: Export ---");

    let records: Vec<FlowSpaceRecord> = map
        .snapshot()
        .iter()
        .map(|e| FlowSpaceRecord::from_entry(e))
        .collect();
    println!("{}", records_to_json(&records));
}
