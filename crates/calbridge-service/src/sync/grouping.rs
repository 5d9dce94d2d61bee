//! Recurrence grouping: masters first, overrides attached to them, and
//! orphaned overrides demoted to standalone events.

use std::collections::HashMap;

use calbridge_core::event::Event;

/// A recurring master (or standalone event) with its overrides
#[derive(Debug, Clone)]
pub struct RecurrenceGroup {
    pub master: Event,
    pub overrides: Vec<Event>,
}

/// ## Summary
/// Partitions a change set into recurrence groups keyed by master identity:
/// `master_native_id` when the source links overrides explicitly, else the
/// shared UID. Overrides whose master is nowhere in the set are demoted to
/// standalone events with their master-reference fields cleared.
///
/// Ordering is deterministic: groups by `(master.start, master.native_id)`,
/// overrides within a group by `(start, native_id)`.
#[must_use]
pub fn group_recurrences(events: &HashMap<String, Event>) -> Vec<RecurrenceGroup> {
    let mut groups: HashMap<String, RecurrenceGroup> = HashMap::new();
    let mut master_by_uid: HashMap<String, String> = HashMap::new();
    let mut pending_overrides: Vec<Event> = Vec::new();

    for event in events.values() {
        if event.is_recurrence_override() {
            pending_overrides.push(event.clone());
        } else {
            if !event.uid.is_empty() {
                master_by_uid.insert(event.uid.clone(), event.native_id.clone());
            }
            groups.insert(
                event.native_id.clone(),
                RecurrenceGroup {
                    master: event.clone(),
                    overrides: Vec::new(),
                },
            );
        }
    }

    for mut override_event in pending_overrides {
        let master_id = override_event
            .master_native_id
            .as_ref()
            .filter(|id| groups.contains_key(*id))
            .cloned()
            .or_else(|| master_by_uid.get(&override_event.uid).cloned());

        match master_id.and_then(|id| groups.get_mut(&id)) {
            Some(group) => group.overrides.push(override_event),
            None => {
                tracing::warn!(
                    native_id = %override_event.native_id,
                    uid = %override_event.uid,
                    "Orphaned recurrence override, demoting to standalone"
                );
                override_event.demote_to_standalone();
                groups.insert(
                    override_event.native_id.clone(),
                    RecurrenceGroup {
                        master: override_event,
                        overrides: Vec::new(),
                    },
                );
            }
        }
    }

    let mut ordered: Vec<RecurrenceGroup> = groups.into_values().collect();
    for group in &mut ordered {
        group
            .overrides
            .sort_by(|a, b| (a.start, &a.native_id).cmp(&(b.start, &b.native_id)));
    }
    ordered.sort_by(|a, b| {
        (a.master.start, &a.master.native_id).cmp(&(b.master.start, &b.master.native_id))
    });
    ordered
}
