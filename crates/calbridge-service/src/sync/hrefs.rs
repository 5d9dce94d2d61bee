//! Back-mapping of deleted CalDAV hrefs onto mapping rows.
//!
//! Servers report deletions as hrefs which may be relative, absolute, or
//! re-encoded; matching runs exact, then suffix, then normalized-filename,
//! and leaves anything else unmatched for the log.

use std::collections::{HashMap, HashSet};

use calbridge_db::model::mapping::EventMapping;

/// Result of mapping deleted hrefs onto the pair's mappings
#[derive(Debug, Default)]
pub struct DeletedHrefs {
    /// CalDAV-side native ids whose resources are gone
    pub caldav_event_ids: HashSet<String>,
    /// Hrefs no mapping row accounts for; logged, never acted on
    pub unmatched: Vec<String>,
}

/// ## Summary
/// Maps deleted hrefs to the CalDAV native ids of mapping rows: exact match
/// on the stored resource href, then suffix match (relative vs absolute),
/// then normalized filename match (strip `.ics`, lowercase).
#[must_use]
pub fn map_deleted_hrefs(deleted: &HashSet<String>, mappings: &[EventMapping]) -> DeletedHrefs {
    let mut result = DeletedHrefs::default();
    if deleted.is_empty() {
        return result;
    }

    let mut by_href: HashMap<&str, &str> = HashMap::new();
    let mut by_filename: HashMap<String, &str> = HashMap::new();
    for mapping in mappings {
        let (Some(href), Some(event_id)) =
            (&mapping.caldav_resource_href, &mapping.caldav_event_id)
        else {
            continue;
        };
        by_href.insert(href.as_str(), event_id.as_str());
        if let Some(name) = normalize_resource_href(href) {
            by_filename.insert(name, event_id.as_str());
        }
    }

    for href in deleted {
        if let Some(event_id) = by_href.get(href.as_str()) {
            result.caldav_event_ids.insert((*event_id).to_string());
            continue;
        }
        if let Some(event_id) = by_href
            .iter()
            .find(|(known, _)| hrefs_match(href, known))
            .map(|(_, id)| *id)
        {
            result.caldav_event_ids.insert(event_id.to_string());
            continue;
        }
        if let Some(event_id) =
            normalize_resource_href(href).and_then(|name| by_filename.get(&name))
        {
            result.caldav_event_ids.insert((*event_id).to_string());
            continue;
        }
        result.unmatched.push(href.clone());
    }

    result
}

/// Last path component with any `.ics` extension stripped, lowercased
#[must_use]
pub fn normalize_resource_href(href: &str) -> Option<String> {
    let path = href
        .strip_prefix("https://")
        .or_else(|| href.strip_prefix("http://"))
        .map_or(href, |rest| rest.find('/').map_or("", |i| &rest[i..]));
    let name = path.trim_end_matches('/').rsplit('/').next()?;
    if name.is_empty() {
        return None;
    }
    let name = name.strip_suffix(".ics").unwrap_or(name);
    Some(name.to_lowercase())
}

fn hrefs_match(a: &str, b: &str) -> bool {
    a == b || a.ends_with(b) || b.ends_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use calbridge_db::db::enums::MappingStatus;
    use chrono::Utc;

    fn mapping(href: Option<&str>, caldav_id: Option<&str>) -> EventMapping {
        EventMapping {
            id: uuid::Uuid::new_v4(),
            pair_id: uuid::Uuid::new_v4(),
            google_event_id: Some("g1".to_string()),
            caldav_event_id: caldav_id.map(String::from),
            google_ical_uid: None,
            caldav_uid: None,
            canonical_uid: None,
            caldav_resource_href: href.map(String::from),
            google_self_link: None,
            google_etag: None,
            caldav_etag: None,
            google_sequence: 0,
            caldav_sequence: 0,
            content_hash: "h".to_string(),
            status: MappingStatus::Active,
            sync_direction: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_synced_at: None,
        }
    }

    #[test]
    fn exact_match_wins() {
        let rows = vec![mapping(
            Some("https://cal.example.com/home/evt1.ics"),
            Some("https://cal.example.com/home/evt1.ics"),
        )];
        let deleted: HashSet<String> =
            ["https://cal.example.com/home/evt1.ics".to_string()].into();
        let result = map_deleted_hrefs(&deleted, &rows);
        assert_eq!(result.caldav_event_ids.len(), 1);
        assert!(result.unmatched.is_empty());
    }

    #[test]
    fn suffix_match_bridges_relative_and_absolute() {
        let rows = vec![mapping(
            Some("https://cal.example.com/home/evt1.ics"),
            Some("caldav-1"),
        )];
        let deleted: HashSet<String> = ["/home/evt1.ics".to_string()].into();
        let result = map_deleted_hrefs(&deleted, &rows);
        assert!(result.caldav_event_ids.contains("caldav-1"));
    }

    #[test]
    fn normalized_filename_is_the_last_resort() {
        let rows = vec![mapping(
            Some("https://cal.example.com/home/EVT1.ics"),
            Some("caldav-1"),
        )];
        let deleted: HashSet<String> = ["/elsewhere/evt1.ics".to_string()].into();
        let result = map_deleted_hrefs(&deleted, &rows);
        assert!(result.caldav_event_ids.contains("caldav-1"));
    }

    #[test]
    fn unknown_hrefs_stay_unmatched() {
        let rows = vec![mapping(Some("/home/evt1.ics"), Some("caldav-1"))];
        let deleted: HashSet<String> = ["/home/other.ics".to_string()].into();
        let result = map_deleted_hrefs(&deleted, &rows);
        assert!(result.caldav_event_ids.is_empty());
        assert_eq!(result.unmatched.len(), 1);
    }

    #[test]
    fn normalization_strips_extension_and_case() {
        assert_eq!(
            normalize_resource_href("https://h/cal/ABC-123.ics").as_deref(),
            Some("abc-123")
        );
        assert_eq!(normalize_resource_href("/cal/x/").as_deref(), Some("x"));
        assert_eq!(normalize_resource_href(""), None);
    }
}
