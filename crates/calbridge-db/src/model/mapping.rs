use diesel::{pg::Pg, prelude::*};

use crate::db::{enums::MappingStatus, schema};

/// Cross-system identity row for one event: both native ids, both UIDs, the
/// CalDAV resource href, version tags, and the content hash of the last
/// propagated state.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Associations)]
#[diesel(table_name = schema::event_mappings)]
#[diesel(check_for_backend(Pg))]
#[diesel(belongs_to(super::pair::CalendarPair, foreign_key = pair_id))]
pub struct EventMapping {
    pub id: uuid::Uuid,
    pub pair_id: uuid::Uuid,
    pub google_event_id: Option<String>,
    pub caldav_event_id: Option<String>,
    pub google_ical_uid: Option<String>,
    pub caldav_uid: Option<String>,
    pub canonical_uid: Option<String>,
    pub caldav_resource_href: Option<String>,
    pub google_self_link: Option<String>,
    pub google_etag: Option<String>,
    pub caldav_etag: Option<String>,
    pub google_sequence: i32,
    pub caldav_sequence: i32,
    pub content_hash: String,
    pub status: MappingStatus,
    pub sync_direction: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl EventMapping {
    /// The native id on the named side, when populated
    #[must_use]
    pub fn native_id_for(&self, source: calbridge_core::types::EventSource) -> Option<&str> {
        match source {
            calbridge_core::types::EventSource::Google => self.google_event_id.as_deref(),
            calbridge_core::types::EventSource::CalDav => self.caldav_event_id.as_deref(),
        }
    }
}

/// Insert struct for creating new event mappings
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::event_mappings)]
pub struct NewEventMapping<'a> {
    pub id: uuid::Uuid,
    pub pair_id: uuid::Uuid,
    pub google_event_id: Option<&'a str>,
    pub caldav_event_id: Option<&'a str>,
    pub google_ical_uid: Option<&'a str>,
    pub caldav_uid: Option<&'a str>,
    pub canonical_uid: Option<&'a str>,
    pub caldav_resource_href: Option<&'a str>,
    pub google_self_link: Option<&'a str>,
    pub google_etag: Option<&'a str>,
    pub caldav_etag: Option<&'a str>,
    pub google_sequence: i32,
    pub caldav_sequence: i32,
    pub content_hash: &'a str,
    pub status: MappingStatus,
    pub sync_direction: Option<&'a str>,
    pub last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
}
