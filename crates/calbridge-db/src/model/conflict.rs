use diesel::{pg::Pg, prelude::*};

use crate::db::schema;
use crate::model::session::SyncSession;

/// Audit record of a detected conflict, carrying both sides' serialized
/// payloads and the applied resolution
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Associations)]
#[diesel(table_name = schema::conflicts)]
#[diesel(check_for_backend(Pg))]
#[diesel(belongs_to(SyncSession, foreign_key = session_id))]
pub struct Conflict {
    pub id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub mapping_id: Option<uuid::Uuid>,
    pub google_event_id: Option<String>,
    pub caldav_event_id: Option<String>,
    pub google_payload: Option<serde_json::Value>,
    pub caldav_payload: Option<serde_json::Value>,
    pub conflict_kind: String,
    pub resolution: Option<String>,
    pub resolved: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::conflicts)]
pub struct NewConflict<'a> {
    pub id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub mapping_id: Option<uuid::Uuid>,
    pub google_event_id: Option<&'a str>,
    pub caldav_event_id: Option<&'a str>,
    pub google_payload: Option<serde_json::Value>,
    pub caldav_payload: Option<serde_json::Value>,
    pub conflict_kind: &'a str,
    pub resolution: Option<&'a str>,
    pub resolved: bool,
}
