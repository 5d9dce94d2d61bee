use diesel::{pg::Pg, prelude::*};

use crate::db::schema;

/// A configured one-to-one pairing of a Google calendar with a CalDAV
/// collection, including the per-pair incremental tokens.
///
/// Tokens are mutated only by the sync engine; rows are created by the pair
/// manager and removed only by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = schema::calendar_pairs)]
#[diesel(check_for_backend(Pg))]
pub struct CalendarPair {
    pub id: uuid::Uuid,
    pub google_calendar_id: String,
    pub caldav_calendar_id: String,
    pub google_calendar_name: Option<String>,
    pub caldav_calendar_name: Option<String>,
    pub direction: String,
    pub enabled: bool,
    pub conflict_policy: Option<String>,
    pub google_sync_token: Option<String>,
    pub caldav_sync_token: Option<String>,
    pub google_last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
    pub caldav_last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Insert struct for creating new calendar pairs
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::calendar_pairs)]
pub struct NewCalendarPair<'a> {
    pub id: uuid::Uuid,
    pub google_calendar_id: &'a str,
    pub caldav_calendar_id: &'a str,
    pub google_calendar_name: Option<&'a str>,
    pub caldav_calendar_name: Option<&'a str>,
    pub direction: &'a str,
    pub enabled: bool,
    pub conflict_policy: Option<&'a str>,
}
