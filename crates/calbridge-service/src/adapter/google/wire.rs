//! JSON wire types for the token API and conversion to and from the
//! canonical event model.

use calbridge_core::event::{
    Attendee, Event, EventStatus, Organizer, RecurrenceOverride,
};
use calbridge_core::types::{CalendarInfo, EventSource};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::error::{AdapterError, AdapterResult};

use super::ids::derive_event_id;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListPage {
    #[serde(default)]
    pub items: Vec<CalendarListEntry>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListEntry {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub time_zone: Option<String>,
    pub background_color: Option<String>,
    pub access_role: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

impl CalendarListEntry {
    pub fn into_calendar_info(self) -> CalendarInfo {
        CalendarInfo {
            name: self
                .summary
                .unwrap_or_else(|| "Unnamed Calendar".to_string()),
            id: self.id,
            source: EventSource::Google,
            description: self.description,
            timezone: self.time_zone.unwrap_or_else(|| "UTC".to_string()),
            color: self.background_color,
            access_role: self.access_role,
            is_primary: self.primary,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    #[serde(default)]
    pub items: Vec<WireEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEventTime {
    pub date: Option<NaiveDate>,
    pub date_time: Option<DateTime<Utc>>,
    pub time_zone: Option<String>,
}

impl WireEventTime {
    /// The UTC instant this wire time denotes, midnight for all-day dates
    #[must_use]
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        if let Some(dt) = self.date_time {
            return Some(dt);
        }
        self.date
            .map(|d| DateTime::from_naive_utc_and_offset(d.and_time(NaiveTime::MIN), Utc))
    }

    const fn is_all_day(&self) -> bool {
        self.date.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrganizer {
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttendee {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub response_status: Option<String>,
    #[serde(default)]
    pub organizer: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub id: String,
    pub status: Option<String>,
    pub etag: Option<String>,
    #[serde(rename = "iCalUID")]
    pub ical_uid: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<WireEventTime>,
    pub end: Option<WireEventTime>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub sequence: Option<i32>,
    pub recurrence: Option<Vec<String>>,
    pub recurring_event_id: Option<String>,
    pub original_start_time: Option<WireEventTime>,
    pub organizer: Option<WireOrganizer>,
    pub attendees: Option<Vec<WireAttendee>>,
    pub self_link: Option<String>,
}

impl WireEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    /// ## Summary
    /// Converts the wire event into canonical form. Cancelled overrides may
    /// lack explicit times; their `originalStartTime` stands in so the
    /// engine can express them as EXDATE merges on the other side.
    ///
    /// ## Errors
    /// Returns `Fatal` for an event that carries no usable timing at all.
    pub fn into_event(self) -> AdapterResult<Event> {
        let raw = serde_json::to_value(ShallowRaw::of(&self)).ok();

        let start_time = self
            .start
            .clone()
            .or_else(|| self.original_start_time.clone());
        let start = start_time
            .as_ref()
            .and_then(WireEventTime::instant)
            .ok_or_else(|| {
                AdapterError::Fatal(format!("event {} has no start time", self.id))
            })?;
        let all_day = start_time.as_ref().is_some_and(WireEventTime::is_all_day);

        let end = self
            .end
            .as_ref()
            .and_then(WireEventTime::instant)
            .unwrap_or_else(|| {
                if all_day {
                    start + TimeDelta::days(1)
                } else {
                    start + TimeDelta::hours(1)
                }
            });

        let timezone = if all_day {
            None
        } else {
            start_time.as_ref().and_then(|t| t.time_zone.clone())
        };

        let uid = self
            .ical_uid
            .clone()
            .unwrap_or_else(|| Event::synthesize_uid(EventSource::Google, &self.id));

        let rrule = self.recurrence.as_ref().and_then(|lines| {
            lines.iter().find_map(|line| {
                line.strip_prefix("RRULE:")
                    .map(String::from)
                    .or_else(|| (!line.contains(':')).then(|| line.clone()))
            })
        });

        let mut overrides = Vec::new();
        if self.recurring_event_id.is_some() {
            let original = self
                .original_start_time
                .as_ref()
                .and_then(WireEventTime::instant);
            overrides.push(RecurrenceOverride::RecurrenceId {
                instant: original.unwrap_or(start),
                original_start: original,
            });
        }

        let status = if self.is_cancelled() {
            EventStatus::Cancelled
        } else {
            EventStatus::Confirmed
        };

        let organizer = self.organizer.and_then(|o| {
            o.email.map(|email| Organizer {
                email,
                display_name: o.display_name,
            })
        });

        let attendees = self
            .attendees
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| {
                a.email.map(|email| Attendee {
                    email,
                    display_name: a.display_name,
                    response_status: a.response_status,
                    organizer: a.organizer,
                })
            })
            .collect();

        let created = self.created.unwrap_or(start);

        Ok(Event {
            uid,
            native_id: self.id,
            source: EventSource::Google,
            summary: self.summary.unwrap_or_default(),
            description: self.description.filter(|s| !s.is_empty()),
            location: self.location.filter(|s| !s.is_empty()),
            start,
            end,
            all_day,
            timezone,
            created,
            updated: self.updated.unwrap_or(created),
            etag: self.etag,
            sequence: self.sequence.unwrap_or(0),
            status,
            rrule,
            overrides,
            master_native_id: self.recurring_event_id,
            organizer,
            attendees,
            raw,
        })
    }
}

/// Raw payload kept for diagnostics: the identity and link fields only,
/// not the full response body
#[derive(Debug, serde::Serialize)]
struct ShallowRaw<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    self_link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<&'a str>,
}

impl<'a> ShallowRaw<'a> {
    fn of(event: &'a WireEvent) -> Self {
        Self {
            id: &event.id,
            self_link: event.self_link.as_deref(),
            etag: event.etag.as_deref(),
        }
    }
}

fn wire_time(instant: DateTime<Utc>, all_day: bool, timezone: Option<&str>) -> serde_json::Value {
    if all_day {
        serde_json::json!({ "date": instant.format("%Y-%m-%d").to_string() })
    } else if let Some(tz) = timezone {
        serde_json::json!({
            "dateTime": instant.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "timeZone": tz,
        })
    } else {
        serde_json::json!({
            "dateTime": instant.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        })
    }
}

/// ## Summary
/// Builds the insert/update request body for a canonical event. When
/// `with_client_id` is set the deterministic id derived from the UID is
/// included so creation is idempotent.
#[must_use]
pub fn event_body(event: &Event, with_client_id: bool) -> serde_json::Value {
    let mut body = serde_json::json!({
        "summary": event.summary,
        "description": event.description.as_deref().unwrap_or(""),
        "location": event.location.as_deref().unwrap_or(""),
        "start": wire_time(event.start, event.all_day, event.timezone.as_deref()),
        "end": wire_time(event.end, event.all_day, event.timezone.as_deref()),
        "sequence": event.sequence,
    });
    let map = body
        .as_object_mut()
        .unwrap_or_else(|| unreachable!("body is an object"));

    if !event.uid.is_empty() {
        map.insert("iCalUID".to_string(), event.uid.clone().into());
        if with_client_id {
            map.insert("id".to_string(), derive_event_id(&event.uid).into());
        }
    }
    if event.status == EventStatus::Cancelled {
        map.insert("status".to_string(), "cancelled".into());
    }
    if let Some(rrule) = &event.rrule {
        map.insert(
            "recurrence".to_string(),
            serde_json::json!([format!("RRULE:{rrule}")]),
        );
    }
    if let Some(master) = &event.master_native_id {
        map.insert("recurringEventId".to_string(), master.clone().into());
        map.insert(
            "originalStartTime".to_string(),
            wire_time(event.original_start(), event.all_day, None),
        );
    }
    if !event.attendees.is_empty() {
        let attendees: Vec<serde_json::Value> = event
            .attendees
            .iter()
            .map(|a| {
                let mut attendee = serde_json::json!({
                    "email": a.email,
                    "responseStatus": a.response_status.as_deref().unwrap_or("needsAction"),
                });
                if let (Some(name), Some(obj)) = (&a.display_name, attendee.as_object_mut()) {
                    obj.insert("displayName".to_string(), name.clone().into());
                }
                attendee
            })
            .collect();
        map.insert("attendees".to_string(), attendees.into());
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_event_json(body: &str) -> WireEvent {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn timed_event_converts() {
        let wire = wire_event_json(
            r#"{
                "id": "evt1",
                "iCalUID": "evt1@google.com",
                "summary": "Review",
                "start": {"dateTime": "2026-03-02T14:00:00+01:00", "timeZone": "Europe/Berlin"},
                "end": {"dateTime": "2026-03-02T15:00:00+01:00", "timeZone": "Europe/Berlin"},
                "updated": "2026-02-01T08:00:00Z",
                "sequence": 3,
                "etag": "\"e3\""
            }"#,
        );
        let event = wire.into_event().unwrap();
        assert_eq!(event.uid, "evt1@google.com");
        assert_eq!(event.sequence, 3);
        assert!(!event.all_day);
        assert_eq!(event.timezone.as_deref(), Some("Europe/Berlin"));
        // +01:00 normalized to UTC
        assert_eq!(event.start.to_rfc3339(), "2026-03-02T13:00:00+00:00");
    }

    #[test]
    fn all_day_event_converts() {
        let wire = wire_event_json(
            r#"{
                "id": "evt2",
                "summary": "Offsite",
                "start": {"date": "2026-03-02"},
                "end": {"date": "2026-03-03"}
            }"#,
        );
        let event = wire.into_event().unwrap();
        assert!(event.all_day);
        assert_eq!(event.uid, "google-evt2");
        assert_eq!(event.end - event.start, TimeDelta::days(1));
    }

    #[test]
    fn cancelled_override_uses_original_start() {
        let wire = wire_event_json(
            r#"{
                "id": "evt3_20260309T090000Z",
                "status": "cancelled",
                "recurringEventId": "evt3",
                "originalStartTime": {"dateTime": "2026-03-09T09:00:00Z"}
            }"#,
        );
        let event = wire.into_event().unwrap();
        assert_eq!(event.status, EventStatus::Cancelled);
        assert_eq!(event.master_native_id.as_deref(), Some("evt3"));
        assert_eq!(event.start.to_rfc3339(), "2026-03-09T09:00:00+00:00");
        assert!(event.is_recurrence_override());
    }

    #[test]
    fn event_body_carries_deterministic_id() {
        let wire = wire_event_json(
            r#"{
                "id": "evt1",
                "iCalUID": "evt1@google.com",
                "summary": "Review",
                "start": {"dateTime": "2026-03-02T14:00:00Z"},
                "end": {"dateTime": "2026-03-02T15:00:00Z"}
            }"#,
        );
        let event = wire.into_event().unwrap();
        let body = event_body(&event, true);
        let id = body["id"].as_str().unwrap();
        assert_eq!(id, derive_event_id("evt1@google.com"));
        assert_eq!(body["iCalUID"], "evt1@google.com");
    }

    #[test]
    fn rrule_prefix_is_stripped() {
        let wire = wire_event_json(
            r#"{
                "id": "evt4",
                "summary": "Weekly",
                "start": {"dateTime": "2026-03-02T09:00:00Z"},
                "end": {"dateTime": "2026-03-02T09:30:00Z"},
                "recurrence": ["RRULE:FREQ=WEEKLY;BYDAY=MO"]
            }"#,
        );
        let event = wire.into_event().unwrap();
        assert_eq!(event.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO"));
        let body = event_body(&event, false);
        assert_eq!(body["recurrence"][0], "RRULE:FREQ=WEEKLY;BYDAY=MO");
    }
}
