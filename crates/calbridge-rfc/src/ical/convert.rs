//! VEVENT conversion to and from the canonical event model, plus the
//! master-resource mutations the CalDAV adapter performs in place
//! (EXDATE append, RECURRENCE-ID exception insertion, SEQUENCE bump).

use calbridge_core::constants::PRODID;
use calbridge_core::event::{
    Attendee, Event, EventStatus, Organizer, RecurrenceOverride,
};
use calbridge_core::types::EventSource;
use chrono::{DateTime, TimeDelta, Utc};

use super::component::{Component, Parameter, Property};
use super::datetime::{IcalTime, format_date, format_local, format_utc};
use super::parse::unescape_text;
use super::build::escape_text;
use crate::error::{RfcError, RfcResult};

/// ## Summary
/// Returns the first VEVENT in a VCALENDAR, preferring the master (no
/// RECURRENCE-ID) when the resource holds master plus exceptions.
///
/// ## Errors
/// Returns an error when the calendar holds no VEVENT.
pub fn parse_first_vevent(calendar: &Component) -> RfcResult<&Component> {
    let events = calendar.children_named("VEVENT");
    events
        .iter()
        .find(|c| c.get_property("RECURRENCE-ID").is_none())
        .or_else(|| events.first())
        .copied()
        .ok_or(RfcError::MissingComponent("VEVENT"))
}

/// ## Summary
/// Converts a VEVENT into the canonical event. `href` becomes the native id;
/// a missing UID is synthesized from it.
///
/// ## Errors
/// Returns an error when DTSTART is missing or unparseable.
pub fn vevent_to_event(
    vevent: &Component,
    href: &str,
    etag: Option<&str>,
) -> RfcResult<Event> {
    let dtstart_prop = vevent
        .get_property("DTSTART")
        .ok_or(RfcError::MissingProperty("DTSTART"))?;
    let dtstart = IcalTime::from_property(dtstart_prop)?;
    let all_day = dtstart.is_date();
    let timezone = dtstart.tzid().map(String::from);
    let start = dtstart.to_utc()?;

    let end = match vevent.get_property("DTEND") {
        Some(prop) => IcalTime::from_property(prop)?.to_utc()?,
        // RFC 5545 default: all-day events last one day, timed ones are
        // given a nominal hour so the timing invariant holds
        None if all_day => start + TimeDelta::days(1),
        None => start + TimeDelta::hours(1),
    };

    let uid = vevent
        .get_property("UID")
        .map(|p| p.value.clone())
        .unwrap_or_else(|| Event::synthesize_uid(EventSource::CalDav, href));

    let created = property_instant(vevent, "CREATED").unwrap_or_else(Utc::now);
    let updated = property_instant(vevent, "LAST-MODIFIED").unwrap_or(created);

    let sequence = vevent
        .get_property("SEQUENCE")
        .and_then(|p| p.value.parse::<i32>().ok())
        .unwrap_or(0);

    let status = match vevent.get_property("STATUS").map(|p| p.value.to_ascii_uppercase()) {
        Some(s) if s == "CANCELLED" => EventStatus::Cancelled,
        _ => EventStatus::Confirmed,
    };

    let mut overrides = Vec::new();
    let exdates = date_list(vevent, "EXDATE");
    if !exdates.is_empty() {
        overrides.push(RecurrenceOverride::ExDate { dates: exdates });
    }
    let rdates = date_list(vevent, "RDATE");
    if !rdates.is_empty() {
        overrides.push(RecurrenceOverride::RDate { dates: rdates });
    }
    if let Some(prop) = vevent.get_property("RECURRENCE-ID") {
        let instant = IcalTime::from_property(prop)?.to_utc()?;
        overrides.push(RecurrenceOverride::RecurrenceId {
            instant,
            original_start: Some(instant),
        });
    }

    let organizer = vevent.get_property("ORGANIZER").map(|p| Organizer {
        email: strip_mailto(&p.value).to_string(),
        display_name: p.param("CN").map(String::from),
    });

    let attendees = vevent
        .get_properties("ATTENDEE")
        .into_iter()
        .map(|p| Attendee {
            email: strip_mailto(&p.value).to_string(),
            display_name: p.param("CN").map(String::from),
            response_status: p.param("PARTSTAT").map(str::to_lowercase),
            organizer: p
                .param("ROLE")
                .is_some_and(|r| r.eq_ignore_ascii_case("CHAIR")),
        })
        .collect();

    Ok(Event {
        uid,
        native_id: href.to_string(),
        source: EventSource::CalDav,
        summary: text_value(vevent, "SUMMARY").unwrap_or_default(),
        description: text_value(vevent, "DESCRIPTION"),
        location: text_value(vevent, "LOCATION"),
        start,
        end,
        all_day,
        timezone,
        created,
        updated,
        etag: etag.map(String::from),
        sequence,
        status,
        rrule: vevent.get_property("RRULE").map(|p| p.value.clone()),
        overrides,
        // CalDAV overrides link to their master by shared UID
        master_native_id: None,
        organizer,
        attendees,
        raw: None,
    })
}

fn text_value(vevent: &Component, name: &str) -> Option<String> {
    vevent
        .get_property(name)
        .map(|p| unescape_text(&p.value))
        .filter(|v| !v.is_empty())
}

fn property_instant(vevent: &Component, name: &str) -> Option<DateTime<Utc>> {
    vevent
        .get_property(name)
        .and_then(|p| IcalTime::from_property(p).ok())
        .and_then(|t| t.to_utc().ok())
}

fn date_list(vevent: &Component, name: &str) -> Vec<DateTime<Utc>> {
    vevent
        .get_properties(name)
        .into_iter()
        .flat_map(|p| {
            let tzid = p.param("TZID").map(String::from);
            p.value
                .split(',')
                .filter_map(|v| IcalTime::parse(v, tzid.as_deref()).ok())
                .filter_map(|t| t.to_utc().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn strip_mailto(value: &str) -> &str {
    value
        .strip_prefix("mailto:")
        .or_else(|| value.strip_prefix("MAILTO:"))
        .unwrap_or(value)
}

fn datetime_property(name: &str, instant: DateTime<Utc>, all_day: bool, tzid: Option<&str>) -> Property {
    if all_day {
        return Property::with_params(
            name,
            vec![Parameter::new("VALUE", "DATE")],
            &format_date(instant),
        );
    }
    if let Some(tzid) = tzid {
        if let Ok(local) = format_local(instant, tzid) {
            return Property::with_params(name, vec![Parameter::tzid(tzid)], &local);
        }
    }
    Property::new(name, &format_utc(instant))
}

fn build_vevent(event: &Event) -> Component {
    let mut vevent = Component::new("VEVENT");
    vevent.add_property(Property::new("UID", &event.uid));
    vevent.add_property(Property::new("DTSTAMP", &format_utc(Utc::now())));
    vevent.add_property(Property::new("SUMMARY", &escape_text(&event.summary)));
    if let Some(description) = &event.description {
        vevent.add_property(Property::new("DESCRIPTION", &escape_text(description)));
    }
    if let Some(location) = &event.location {
        vevent.add_property(Property::new("LOCATION", &escape_text(location)));
    }

    let tzid = event.timezone.as_deref();
    vevent.add_property(datetime_property("DTSTART", event.start, event.all_day, tzid));
    vevent.add_property(datetime_property("DTEND", event.end, event.all_day, tzid));

    vevent.add_property(Property::new("CREATED", &format_utc(event.created)));
    vevent.add_property(Property::new("LAST-MODIFIED", &format_utc(Utc::now())));
    vevent.add_property(Property::new("SEQUENCE", &event.sequence.to_string()));
    if event.status == EventStatus::Cancelled {
        vevent.add_property(Property::new("STATUS", "CANCELLED"));
    }
    if let Some(rrule) = &event.rrule {
        vevent.add_property(Property::new("RRULE", rrule));
    }

    for entry in &event.overrides {
        match entry {
            RecurrenceOverride::ExDate { dates } => {
                for date in dates {
                    vevent.add_property(datetime_property("EXDATE", *date, event.all_day, None));
                }
            }
            RecurrenceOverride::RDate { dates } => {
                for date in dates {
                    vevent.add_property(datetime_property("RDATE", *date, event.all_day, None));
                }
            }
            RecurrenceOverride::RecurrenceId { instant, .. } => {
                vevent.add_property(datetime_property(
                    "RECURRENCE-ID",
                    *instant,
                    event.all_day,
                    None,
                ));
            }
        }
    }

    if let Some(organizer) = &event.organizer {
        let mut params = Vec::new();
        if let Some(name) = &organizer.display_name {
            params.push(Parameter::new("CN", name));
        }
        vevent.add_property(Property::with_params(
            "ORGANIZER",
            params,
            &format!("mailto:{}", organizer.email),
        ));
    }
    for attendee in &event.attendees {
        let mut params = Vec::new();
        if let Some(name) = &attendee.display_name {
            params.push(Parameter::new("CN", name));
        }
        if let Some(partstat) = &attendee.response_status {
            params.push(Parameter::new("PARTSTAT", &partstat.to_uppercase()));
        }
        vevent.add_property(Property::with_params(
            "ATTENDEE",
            params,
            &format!("mailto:{}", attendee.email),
        ));
    }

    vevent
}

/// Builds a complete VCALENDAR document around a single canonical event
#[must_use]
pub fn build_vcalendar(event: &Event) -> Component {
    let mut calendar = Component::new("VCALENDAR");
    calendar.add_property(Property::new("PRODID", PRODID));
    calendar.add_property(Property::new("VERSION", "2.0"));
    calendar.add_child(build_vevent(event));
    calendar
}

/// Increments the SEQUENCE of a VEVENT, treating a missing one as 0
pub fn bump_sequence(vevent: &mut Component) {
    let next = vevent
        .get_property("SEQUENCE")
        .and_then(|p| p.value.parse::<i32>().ok())
        .unwrap_or(0)
        + 1;
    vevent.set_property(Property::new("SEQUENCE", &next.to_string()));
}

fn master_vevent_mut(calendar: &mut Component) -> RfcResult<&mut Component> {
    calendar
        .children
        .iter_mut()
        .filter(|c| c.name == "VEVENT")
        .find(|c| c.get_property("RECURRENCE-ID").is_none())
        .ok_or(RfcError::MissingComponent("VEVENT"))
}

/// ## Summary
/// Appends an EXDATE for a cancelled occurrence to the master VEVENT of the
/// resource and bumps its SEQUENCE.
///
/// ## Errors
/// Returns an error when the calendar holds no master VEVENT.
pub fn add_exdate(
    calendar: &mut Component,
    instant: DateTime<Utc>,
    all_day: bool,
) -> RfcResult<()> {
    let master = master_vevent_mut(calendar)?;
    master.add_property(datetime_property("EXDATE", instant, all_day, None));
    bump_sequence(master);
    Ok(())
}

/// ## Summary
/// Inserts a modified occurrence as a VEVENT with RECURRENCE-ID into the
/// master's resource, forcing the master UID, and bumps the master SEQUENCE.
/// No second resource with the same UID is ever created.
///
/// ## Errors
/// Returns an error when the calendar holds no master VEVENT.
pub fn insert_recurrence_exception(
    calendar: &mut Component,
    exception: &Event,
    master_uid: &str,
    original_start: DateTime<Utc>,
) -> RfcResult<()> {
    let mut vevent = build_vevent(exception);
    vevent.set_property(Property::new("UID", master_uid));
    vevent.set_property(datetime_property(
        "RECURRENCE-ID",
        original_start,
        exception.all_day,
        None,
    ));

    // Replace a previous exception for the same occurrence, if any
    let marker = datetime_property("RECURRENCE-ID", original_start, exception.all_day, None);
    calendar.children.retain(|c| {
        c.name != "VEVENT"
            || c.get_property("RECURRENCE-ID")
                .is_none_or(|p| p.value != marker.value)
    });
    calendar.add_child(vevent);

    let master = master_vevent_mut(calendar)?;
    bump_sequence(master);
    Ok(())
}
