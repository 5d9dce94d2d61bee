//! DATE and DATE-TIME value handling.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::component::Property;
use crate::error::{RfcError, RfcResult};

/// A parsed DTSTART/DTEND/EXDATE-style value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcalTime {
    /// VALUE=DATE (all-day)
    Date(NaiveDate),
    /// Form with trailing `Z`
    Utc(DateTime<Utc>),
    /// Floating or TZID-qualified local time
    Local {
        naive: NaiveDateTime,
        tzid: Option<String>,
    },
}

impl IcalTime {
    /// ## Summary
    /// Parses a property carrying a DATE or DATE-TIME value, honoring
    /// `VALUE=DATE` and `TZID` parameters.
    ///
    /// ## Errors
    /// Returns an error when the value matches neither form.
    pub fn from_property(property: &Property) -> RfcResult<Self> {
        Self::parse(&property.value, property.param("TZID"))
    }

    /// ## Summary
    /// Parses a raw DATE or DATE-TIME string with an optional TZID.
    ///
    /// ## Errors
    /// Returns an error when the value matches neither form.
    pub fn parse(value: &str, tzid: Option<&str>) -> RfcResult<Self> {
        let value = value.trim();
        if value.len() == 8 {
            let date = NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|_| {
                RfcError::InvalidValue {
                    property: "DATE",
                    value: value.to_string(),
                }
            })?;
            return Ok(Self::Date(date));
        }

        if let Some(stripped) = value.strip_suffix('Z') {
            let naive =
                NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").map_err(|_| {
                    RfcError::InvalidValue {
                        property: "DATE-TIME",
                        value: value.to_string(),
                    }
                })?;
            return Ok(Self::Utc(DateTime::from_naive_utc_and_offset(naive, Utc)));
        }

        let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").map_err(|_| {
            RfcError::InvalidValue {
                property: "DATE-TIME",
                value: value.to_string(),
            }
        })?;
        Ok(Self::Local {
            naive,
            tzid: tzid.map(String::from),
        })
    }

    /// Whether this value is an all-day DATE
    #[must_use]
    pub const fn is_date(&self) -> bool {
        matches!(self, Self::Date(_))
    }

    /// The TZID carried by this value, if any
    #[must_use]
    pub fn tzid(&self) -> Option<&str> {
        match self {
            Self::Local { tzid, .. } => tzid.as_deref(),
            _ => None,
        }
    }

    /// ## Summary
    /// Converts to a UTC instant. DATE values map to midnight UTC; floating
    /// times are interpreted as UTC; TZID-qualified times are resolved via
    /// the IANA database (earliest mapping on DST ambiguity).
    ///
    /// ## Errors
    /// Returns an error for an unknown TZID.
    pub fn to_utc(&self) -> RfcResult<DateTime<Utc>> {
        match self {
            Self::Date(date) => {
                let naive = NaiveDateTime::new(*date, NaiveTime::MIN);
                Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
            }
            Self::Utc(instant) => Ok(*instant),
            Self::Local { naive, tzid } => match tzid {
                None => Ok(DateTime::from_naive_utc_and_offset(*naive, Utc)),
                Some(tzid) => {
                    let tz: Tz = tzid
                        .parse()
                        .map_err(|_| RfcError::UnknownTimezone(tzid.clone()))?;
                    tz.from_local_datetime(naive)
                        .earliest()
                        .map(|dt| dt.with_timezone(&Utc))
                        .ok_or_else(|| RfcError::UnknownTimezone(tzid.clone()))
                }
            },
        }
    }
}

/// Formats a UTC instant as an iCalendar DATE-TIME with trailing `Z`
#[must_use]
pub fn format_utc(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Formats an instant as an iCalendar DATE
#[must_use]
pub fn format_date(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%d").to_string()
}

/// ## Summary
/// Formats a UTC instant as local time in `tzid` for a TZID-qualified value.
///
/// ## Errors
/// Returns an error for an unknown TZID.
pub fn format_local(instant: DateTime<Utc>, tzid: &str) -> RfcResult<String> {
    let tz: Tz = tzid
        .parse()
        .map_err(|_| RfcError::UnknownTimezone(tzid.to_string()))?;
    Ok(instant
        .with_timezone(&tz)
        .format("%Y%m%dT%H%M%S")
        .to_string())
}
