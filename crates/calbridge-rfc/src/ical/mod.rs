//! iCalendar handling (RFC 5545), limited to what the sync engine carries:
//! content-line lexing, a component/property tree, date-time values, a
//! serializer, and VEVENT conversion to and from the canonical event model.

pub mod build;
pub mod component;
pub mod convert;
pub mod datetime;
pub mod parse;

pub use component::{Component, Parameter, Property};
pub use convert::{
    add_exdate, build_vcalendar, bump_sequence, insert_recurrence_exception, parse_first_vevent,
    vevent_to_event,
};
pub use datetime::IcalTime;
