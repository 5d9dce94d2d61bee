//! Content line lexer and document parser for iCalendar (RFC 5545 §3.1).
//!
//! Handles line unfolding, content-line tokenization, and assembly of the
//! BEGIN/END component tree.

use super::component::{Component, Parameter, Property};
use crate::error::{RfcError, RfcResult};

/// Unfolds content lines by removing CRLF sequences followed by whitespace.
///
/// Per RFC 5545 §3.1:
/// - Lines are folded by inserting CRLF followed by whitespace (SPACE or HTAB)
/// - Unfolding removes the CRLF and the single whitespace character
///
/// Bare LF is normalized to CRLF for lenient parsing.
#[must_use]
pub fn unfold(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = 0;

    while i < len {
        if bytes[i] == b'\r' && i + 1 < len && bytes[i + 1] == b'\n' {
            if i + 2 < len && (bytes[i + 2] == b' ' || bytes[i + 2] == b'\t') {
                // Fold: skip CRLF and the whitespace
                i += 3;
            } else {
                result.push('\r');
                result.push('\n');
                i += 2;
            }
        } else if bytes[i] == b'\n' {
            if i + 1 < len && (bytes[i + 1] == b' ' || bytes[i + 1] == b'\t') {
                i += 2;
            } else {
                result.push('\r');
                result.push('\n');
                i += 1;
            }
        } else {
            result.push(bytes[i] as char);
            i += 1;
        }
    }

    result
}

/// Unescapes TEXT values: `\\`, `\;`, `\,`, `\n`/`\N`
#[must_use]
pub fn unescape_text(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n' | 'N') => result.push('\n'),
                Some(other) => result.push(other),
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// ## Summary
/// Splits one unfolded content line into a [`Property`].
///
/// The value is kept raw; TEXT unescaping is the caller's concern since
/// date and recurrence values must not be unescaped.
///
/// ## Errors
/// Returns a parse error when the line has no `:` value separator.
pub fn parse_content_line(line: &str) -> RfcResult<Property> {
    let mut name = String::new();
    let mut params = Vec::new();
    let mut chars = line.char_indices();
    let mut in_quotes = false;
    let mut param_start: Option<usize> = None;
    let mut name_end: Option<usize> = None;
    let mut value_start: Option<usize> = None;

    for (idx, c) in chars.by_ref() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                if name_end.is_none() {
                    name_end = Some(idx);
                    name = line[..idx].to_string();
                } else if let Some(start) = param_start {
                    params.push(parse_parameter(&line[start..idx])?);
                }
                param_start = Some(idx + 1);
            }
            ':' if !in_quotes => {
                if name_end.is_none() {
                    name = line[..idx].to_string();
                } else if let Some(start) = param_start {
                    params.push(parse_parameter(&line[start..idx])?);
                }
                value_start = Some(idx + 1);
                break;
            }
            _ => {}
        }
    }

    let Some(value_start) = value_start else {
        return Err(RfcError::ParseError(format!(
            "content line has no value separator: {line}"
        )));
    };

    Ok(Property::with_params(&name, params, &line[value_start..]))
}

fn parse_parameter(segment: &str) -> RfcResult<Parameter> {
    let (name, value) = segment.split_once('=').ok_or_else(|| {
        RfcError::ParseError(format!("parameter without '=': {segment}"))
    })?;
    Ok(Parameter::new(name, value.trim_matches('"')))
}

/// ## Summary
/// Parses a full iCalendar document into its root component tree.
///
/// ## Errors
/// Returns a parse error on malformed content lines or unbalanced
/// BEGIN/END pairs, or when no VCALENDAR root is present.
pub fn parse_calendar(input: &str) -> RfcResult<Component> {
    let unfolded = unfold(input);
    let mut stack: Vec<Component> = Vec::new();
    let mut root: Option<Component> = None;

    for line in unfolded.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let property = parse_content_line(line)?;
        match property.name.as_str() {
            "BEGIN" => {
                stack.push(Component::new(&property.value));
            }
            "END" => {
                let Some(finished) = stack.pop() else {
                    return Err(RfcError::ParseError(format!(
                        "END:{} without matching BEGIN",
                        property.value
                    )));
                };
                if !finished.name.eq_ignore_ascii_case(&property.value) {
                    return Err(RfcError::ParseError(format!(
                        "END:{} closes BEGIN:{}",
                        property.value, finished.name
                    )));
                }
                if let Some(parent) = stack.last_mut() {
                    parent.add_child(finished);
                } else {
                    root = Some(finished);
                }
            }
            _ => {
                if let Some(current) = stack.last_mut() {
                    current.add_property(property);
                }
                // Properties outside any component are ignored (lenient)
            }
        }
    }

    match root {
        Some(component) if component.name == "VCALENDAR" => Ok(component),
        Some(component) => Err(RfcError::ParseError(format!(
            "unexpected root component {}",
            component.name
        ))),
        None => Err(RfcError::MissingComponent("VCALENDAR")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfold_joins_folded_lines() {
        let input = "SUMMARY:a long\r\n  summary\r\nUID:x\r\n";
        assert_eq!(unfold(input), "SUMMARY:a long summary\r\nUID:x\r\n");
    }

    #[test]
    fn content_line_with_params() {
        let prop = parse_content_line("DTSTART;TZID=Europe/Berlin:20260301T100000").unwrap();
        assert_eq!(prop.name, "DTSTART");
        assert_eq!(prop.param("TZID"), Some("Europe/Berlin"));
        assert_eq!(prop.value, "20260301T100000");
    }

    #[test]
    fn quoted_params_may_contain_separators() {
        let prop =
            parse_content_line("ATTENDEE;CN=\"Doe; Jane\":mailto:jane@example.com").unwrap();
        assert_eq!(prop.param("CN"), Some("Doe; Jane"));
        assert_eq!(prop.value, "mailto:jane@example.com");
    }

    #[test]
    fn parses_nested_components() {
        let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:u1\r\nSUMMARY:Hi\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let cal = parse_calendar(ics).unwrap();
        assert_eq!(cal.name, "VCALENDAR");
        let event = cal.child("VEVENT").unwrap();
        assert_eq!(event.get_property("UID").unwrap().value, "u1");
    }

    #[test]
    fn rejects_unbalanced_components() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(parse_calendar(ics).is_err());
    }

    #[test]
    fn unescape_text_sequences() {
        assert_eq!(unescape_text("a\\nb\\,c\\;d\\\\e"), "a\nb,c;d\\e");
    }
}
