//! iCalendar serialization: text escaping, 75-octet line folding, and
//! component tree serialization with CRLF line endings.

use super::component::{Component, Property};

/// Escapes a TEXT value per RFC 5545 §3.3.11
#[must_use]
pub fn escape_text(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            ';' => result.push_str("\\;"),
            ',' => result.push_str("\\,"),
            '\n' => result.push_str("\\n"),
            '\r' => {}
            other => result.push(other),
        }
    }
    result
}

/// ## Summary
/// Folds a content line at 75 octets with a single-space continuation,
/// never splitting a UTF-8 sequence.
#[must_use]
pub fn fold_line(line: &str) -> String {
    const LIMIT: usize = 75;

    if line.len() <= LIMIT {
        return line.to_string();
    }

    let mut result = String::with_capacity(line.len() + line.len() / LIMIT * 3);
    let mut budget = LIMIT;
    let mut width = 0;
    for c in line.chars() {
        let c_len = c.len_utf8();
        if width + c_len > budget {
            result.push_str("\r\n ");
            // Continuation lines lose one octet to the leading space
            budget = LIMIT - 1;
            width = 0;
        }
        result.push(c);
        width += c_len;
    }
    result
}

fn serialize_property(property: &Property, out: &mut String) {
    let mut line = property.name.clone();
    for param in &property.params {
        line.push(';');
        line.push_str(&param.name);
        line.push('=');
        if param.value.contains([';', ',', ':']) {
            line.push('"');
            line.push_str(&param.value);
            line.push('"');
        } else {
            line.push_str(&param.value);
        }
    }
    line.push(':');
    line.push_str(&property.value);
    out.push_str(&fold_line(&line));
    out.push_str("\r\n");
}

fn serialize_component(component: &Component, out: &mut String) {
    out.push_str("BEGIN:");
    out.push_str(&component.name);
    out.push_str("\r\n");
    for property in &component.properties {
        serialize_property(property, out);
    }
    for child in &component.children {
        serialize_component(child, out);
    }
    out.push_str("END:");
    out.push_str(&component.name);
    out.push_str("\r\n");
}

/// Serializes a component tree to an iCalendar document
#[must_use]
pub fn serialize(component: &Component) -> String {
    let mut out = String::new();
    serialize_component(component, &mut out);
    out
}
