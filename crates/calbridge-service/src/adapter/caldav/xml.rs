//! WebDAV XML bodies and multistatus parsing.
//!
//! One parser serves PROPFIND, calendar-query, and sync-collection
//! responses; callers pick out the fields they need.

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;

use crate::error::{AdapterError, AdapterResult};

/// One `DAV:response` entry of a multistatus document
#[derive(Debug, Clone, Default)]
pub struct DavResponse {
    pub href: String,
    /// Response-level status code; 404 marks a deleted member in
    /// sync-collection reports
    pub status: Option<u16>,
    pub etag: Option<String>,
    pub calendar_data: Option<String>,
    pub display_name: Option<String>,
    pub is_calendar: bool,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    /// `DAV:current-user-principal` href
    pub principal: Option<String>,
    /// `caldav:calendar-home-set` href
    pub calendar_home: Option<String>,
}

impl DavResponse {
    /// Whether this entry reports a deleted member
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status == Some(404)
    }
}

/// A parsed `DAV:multistatus` document
#[derive(Debug, Clone, Default)]
pub struct MultiStatus {
    pub responses: Vec<DavResponse>,
    /// Document-level `DAV:sync-token`
    pub sync_token: Option<String>,
}

impl MultiStatus {
    /// The sync token from the document or any response entry
    #[must_use]
    pub fn any_sync_token(&self) -> Option<&str> {
        self.sync_token
            .as_deref()
            .or_else(|| self.responses.iter().find_map(|r| r.sync_token.as_deref()))
    }
}

/// ## Summary
/// Parses a multistatus body into responses, capturing the properties the
/// adapter consumes. Namespace prefixes are ignored; elements are matched
/// by local name, which is what the wire actually varies on.
///
/// ## Errors
/// Returns `Fatal` on malformed XML.
#[expect(clippy::too_many_lines)]
pub fn parse_multistatus(xml: &[u8]) -> AdapterResult<MultiStatus> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut result = MultiStatus::default();
    let mut current: Option<DavResponse> = None;
    let mut in_propstat = false;
    let mut in_resourcetype = false;
    let mut in_principal = false;
    let mut in_calendar_home = false;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(ref e) | XmlEvent::Empty(ref e)) => {
                let local_name_bytes = e.local_name();
                let local_name = std::str::from_utf8(local_name_bytes.as_ref())
                    .map_err(|err| AdapterError::Fatal(format!("bad XML name: {err}")))?
                    .to_ascii_lowercase();
                text.clear();

                match local_name.as_str() {
                    "response" => current = Some(DavResponse::default()),
                    "propstat" => in_propstat = true,
                    "resourcetype" => in_resourcetype = true,
                    "current-user-principal" => in_principal = true,
                    "calendar-home-set" => in_calendar_home = true,
                    "calendar" if in_resourcetype => {
                        if let Some(response) = current.as_mut() {
                            response.is_calendar = true;
                        }
                    }
                    _ => {}
                }
            }
            Ok(XmlEvent::Text(ref e)) => {
                let decoded = e
                    .decode()
                    .map_err(|err| AdapterError::Fatal(format!("bad XML text: {err}")))?;
                let piece = quick_xml::escape::unescape(&decoded)
                    .map_err(|err| AdapterError::Fatal(format!("bad XML text: {err}")))?;
                text.push_str(&piece);
            }
            Ok(XmlEvent::CData(ref e)) => {
                text.push_str(&String::from_utf8_lossy(e));
            }
            Ok(XmlEvent::End(ref e)) => {
                let local_name_bytes = e.local_name();
                let local_name = std::str::from_utf8(local_name_bytes.as_ref())
                    .map_err(|err| AdapterError::Fatal(format!("bad XML name: {err}")))?
                    .to_ascii_lowercase();

                match local_name.as_str() {
                    "response" => {
                        if let Some(response) = current.take() {
                            result.responses.push(response);
                        }
                    }
                    "propstat" => in_propstat = false,
                    "resourcetype" => in_resourcetype = false,
                    "current-user-principal" => in_principal = false,
                    "calendar-home-set" => in_calendar_home = false,
                    "href" => {
                        let value = text.trim().to_string();
                        if let Some(response) = current.as_mut() {
                            if in_principal {
                                response.principal = Some(value);
                            } else if in_calendar_home {
                                response.calendar_home = Some(value);
                            } else if response.href.is_empty() {
                                response.href = value;
                            }
                        }
                        text.clear();
                    }
                    "status" => {
                        // Only the response-level status marks deletion;
                        // propstat statuses describe property retrieval
                        if !in_propstat {
                            if let (Some(response), Some(code)) =
                                (current.as_mut(), parse_status_code(text.trim()))
                            {
                                response.status = Some(code);
                            }
                        }
                        text.clear();
                    }
                    "getetag" | "calendar-data" | "displayname" | "getctag" | "sync-token" => {
                        let value = text.trim().to_string();
                        let value = (!value.is_empty()).then_some(value);
                        match (local_name.as_str(), current.as_mut()) {
                            ("getetag", Some(response)) => response.etag = value,
                            ("calendar-data", Some(response)) => response.calendar_data = value,
                            ("displayname", Some(response)) => response.display_name = value,
                            ("getctag", Some(response)) => response.ctag = value,
                            ("sync-token", Some(response)) => response.sync_token = value,
                            ("sync-token", None) => result.sync_token = value,
                            _ => {}
                        }
                        text.clear();
                    }
                    _ => {
                        text.clear();
                    }
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(AdapterError::Fatal(format!("malformed multistatus: {err}")));
            }
        }
        buf.clear();
    }

    Ok(result)
}

fn parse_status_code(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}

/// PROPFIND body requesting the current user principal
#[must_use]
pub fn propfind_principal_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:current-user-principal/>
  </D:prop>
</D:propfind>"#
        .to_string()
}

/// PROPFIND body requesting the calendar home set
#[must_use]
pub fn propfind_calendar_home_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <C:calendar-home-set/>
  </D:prop>
</D:propfind>"#
        .to_string()
}

/// PROPFIND body listing collections with display name and change tags
#[must_use]
pub fn propfind_calendars_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/">
  <D:prop>
    <D:displayname/>
    <D:resourcetype/>
    <CS:getctag/>
    <D:sync-token/>
  </D:prop>
</D:propfind>"#
        .to_string()
}

/// PROPFIND body for the collection-level sync token and CTag
#[must_use]
pub fn propfind_sync_token_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/">
  <D:prop>
    <D:sync-token/>
    <CS:getctag/>
    <D:getetag/>
  </D:prop>
</D:propfind>"#
        .to_string()
}

/// RFC 6578 sync-collection REPORT body; `since_token` empty means initial
#[must_use]
pub fn sync_collection_body(since_token: Option<&str>) -> String {
    let token_line = since_token
        .map(|t| format!("  <D:sync-token>{}</D:sync-token>\n", escape_xml(t)))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<D:sync-collection xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
{token_line}  <D:sync-level>1</D:sync-level>
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
</D:sync-collection>"#
    )
}

/// calendar-query REPORT body over a VEVENT time-range window
#[must_use]
pub fn calendar_query_body(start: &str, end: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="{start}" end="{end}"/>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#
    )
}

/// calendar-query REPORT body matching a single UID
#[must_use]
pub fn calendar_query_uid_body(uid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:prop-filter name="UID">
          <C:text-match collation="i;octet">{}</C:text-match>
        </C:prop-filter>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#,
        escape_xml(uid)
    )
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sync_collection_changes_and_deletions() {
        let xml = br#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/cal/home/evt1.ics</D:href>
    <D:propstat>
      <D:prop>
        <D:getetag>"etag-1"</D:getetag>
        <C:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:evt1@example.com
DTSTART:20260302T090000Z
END:VEVENT
END:VCALENDAR</C:calendar-data>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/cal/home/evt2.ics</D:href>
    <D:status>HTTP/1.1 404 Not Found</D:status>
  </D:response>
  <D:sync-token>https://example.com/sync/42</D:sync-token>
</D:multistatus>"#;

        let parsed = parse_multistatus(xml).unwrap();
        assert_eq!(parsed.sync_token.as_deref(), Some("https://example.com/sync/42"));
        assert_eq!(parsed.responses.len(), 2);

        let changed = &parsed.responses[0];
        assert_eq!(changed.href, "/cal/home/evt1.ics");
        assert_eq!(changed.etag.as_deref(), Some("\"etag-1\""));
        assert!(changed.calendar_data.as_deref().unwrap().contains("UID:evt1@example.com"));
        assert!(!changed.is_deleted());

        let deleted = &parsed.responses[1];
        assert!(deleted.is_deleted());
        assert_eq!(deleted.href, "/cal/home/evt2.ics");
    }

    #[test]
    fn propstat_status_is_not_a_deletion() {
        let xml = br#"<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/cal/home/evt1.ics</D:href>
    <D:propstat>
      <D:prop><D:getetag>"e"</D:getetag></D:prop>
      <D:status>HTTP/1.1 404 Not Found</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        let parsed = parse_multistatus(xml).unwrap();
        assert!(!parsed.responses[0].is_deleted());
    }

    #[test]
    fn parses_principal_and_home_hrefs() {
        let xml = br#"<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/</D:href>
    <D:propstat>
      <D:prop>
        <D:current-user-principal><D:href>https://p65-caldav.example.com/principal/1/</D:href></D:current-user-principal>
        <C:calendar-home-set><D:href>/calendars/1/</D:href></C:calendar-home-set>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        let parsed = parse_multistatus(xml).unwrap();
        let response = &parsed.responses[0];
        assert_eq!(response.href, "/");
        assert_eq!(
            response.principal.as_deref(),
            Some("https://p65-caldav.example.com/principal/1/")
        );
        assert_eq!(response.calendar_home.as_deref(), Some("/calendars/1/"));
    }

    #[test]
    fn parses_calendar_listing() {
        let xml = br#"<D:multistatus xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/">
  <D:response>
    <D:href>/calendars/1/work/</D:href>
    <D:propstat>
      <D:prop>
        <D:displayname>Work</D:displayname>
        <D:resourcetype><D:collection/><C:calendar xmlns:C="urn:ietf:params:xml:ns:caldav"/></D:resourcetype>
        <CS:getctag>ct-9</CS:getctag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/calendars/1/inbox/</D:href>
    <D:propstat>
      <D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;
        let parsed = parse_multistatus(xml).unwrap();
        assert!(parsed.responses[0].is_calendar);
        assert_eq!(parsed.responses[0].display_name.as_deref(), Some("Work"));
        assert_eq!(parsed.responses[0].ctag.as_deref(), Some("ct-9"));
        assert!(!parsed.responses[1].is_calendar);
    }

    #[test]
    fn apple_top_level_sync_token_is_found() {
        let xml = br#"<D:multistatus xmlns:D="DAV:">
  <D:sync-token>FT=-@RU=abc</D:sync-token>
</D:multistatus>"#;
        let parsed = parse_multistatus(xml).unwrap();
        assert_eq!(parsed.any_sync_token(), Some("FT=-@RU=abc"));
    }
}
