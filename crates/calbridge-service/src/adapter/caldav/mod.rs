//! CalDAV adapter (iCloud class).
//!
//! Identity: `native_id` is the resource href (absolute URL); `uid` is the
//! iCalendar UID inside the resource. The adapter follows the principal
//! discovery redirect and rebinds its base URL to the server-specific host
//! before issuing any REPORT; without the rebind those return 403.
//!
//! Token acquisition tries `DAV:sync-token` via PROPFIND, then an initial
//! `sync-collection` REPORT, then falls back to a CTag token marked with a
//! `ctag:` prefix. CTag fallback change sets never claim token semantics,
//! so the engine never acts on deletions while in fallback.

use std::collections::{HashMap, HashSet};

use calbridge_core::event::{Event, EventStatus};
use calbridge_core::types::{CalendarInfo, ChangeSet, EventSource};
use calbridge_rfc::ical::{
    self, add_exdate, build_vcalendar, insert_recurrence_exception, parse_first_vevent,
    vevent_to_event,
};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::OnceCell;

use crate::adapter::{CalendarAdapter, TimeWindow};
use crate::error::{AdapterError, AdapterResult};
use crate::retry::{RateLimiter, RetryPolicy};

pub mod xml;

use xml::{DavResponse, MultiStatus};

/// Prefix marking a coarse CTag fallback token
pub const CTAG_TOKEN_PREFIX: &str = "ctag:";

/// Separator between a resource href and an embedded override instant
const INSTANCE_SEP: char = '#';

struct Discovered {
    /// scheme://host of the server-specific endpoint
    origin: String,
    calendar_home: String,
}

pub struct CalDavAdapter {
    client: reqwest::Client,
    discovery_url: String,
    username: String,
    password: String,
    discovered: OnceCell<Discovered>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl CalDavAdapter {
    /// ## Summary
    /// Builds the adapter against a discovery entry point with Basic auth
    /// credentials (an app-specific password).
    ///
    /// ## Errors
    /// Returns `Fatal` when the HTTP client cannot be constructed.
    pub fn new(
        discovery_url: String,
        username: String,
        password: String,
        retry: RetryPolicy,
    ) -> AdapterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AdapterError::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            discovery_url: discovery_url.trim_end_matches('/').to_string(),
            username,
            password,
            discovered: OnceCell::new(),
            limiter: RateLimiter::new(2),
            retry,
        })
    }

    async fn dav_request(
        &self,
        method: &str,
        url: &str,
        depth: Option<&str>,
        body: Option<&str>,
    ) -> AdapterResult<(reqwest::StatusCode, Vec<u8>, Option<String>)> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| AdapterError::Fatal(format!("bad HTTP method: {e}")))?;
        self.retry
            .run(|| async {
                let _permit = self.limiter.acquire().await?;
                let mut request = self
                    .client
                    .request(method.clone(), url)
                    .basic_auth(&self.username, Some(&self.password));
                if let Some(depth) = depth {
                    request = request.header("Depth", depth);
                }
                if let Some(body) = body {
                    request = request
                        .header("Content-Type", "application/xml; charset=utf-8")
                        .body(body.to_string());
                }
                let response = request.send().await?;
                let status = response.status();
                let etag = response
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                let bytes = response.bytes().await?.to_vec();
                if status.is_success() {
                    return Ok((status, bytes, etag));
                }
                Err(Self::error_for(status, &bytes))
            })
            .await
    }

    fn error_for(status: reqwest::StatusCode, body: &[u8]) -> AdapterError {
        let body = String::from_utf8_lossy(body).into_owned();
        match status.as_u16() {
            401 => AdapterError::AuthFailure(format!("401: {body}")),
            403 => AdapterError::AuthFailure(format!("403: {body}")),
            404 | 410 => AdapterError::NotFound(format!("{status}: {body}")),
            409 | 412 => AdapterError::Conflict(format!("{status}: {body}")),
            429 | 503 => AdapterError::RateLimited(format!("{status}: {body}")),
            500..=599 => AdapterError::Transient(format!("{status}: {body}")),
            _ => AdapterError::Fatal(format!("{status}: {body}")),
        }
    }

    async fn discovered(&self) -> AdapterResult<&Discovered> {
        self.discovered
            .get_or_try_init(|| self.discover())
            .await
    }

    /// Principal discovery and base URL rebind
    #[tracing::instrument(skip(self))]
    async fn discover(&self) -> AdapterResult<Discovered> {
        let (_, body, _) = self
            .dav_request(
                "PROPFIND",
                &format!("{}/", self.discovery_url),
                Some("0"),
                Some(&xml::propfind_principal_body()),
            )
            .await?;
        let parsed = xml::parse_multistatus(&body)?;
        let principal = parsed
            .responses
            .iter()
            .find_map(|r| r.principal.clone())
            .ok_or_else(|| {
                AdapterError::AuthFailure("no current-user-principal in discovery response".into())
            })?;

        // The principal href may live on a server-specific host; all later
        // requests must go there or the server answers 403
        let origin = if principal.starts_with("http") {
            origin_of(&principal)?
        } else {
            self.discovery_url.clone()
        };
        let principal_url = resolve_href(&origin, &principal);
        tracing::debug!(%origin, %principal_url, "Principal discovered");

        let (_, body, _) = self
            .dav_request(
                "PROPFIND",
                &principal_url,
                Some("0"),
                Some(&xml::propfind_calendar_home_body()),
            )
            .await?;
        let parsed = xml::parse_multistatus(&body)?;
        let home = parsed
            .responses
            .iter()
            .find_map(|r| r.calendar_home.clone())
            .ok_or_else(|| {
                AdapterError::AuthFailure("no calendar-home-set on principal".into())
            })?;
        let calendar_home = resolve_href(&origin, &home);
        tracing::info!(%calendar_home, "CalDAV endpoint bound");

        Ok(Discovered {
            origin,
            calendar_home,
        })
    }

    async fn resolve(&self, href: &str) -> AdapterResult<String> {
        let discovered = self.discovered().await?;
        Ok(resolve_href(&discovered.origin, href))
    }

    fn changed_events_from(
        &self,
        responses: &[DavResponse],
        origin: &str,
        max_events: usize,
    ) -> (HashMap<String, Event>, HashSet<String>) {
        let mut changed = HashMap::new();
        let mut deleted = HashSet::new();
        for response in responses {
            if response.href.is_empty() {
                continue;
            }
            let href = resolve_href(origin, &response.href);
            if response.is_deleted() {
                deleted.insert(href);
                continue;
            }
            let Some(data) = &response.calendar_data else {
                continue;
            };
            if changed.len() >= max_events {
                continue;
            }
            match events_from_resource(data, &href, response.etag.as_deref()) {
                Ok(events) => {
                    for event in events {
                        changed.insert(event.native_id.clone(), event);
                    }
                }
                Err(err) => {
                    tracing::warn!(%href, error = %err, "Skipping unparseable resource");
                }
            }
        }
        (changed, deleted)
    }

    #[tracing::instrument(skip(self), fields(calendar_id))]
    async fn fetch_snapshot(
        &self,
        calendar_id: &str,
        window: TimeWindow,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        let origin = self.discovered().await?.origin.clone();
        let body = xml::calendar_query_body(
            &window.start.format("%Y%m%dT%H%M%SZ").to_string(),
            &window.end.format("%Y%m%dT%H%M%SZ").to_string(),
        );
        let (_, bytes, _) = self
            .dav_request("REPORT", calendar_id, Some("1"), Some(&body))
            .await?;
        let parsed = xml::parse_multistatus(&bytes)?;
        let (changed, _) = self.changed_events_from(&parsed.responses, &origin, max_events);
        Ok(ChangeSet::snapshot(changed, None))
    }

    async fn fetch_sync_collection(
        &self,
        calendar_id: &str,
        since_token: &str,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        let origin = self.discovered().await?.origin.clone();
        let body = xml::sync_collection_body(Some(since_token));

        // Issued outside dav_request so the raw status stays visible: a 403
        // while a token is offered means the server no longer honors that
        // token, while a 401 is a credential failure and stays fatal
        let method = reqwest::Method::from_bytes(b"REPORT")
            .map_err(|e| AdapterError::Fatal(format!("bad HTTP method: {e}")))?;
        let bytes = self
            .retry
            .run(|| async {
                let _permit = self.limiter.acquire().await?;
                let response = self
                    .client
                    .request(method.clone(), calendar_id)
                    .basic_auth(&self.username, Some(&self.password))
                    .header("Depth", "1")
                    .header("Content-Type", "application/xml; charset=utf-8")
                    .body(body.clone())
                    .send()
                    .await?;
                let status = response.status();
                let bytes = response.bytes().await?.to_vec();
                if status.is_success() {
                    return Ok(bytes);
                }
                if status.as_u16() == 403 {
                    return Err(AdapterError::TokenInvalidated(format!(
                        "403: {}",
                        String::from_utf8_lossy(&bytes)
                    )));
                }
                Err(Self::error_for(status, &bytes))
            })
            .await?;
        let parsed: MultiStatus = xml::parse_multistatus(&bytes)?;
        let next_token = parsed.any_sync_token().map(String::from);
        let (changed, deleted) = self.changed_events_from(&parsed.responses, &origin, max_events);
        tracing::debug!(
            changed = changed.len(),
            deleted = deleted.len(),
            "Consumed sync-collection delta"
        );
        Ok(ChangeSet {
            changed,
            deleted_native_ids: deleted,
            next_token,
            used_token: true,
            invalidated_token: None,
        })
    }

    /// CTag fallback: coarse change detection only. The result never claims
    /// token semantics because a CTag cannot enumerate deletions.
    async fn fetch_ctag_fallback(
        &self,
        calendar_id: &str,
        ctag_token: &str,
        window: TimeWindow,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        let previous = ctag_token.trim_start_matches(CTAG_TOKEN_PREFIX);
        let (_, bytes, _) = self
            .dav_request(
                "PROPFIND",
                calendar_id,
                Some("0"),
                Some(&xml::propfind_sync_token_body()),
            )
            .await?;
        let parsed = xml::parse_multistatus(&bytes)?;
        let current = parsed
            .responses
            .iter()
            .find_map(|r| r.ctag.clone().or_else(|| r.etag.clone()));

        match current {
            Some(current) if current != previous => {
                tracing::info!("Collection CTag moved, replaying window snapshot");
                let mut snapshot = self.fetch_snapshot(calendar_id, window, max_events).await?;
                snapshot.next_token = Some(format!("{CTAG_TOKEN_PREFIX}{current}"));
                Ok(snapshot)
            }
            Some(_) => Ok(ChangeSet {
                next_token: Some(ctag_token.to_string()),
                ..ChangeSet::default()
            }),
            None => Err(AdapterError::TokenInvalidated(
                "collection no longer reports a CTag".into(),
            )),
        }
    }

    async fn get_resource(&self, href: &str) -> AdapterResult<(String, Option<String>)> {
        let url = self.resolve(href).await?;
        let (_, bytes, etag) = self.dav_request("GET", &url, None, None).await?;
        Ok((String::from_utf8_lossy(&bytes).into_owned(), etag))
    }

    async fn put_resource(
        &self,
        href: &str,
        ics: &str,
        if_none_match: bool,
    ) -> AdapterResult<Option<String>> {
        let url = self.resolve(href).await?;
        self.retry
            .run(|| async {
                let _permit = self.limiter.acquire().await?;
                let mut request = self
                    .client
                    .put(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .header("Content-Type", "text/calendar; charset=utf-8")
                    .body(ics.to_string());
                if if_none_match {
                    request = request.header("If-None-Match", "*");
                }
                let response = request.send().await?;
                let status = response.status();
                let etag = response
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                if status.is_success() {
                    return Ok(etag);
                }
                let body = response.bytes().await?.to_vec();
                Err(Self::error_for(status, &body))
            })
            .await
    }

    /// ## Summary
    /// Deletes a resource directly by href, bypassing any UID lookup.
    ///
    /// ## Errors
    /// Returns `NotFound` when the href is already gone; other failures per
    /// the adapter taxonomy.
    pub async fn delete_resource_by_href(&self, href: &str) -> AdapterResult<()> {
        let url = self.resolve(href).await?;
        let (_, _, _) = self.dav_request("DELETE", &url, None, None).await?;
        Ok(())
    }

    /// ## Summary
    /// Fetches the master resource at `href`, appends an EXDATE for the
    /// cancelled occurrence, bumps SEQUENCE, and PUTs the resource back.
    ///
    /// ## Errors
    /// Returns `NotFound` for a missing resource and `Fatal` for a resource
    /// without a master VEVENT.
    pub async fn add_exdate(
        &self,
        href: &str,
        occurrence: DateTime<Utc>,
        all_day: bool,
    ) -> AdapterResult<()> {
        let (ics, _) = self.get_resource(href).await?;
        let mut calendar = ical::parse::parse_calendar(&ics)
            .map_err(|e| AdapterError::Fatal(format!("unparseable resource {href}: {e}")))?;
        add_exdate(&mut calendar, occurrence, all_day)
            .map_err(|e| AdapterError::Fatal(format!("no master VEVENT in {href}: {e}")))?;
        self.put_resource(href, &ical::build::serialize(&calendar), false)
            .await?;
        Ok(())
    }

    /// ## Summary
    /// Merges a recurrence exception into the master resource identified by
    /// `master_uid`: a cancellation becomes an EXDATE, a modification
    /// becomes an embedded VEVENT with RECURRENCE-ID. A second resource
    /// with the master's UID is never created; when no master exists the
    /// exception is demoted to a standalone create.
    ///
    /// ## Errors
    /// Propagates adapter failures from the lookup and write path.
    #[tracing::instrument(skip(self, exception), fields(master_uid))]
    pub async fn merge_recurrence_exception(
        &self,
        calendar_id: &str,
        master_uid: &str,
        exception: &Event,
    ) -> AdapterResult<Event> {
        let Some((href, ics)) = self.find_resource_by_uid(calendar_id, master_uid).await? else {
            tracing::warn!("Master resource not found, creating standalone event");
            let mut standalone = exception.clone();
            standalone.demote_to_standalone();
            return self.create_event(calendar_id, &standalone).await;
        };

        let original_start = exception.original_start();
        if exception.status == EventStatus::Cancelled {
            self.add_exdate(&href, original_start, exception.all_day)
                .await?;
            return self.get_event(calendar_id, &href).await;
        }

        let mut calendar = ical::parse::parse_calendar(&ics)
            .map_err(|e| AdapterError::Fatal(format!("unparseable resource {href}: {e}")))?;
        insert_recurrence_exception(&mut calendar, exception, master_uid, original_start)
            .map_err(|e| AdapterError::Fatal(format!("no master VEVENT in {href}: {e}")))?;
        self.put_resource(&href, &ical::build::serialize(&calendar), false)
            .await?;

        let mut merged = exception.clone();
        merged.source = EventSource::CalDav;
        merged.uid = master_uid.to_string();
        merged.native_id = instance_native_id(&href, original_start);
        Ok(merged)
    }

    async fn find_resource_by_uid(
        &self,
        calendar_id: &str,
        uid: &str,
    ) -> AdapterResult<Option<(String, String)>> {
        let origin = self.discovered().await?.origin.clone();
        let body = xml::calendar_query_uid_body(uid);
        let (_, bytes, _) = self
            .dav_request("REPORT", calendar_id, Some("1"), Some(&body))
            .await?;
        let parsed = xml::parse_multistatus(&bytes)?;
        Ok(parsed.responses.into_iter().find_map(|r| {
            let data = r.calendar_data?;
            let calendar = ical::parse::parse_calendar(&data).ok()?;
            let vevent = parse_first_vevent(&calendar).ok()?;
            let matches = vevent
                .get_property("UID")
                .is_some_and(|p| p.value == uid);
            matches.then(|| (resolve_href(&origin, &r.href), data))
        }))
    }
}

impl CalendarAdapter for CalDavAdapter {
    fn source(&self) -> EventSource {
        EventSource::CalDav
    }

    async fn list_calendars(&self) -> AdapterResult<Vec<CalendarInfo>> {
        let discovered = self.discovered().await?;
        let (_, bytes, _) = self
            .dav_request(
                "PROPFIND",
                &discovered.calendar_home,
                Some("1"),
                Some(&xml::propfind_calendars_body()),
            )
            .await?;
        let parsed = xml::parse_multistatus(&bytes)?;

        let mut calendars = Vec::new();
        for (index, response) in parsed
            .responses
            .iter()
            .filter(|r| r.is_calendar && !r.href.is_empty())
            .enumerate()
        {
            calendars.push(CalendarInfo {
                id: resolve_href(&discovered.origin, &response.href),
                name: response
                    .display_name
                    .clone()
                    .unwrap_or_else(|| format!("Calendar {}", index + 1)),
                source: EventSource::CalDav,
                description: None,
                timezone: "UTC".to_string(),
                color: None,
                access_role: None,
                is_primary: index == 0,
            });
        }
        Ok(calendars)
    }

    #[tracing::instrument(skip(self))]
    async fn get_sync_token(&self, calendar_id: &str) -> AdapterResult<String> {
        // 1. PROPFIND for DAV:sync-token
        let propfind = self
            .dav_request(
                "PROPFIND",
                calendar_id,
                Some("0"),
                Some(&xml::propfind_sync_token_body()),
            )
            .await;
        let ctag = match propfind {
            Ok((_, bytes, _)) => {
                let parsed = xml::parse_multistatus(&bytes)?;
                if let Some(token) = parsed.any_sync_token() {
                    tracing::debug!("Sync token acquired via PROPFIND");
                    return Ok(token.to_string());
                }
                parsed
                    .responses
                    .iter()
                    .find_map(|r| r.ctag.clone().or_else(|| r.etag.clone()))
            }
            Err(err) => {
                tracing::warn!(error = %err, "PROPFIND sync-token failed");
                None
            }
        };

        // 2. Initial sync-collection REPORT
        match self
            .dav_request(
                "REPORT",
                calendar_id,
                Some("1"),
                Some(&xml::sync_collection_body(None)),
            )
            .await
        {
            Ok((_, bytes, _)) => {
                let parsed = xml::parse_multistatus(&bytes)?;
                if let Some(token) = parsed.any_sync_token() {
                    tracing::debug!("Sync token acquired via initial sync-collection");
                    return Ok(token.to_string());
                }
            }
            Err(err) => tracing::warn!(error = %err, "Initial sync-collection failed"),
        }

        // 3. CTag fallback, explicitly marked so comparison semantics stay
        // coarse downstream
        ctag.map(|c| format!("{CTAG_TOKEN_PREFIX}{c}")).ok_or_else(|| {
            AdapterError::Fatal(format!(
                "no sync token source available for calendar {calendar_id}"
            ))
        })
    }

    async fn get_change_set(
        &self,
        calendar_id: &str,
        since_token: Option<&str>,
        window: TimeWindow,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        match since_token {
            Some(token) if token.starts_with(CTAG_TOKEN_PREFIX) => {
                self.fetch_ctag_fallback(calendar_id, token, window, max_events)
                    .await
            }
            Some(token) => {
                match self
                    .fetch_sync_collection(calendar_id, token, max_events)
                    .await
                {
                    Ok(change_set) => Ok(change_set),
                    Err(AdapterError::TokenInvalidated(reason)) => {
                        tracing::warn!(%reason, "Sync token rejected, downgrading to snapshot");
                        let mut snapshot =
                            self.fetch_snapshot(calendar_id, window, max_events).await?;
                        snapshot.invalidated_token = Some(token.to_string());
                        Ok(snapshot)
                    }
                    Err(err) => Err(err),
                }
            }
            None => self.fetch_snapshot(calendar_id, window, max_events).await,
        }
    }

    async fn get_event(&self, _calendar_id: &str, native_id: &str) -> AdapterResult<Event> {
        let (href, instance) = split_instance(native_id);
        let url = self.resolve(href).await?;
        let (ics, etag) = self.get_resource(&url).await?;
        let calendar = ical::parse::parse_calendar(&ics)
            .map_err(|e| AdapterError::Fatal(format!("unparseable resource {href}: {e}")))?;

        if let Some(instant) = instance {
            for vevent in calendar.children_named("VEVENT") {
                let event = vevent_to_event(vevent, &url, etag.as_deref())
                    .map_err(|e| AdapterError::Fatal(e.to_string()))?;
                if event.recurrence_id() == Some(instant) {
                    let mut event = event;
                    event.native_id = native_id.to_string();
                    return Ok(event);
                }
            }
            return Err(AdapterError::NotFound(format!(
                "no override at {instant} in {href}"
            )));
        }

        let vevent = parse_first_vevent(&calendar)
            .map_err(|e| AdapterError::Fatal(format!("no VEVENT in {href}: {e}")))?;
        vevent_to_event(vevent, &url, etag.as_deref())
            .map_err(|e| AdapterError::Fatal(e.to_string()))
    }

    #[tracing::instrument(skip(self, event), fields(uid = %event.uid))]
    async fn create_event(&self, calendar_id: &str, event: &Event) -> AdapterResult<Event> {
        let filename = sanitize_filename(&event.uid);
        let href = format!("{}/{filename}.ics", calendar_id.trim_end_matches('/'));
        let ics = ical::build::serialize(&build_vcalendar(event));

        let etag = match self.put_resource(&href, &ics, true).await {
            Ok(etag) => etag,
            // If-None-Match tripped: a prior attempt landed this resource
            Err(AdapterError::Conflict(_)) => {
                return self.get_event(calendar_id, &href).await;
            }
            Err(err) => return Err(err),
        };

        let mut created = event.clone();
        created.source = EventSource::CalDav;
        created.native_id = self.resolve(&href).await?;
        created.etag = etag;
        Ok(created)
    }

    async fn update_event(
        &self,
        _calendar_id: &str,
        native_id: &str,
        event: &Event,
    ) -> AdapterResult<Event> {
        let (href, instance) = split_instance(native_id);
        let mut updated = event.clone();
        updated.source = EventSource::CalDav;
        updated.native_id = native_id.to_string();

        // An embedded exception is rewritten inside the master's resource;
        // replacing the whole resource would drop the master
        if let Some(instant) = instance {
            let (ics, _) = self.get_resource(href).await?;
            let mut calendar = ical::parse::parse_calendar(&ics)
                .map_err(|e| AdapterError::Fatal(format!("unparseable resource {href}: {e}")))?;
            let master_uid = parse_first_vevent(&calendar)
                .ok()
                .and_then(|v| v.get_property("UID").map(|p| p.value.clone()))
                .unwrap_or_else(|| event.uid.clone());
            insert_recurrence_exception(&mut calendar, event, &master_uid, instant)
                .map_err(|e| AdapterError::Fatal(format!("no master VEVENT in {href}: {e}")))?;
            updated.etag = self
                .put_resource(href, &ical::build::serialize(&calendar), false)
                .await?;
            updated.uid = master_uid;
            return Ok(updated);
        }

        let ics = ical::build::serialize(&build_vcalendar(&updated));
        updated.etag = self.put_resource(href, &ics, false).await?;
        Ok(updated)
    }

    async fn delete_event(&self, _calendar_id: &str, native_id: &str) -> AdapterResult<()> {
        let (href, instance) = split_instance(native_id);
        if let Some(instant) = instance {
            // Deleting an override means removing the exception VEVENT from
            // the master resource, not deleting the resource
            let (ics, _) = self.get_resource(href).await?;
            let mut calendar = ical::parse::parse_calendar(&ics)
                .map_err(|e| AdapterError::Fatal(format!("unparseable resource {href}: {e}")))?;
            let marker = calbridge_rfc::ical::datetime::format_utc(instant);
            calendar.children.retain(|c| {
                c.name != "VEVENT"
                    || c.get_property("RECURRENCE-ID")
                        .is_none_or(|p| p.value != marker)
            });
            self.put_resource(href, &ical::build::serialize(&calendar), false)
                .await?;
            return Ok(());
        }
        self.delete_resource_by_href(href).await
    }

    async fn apply_recurrence_override(
        &self,
        calendar_id: &str,
        _master_native_id: Option<&str>,
        master_uid: &str,
        event: &Event,
    ) -> AdapterResult<Event> {
        self.merge_recurrence_exception(calendar_id, master_uid, event)
            .await
    }

    async fn find_instance(
        &self,
        calendar_id: &str,
        master_native_id: &str,
        occurrence_start: DateTime<Utc>,
    ) -> AdapterResult<Option<Event>> {
        let master = self.get_event(calendar_id, master_native_id).await?;
        let (href, _) = split_instance(master_native_id);

        // An explicit exception for the occurrence wins
        let instance_id = instance_native_id(href, occurrence_start);
        match self.get_event(calendar_id, &instance_id).await {
            Ok(event) => return Ok(Some(event)),
            Err(AdapterError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let Some(rrule) = &master.rrule else {
            return Ok(None);
        };
        if !occurs_at(rrule, master.start, occurrence_start) {
            return Ok(None);
        }

        let mut instance = master.clone();
        let duration = master.end - master.start;
        instance.start = occurrence_start;
        instance.end = occurrence_start + duration;
        instance.rrule = None;
        instance.overrides = vec![calbridge_core::event::RecurrenceOverride::RecurrenceId {
            instant: occurrence_start,
            original_start: Some(occurrence_start),
        }];
        instance.native_id = instance_id;
        Ok(Some(instance))
    }
}

/// Whether `occurrence` is produced by `rrule` anchored at `dtstart`
fn occurs_at(rrule: &str, dtstart: DateTime<Utc>, occurrence: DateTime<Utc>) -> bool {
    use rrule::{RRule, Tz, Unvalidated};

    let Ok(unvalidated) = rrule.parse::<RRule<Unvalidated>>() else {
        return false;
    };
    let Ok(set) = unvalidated.build(dtstart.with_timezone(&Tz::UTC)) else {
        return false;
    };
    set.all(1000)
        .dates
        .iter()
        .any(|d| d.with_timezone(&Utc) == occurrence)
}

fn origin_of(url: &str) -> AdapterResult<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| AdapterError::Fatal(format!("unsupported URL: {url}")))?;
    let scheme_len = url.len() - rest.len();
    let host_end = rest.find('/').unwrap_or(rest.len());
    Ok(format!("{}{}", &url[..scheme_len], &rest[..host_end]))
}

fn resolve_href(origin: &str, href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{}/{}", origin.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

fn split_instance(native_id: &str) -> (&str, Option<DateTime<Utc>>) {
    match native_id.split_once(INSTANCE_SEP) {
        Some((href, fragment)) => {
            let instant = calbridge_rfc::ical::IcalTime::parse(fragment, None)
                .ok()
                .and_then(|t| t.to_utc().ok());
            (href, instant)
        }
        None => (native_id, None),
    }
}

fn instance_native_id(href: &str, occurrence: DateTime<Utc>) -> String {
    format!(
        "{href}{INSTANCE_SEP}{}",
        calbridge_rfc::ical::datetime::format_utc(occurrence)
    )
}

/// Builds one canonical event per VEVENT in a resource: the master (or a
/// standalone event) under the plain href, exceptions under
/// `href#<occurrence>`.
fn events_from_resource(
    ics: &str,
    href: &str,
    etag: Option<&str>,
) -> Result<Vec<Event>, calbridge_rfc::error::RfcError> {
    let calendar = ical::parse::parse_calendar(ics)?;
    let mut events = Vec::new();
    for vevent in calendar.children_named("VEVENT") {
        let mut event = vevent_to_event(vevent, href, etag)?;
        if let Some(instant) = event.recurrence_id() {
            event.native_id = instance_native_id(href, instant);
        }
        events.push(event);
    }
    Ok(events)
}

fn sanitize_filename(uid: &str) -> String {
    uid.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '@' => c,
            _ => '-',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn origin_extraction() {
        assert_eq!(
            origin_of("https://p65-caldav.icloud.com/principal/1/").unwrap(),
            "https://p65-caldav.icloud.com"
        );
        assert!(origin_of("ftp://nope").is_err());
    }

    #[test]
    fn href_resolution() {
        assert_eq!(
            resolve_href("https://host.example.com", "/cal/1/"),
            "https://host.example.com/cal/1/"
        );
        assert_eq!(
            resolve_href("https://host.example.com", "https://other/x"),
            "https://other/x"
        );
    }

    #[test]
    fn instance_ids_round_trip() {
        let occurrence = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
        let native = instance_native_id("/cal/evt.ics", occurrence);
        let (href, instant) = split_instance(&native);
        assert_eq!(href, "/cal/evt.ics");
        assert_eq!(instant, Some(occurrence));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(
            sanitize_filename("uid with/slash@example.com"),
            "uid-with-slash@example.com"
        );
    }

    #[test]
    fn resource_with_exceptions_yields_multiple_events() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:u1\r\nDTSTART:20260302T090000Z\r\nDTEND:20260302T093000Z\r\nRRULE:FREQ=WEEKLY\r\nSUMMARY:Master\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:u1\r\nRECURRENCE-ID:20260309T090000Z\r\nDTSTART:20260309T100000Z\r\nDTEND:20260309T103000Z\r\nSUMMARY:Moved\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let events = events_from_resource(ics, "/cal/u1.ics", None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].native_id, "/cal/u1.ics");
        assert!(events[1].native_id.starts_with("/cal/u1.ics#"));
        assert!(events[1].is_recurrence_override());
    }

    #[test]
    fn rrule_occurrence_check() {
        let dtstart = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let on_rule = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
        let off_rule = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        assert!(occurs_at("FREQ=WEEKLY;COUNT=10", dtstart, on_rule));
        assert!(!occurs_at("FREQ=WEEKLY;COUNT=10", dtstart, off_rule));
    }
}
