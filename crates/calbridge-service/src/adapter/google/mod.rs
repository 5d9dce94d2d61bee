//! Token-API adapter (Google Calendar class).
//!
//! Identity: `native_id` is the server event id; `uid` is the iCal UID when
//! the API provides one. Creation uses a deterministic client-supplied id
//! derived from the canonical UID. Incremental calls ride the opaque
//! `nextSyncToken`; a 410 on a token downgrades the pass to a window
//! snapshot and reports the token as invalidated.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use calbridge_core::constants::{GOOGLE_API_BASE_URL, GOOGLE_PAGE_SIZE, GOOGLE_SYNC_PAGE_SIZE};
use calbridge_core::event::Event;
use calbridge_core::types::{CalendarInfo, ChangeSet, EventSource};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::de::DeserializeOwned;

use crate::adapter::{CalendarAdapter, TimeWindow};
use crate::error::{AdapterError, AdapterResult};
use crate::retry::{RateLimiter, RetryPolicy};

pub mod ids;
pub mod wire;

pub use ids::derive_event_id;

use wire::{CalendarListPage, EventsPage, WireEvent, event_body};

#[derive(Debug, serde::Deserialize)]
struct StoredToken {
    #[serde(alias = "access_token")]
    token: String,
}

pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl GoogleAdapter {
    /// ## Summary
    /// Builds the adapter from a persisted OAuth token file. The OAuth flow
    /// itself is external; only the bearer token is consumed here.
    ///
    /// ## Errors
    /// Returns `AuthFailure` when the token file is missing or unreadable.
    pub fn from_token_file(token_path: &Path, retry: RetryPolicy) -> AdapterResult<Self> {
        let contents = std::fs::read_to_string(token_path).map_err(|e| {
            AdapterError::AuthFailure(format!(
                "cannot read Google token file {}: {e}",
                token_path.display()
            ))
        })?;
        let stored: StoredToken = serde_json::from_str(&contents).map_err(|e| {
            AdapterError::AuthFailure(format!("malformed Google token file: {e}"))
        })?;
        Self::new(stored.token, GOOGLE_API_BASE_URL.to_string(), retry)
    }

    /// ## Summary
    /// Builds the adapter from a raw bearer token and base URL. Tests point
    /// the base URL at a local fixture server.
    ///
    /// ## Errors
    /// Returns `Fatal` when the HTTP client cannot be constructed.
    pub fn new(access_token: String, base_url: String, retry: RetryPolicy) -> AdapterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AdapterError::Fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            access_token,
            limiter: RateLimiter::new(4),
            retry,
        })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!("{}/calendars/{}/events", self.base_url, urlencode(calendar_id))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> AdapterResult<T> {
        self.retry
            .run(|| async {
                let _permit = self.limiter.acquire().await?;
                let response = self
                    .client
                    .get(url)
                    .bearer_auth(&self.access_token)
                    .query(query)
                    .send()
                    .await?;
                Self::decode(response).await
            })
            .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &serde_json::Value,
    ) -> AdapterResult<T> {
        self.retry
            .run(|| async {
                let _permit = self.limiter.acquire().await?;
                let response = self
                    .client
                    .request(method.clone(), url)
                    .bearer_auth(&self.access_token)
                    .json(body)
                    .send()
                    .await?;
                Self::decode(response).await
            })
            .await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AdapterResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| AdapterError::Fatal(format!("malformed API response: {e}")));
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::error_for(status, &body))
    }

    fn error_for(status: reqwest::StatusCode, body: &str) -> AdapterError {
        match status.as_u16() {
            401 => AdapterError::AuthFailure(format!("401: {body}")),
            403 if body.contains("ateLimitExceeded") => {
                AdapterError::RateLimited(format!("403: {body}"))
            }
            403 => AdapterError::AuthFailure(format!("403: {body}")),
            404 => AdapterError::NotFound(format!("404: {body}")),
            409 => AdapterError::Conflict(format!("409: {body}")),
            410 => AdapterError::TokenInvalidated(format!("410: {body}")),
            429 => AdapterError::RateLimited(format!("429: {body}")),
            500..=599 => AdapterError::Transient(format!("{status}: {body}")),
            _ => AdapterError::Fatal(format!("{status}: {body}")),
        }
    }

    #[tracing::instrument(skip(self), fields(calendar_id))]
    async fn fetch_delta(
        &self,
        calendar_id: &str,
        since_token: &str,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        let url = self.events_url(calendar_id);
        let mut changed: HashMap<String, Event> = HashMap::new();
        let mut deleted: HashSet<String> = HashSet::new();
        let mut next_token = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("syncToken".to_string(), since_token.to_string()),
                ("showDeleted".to_string(), "true".to_string()),
                ("singleEvents".to_string(), "true".to_string()),
                ("maxResults".to_string(), GOOGLE_SYNC_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }
            let page: EventsPage = self.get_json(&url, &query).await?;

            for item in page.items {
                accumulate(item, &mut changed, &mut deleted, max_events);
            }
            next_token = page.next_sync_token.or(next_token);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        tracing::debug!(
            changed = changed.len(),
            deleted = deleted.len(),
            "Consumed sync token delta"
        );
        Ok(ChangeSet {
            changed,
            deleted_native_ids: deleted,
            next_token,
            used_token: true,
            invalidated_token: None,
        })
    }

    #[tracing::instrument(skip(self), fields(calendar_id))]
    async fn fetch_snapshot(
        &self,
        calendar_id: &str,
        window: TimeWindow,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        let url = self.events_url(calendar_id);
        let mut changed: HashMap<String, Event> = HashMap::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                (
                    "timeMin".to_string(),
                    window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                (
                    "timeMax".to_string(),
                    window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                ("singleEvents".to_string(), "true".to_string()),
                ("orderBy".to_string(), "startTime".to_string()),
                ("maxResults".to_string(), GOOGLE_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }
            let page: EventsPage = self.get_json(&url, &query).await?;

            for item in page.items {
                if item.is_cancelled() {
                    // Snapshots cannot distinguish a deletion from a window
                    // miss, so cancelled rows are dropped here
                    continue;
                }
                if changed.len() >= max_events {
                    break;
                }
                match item.into_event() {
                    Ok(event) => {
                        changed.insert(event.native_id.clone(), event);
                    }
                    Err(err) => tracing::warn!(error = %err, "Skipping unparseable event"),
                }
            }
            page_token = page.next_page_token;
            if page_token.is_none() || changed.len() >= max_events {
                break;
            }
        }

        Ok(ChangeSet::snapshot(changed, None))
    }
}

fn accumulate(
    item: WireEvent,
    changed: &mut HashMap<String, Event>,
    deleted: &mut HashSet<String>,
    max_events: usize,
) {
    if item.is_cancelled() && item.recurring_event_id.is_none() {
        deleted.insert(item.id);
        return;
    }
    if changed.len() >= max_events {
        return;
    }
    // Cancelled instances of a recurring master stay in the changed set so
    // the engine can merge them as EXDATEs on the other side
    match item.into_event() {
        Ok(event) => {
            changed.insert(event.native_id.clone(), event);
        }
        Err(err) => tracing::warn!(error = %err, "Skipping unparseable event"),
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

impl CalendarAdapter for GoogleAdapter {
    fn source(&self) -> EventSource {
        EventSource::Google
    }

    async fn list_calendars(&self) -> AdapterResult<Vec<CalendarInfo>> {
        let url = format!("{}/users/me/calendarList", self.base_url);
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = Vec::new();
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }
            let page: CalendarListPage = self.get_json(&url, &query).await?;
            calendars.extend(
                page.items
                    .into_iter()
                    .map(wire::CalendarListEntry::into_calendar_info),
            );
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(calendars)
    }

    #[tracing::instrument(skip(self))]
    async fn get_sync_token(&self, calendar_id: &str) -> AdapterResult<String> {
        let url = self.events_url(calendar_id);
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let mut query = vec![
                ("maxResults".to_string(), GOOGLE_PAGE_SIZE.to_string()),
                ("singleEvents".to_string(), "true".to_string()),
                ("showDeleted".to_string(), "true".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }
            let page: EventsPage = self.get_json(&url, &query).await?;
            pages += 1;
            page_token = page.next_page_token;

            // The token only appears on the terminal page of a full listing
            if page_token.is_none() {
                return page.next_sync_token.map_or_else(
                    || {
                        Err(AdapterError::Fatal(format!(
                            "no sync token after {pages} pages for calendar {calendar_id}"
                        )))
                    },
                    |token| {
                        tracing::debug!(pages, "Acquired sync token");
                        Ok(token)
                    },
                );
            }
        }
    }

    async fn get_change_set(
        &self,
        calendar_id: &str,
        since_token: Option<&str>,
        window: TimeWindow,
        max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        match since_token {
            Some(token) => match self.fetch_delta(calendar_id, token, max_events).await {
                Ok(change_set) => Ok(change_set),
                Err(AdapterError::TokenInvalidated(reason)) => {
                    tracing::warn!(%reason, "Sync token rejected, downgrading to snapshot");
                    let mut snapshot = self.fetch_snapshot(calendar_id, window, max_events).await?;
                    snapshot.invalidated_token = Some(token.to_string());
                    Ok(snapshot)
                }
                Err(err) => Err(err),
            },
            None => self.fetch_snapshot(calendar_id, window, max_events).await,
        }
    }

    async fn get_event(&self, calendar_id: &str, native_id: &str) -> AdapterResult<Event> {
        let url = format!("{}/{}", self.events_url(calendar_id), urlencode(native_id));
        let wire: WireEvent = self.get_json(&url, &[]).await?;
        wire.into_event()
    }

    async fn create_event(&self, calendar_id: &str, event: &Event) -> AdapterResult<Event> {
        let url = self.events_url(calendar_id);
        let body = event_body(event, true);
        match self
            .send_json::<WireEvent>(reqwest::Method::POST, &url, &body)
            .await
        {
            Ok(wire) => wire.into_event(),
            // The deterministic id already exists: a prior attempt landed.
            // Fetch it so the caller sees the surviving copy.
            Err(AdapterError::Conflict(_)) if !event.uid.is_empty() => {
                let existing_id = derive_event_id(&event.uid);
                self.get_event(calendar_id, &existing_id).await
            }
            Err(err) => Err(err),
        }
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        native_id: &str,
        event: &Event,
    ) -> AdapterResult<Event> {
        let url = format!("{}/{}", self.events_url(calendar_id), urlencode(native_id));
        let body = event_body(event, false);
        let wire: WireEvent = self
            .send_json(reqwest::Method::PUT, &url, &body)
            .await?;
        wire.into_event()
    }

    async fn delete_event(&self, calendar_id: &str, native_id: &str) -> AdapterResult<()> {
        let url = format!("{}/{}", self.events_url(calendar_id), urlencode(native_id));
        self.retry
            .run(|| async {
                let _permit = self.limiter.acquire().await?;
                let response = self
                    .client
                    .delete(&url)
                    .bearer_auth(&self.access_token)
                    .send()
                    .await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let body = response.text().await.unwrap_or_default();
                // 410 on a delete means the event is already gone, not a
                // rejected sync token
                if status.as_u16() == 410 {
                    return Err(AdapterError::NotFound(format!("410: {body}")));
                }
                Err(Self::error_for(status, &body))
            })
            .await
    }

    #[tracing::instrument(skip(self, event), fields(master_uid))]
    async fn apply_recurrence_override(
        &self,
        calendar_id: &str,
        master_native_id: Option<&str>,
        master_uid: &str,
        event: &Event,
    ) -> AdapterResult<Event> {
        if let Some(master_id) = master_native_id {
            if let Some(instance) = self
                .find_instance(calendar_id, master_id, event.original_start())
                .await?
            {
                if event.status == calbridge_core::event::EventStatus::Cancelled {
                    self.delete_event(calendar_id, &instance.native_id).await?;
                    return Ok(instance);
                }
                return self
                    .update_event(calendar_id, &instance.native_id, event)
                    .await;
            }
            tracing::warn!("No instance matches the override, creating standalone event");
        }
        let mut standalone = event.clone();
        standalone.demote_to_standalone();
        self.create_event(calendar_id, &standalone).await
    }

    async fn find_instance(
        &self,
        calendar_id: &str,
        master_native_id: &str,
        occurrence_start: DateTime<Utc>,
    ) -> AdapterResult<Option<Event>> {
        let url = format!(
            "{}/{}/instances",
            self.events_url(calendar_id),
            urlencode(master_native_id)
        );
        let slack = TimeDelta::minutes(5);
        let query = vec![
            (
                "timeMin".to_string(),
                (occurrence_start - slack).to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (
                "timeMax".to_string(),
                (occurrence_start + slack).to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("maxResults".to_string(), "50".to_string()),
            ("showDeleted".to_string(), "true".to_string()),
        ];
        let page: EventsPage = match self.get_json(&url, &query).await {
            Ok(page) => page,
            Err(AdapterError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        for item in page.items {
            let original = item
                .original_start_time
                .as_ref()
                .and_then(wire::WireEventTime::instant);
            if original == Some(occurrence_start) {
                return item.into_event().map(Some);
            }
        }
        Ok(None)
    }
}
