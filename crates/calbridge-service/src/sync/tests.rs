//! Engine scenarios driven by fake adapters and an in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use calbridge_core::event::{Event, EventStatus, RecurrenceOverride};
use calbridge_core::types::{CalendarInfo, ChangeSet, EventSource};
use calbridge_db::db::enums::{MappingStatus, SessionStatus};
use calbridge_db::db::query::audit::SessionCounters;
use calbridge_db::model::mapping::EventMapping;
use calbridge_db::model::pair::CalendarPair;
use calbridge_db::model::session::SyncSession;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use uuid::Uuid;

use crate::adapter::{CalendarAdapter, TimeWindow};
use crate::adapter::google::derive_event_id;
use crate::error::{AdapterError, AdapterResult, ServiceResult};
use crate::store::{
    ConflictRecord, MappingDraft, MappingRefresh, OperationRecord, PairDraft, SideRebind,
    SyncStore,
};
use crate::sync::engine::{EngineOptions, SyncEngine};

const GOOGLE_CAL: &str = "primary";
const CALDAV_CAL: &str = "https://cal.example.com/home/work/";

fn t(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
}

fn base_event(source: EventSource, native_id: &str, uid: &str, summary: &str) -> Event {
    Event {
        uid: uid.to_string(),
        native_id: native_id.to_string(),
        source,
        summary: summary.to_string(),
        description: None,
        location: None,
        start: t(9, 0),
        end: t(10, 0),
        all_day: false,
        timezone: None,
        created: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        updated: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
        etag: Some("\"e0\"".to_string()),
        sequence: 0,
        status: EventStatus::Confirmed,
        rrule: None,
        overrides: Vec::new(),
        master_native_id: None,
        organizer: None,
        attendees: Vec::new(),
        raw: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Upsert,
    Delete,
}

#[derive(Default)]
struct FakeState {
    events: HashMap<String, Event>,
    change_log: Vec<(u64, ChangeKind, String)>,
    version: u64,
    /// Simulates a window miss: events listed nowhere in snapshots
    hidden_from_snapshot: HashSet<String>,
    /// All offered tokens are rejected while set
    reject_tokens: bool,
    /// `get_sync_token` fails while set
    token_acquisition_fails: bool,
}

/// In-memory calendar service honoring the adapter contract, including the
/// token delta semantics
#[derive(Clone)]
struct FakeAdapter {
    source: EventSource,
    state: Arc<Mutex<FakeState>>,
}

impl FakeAdapter {
    fn new(source: EventSource) -> Self {
        Self {
            source,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    fn seed(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        state.events.insert(event.native_id.clone(), event);
    }

    fn set_token_acquisition_fails(&self, fails: bool) {
        self.state.lock().unwrap().token_acquisition_fails = fails;
    }

    fn hide_from_snapshot(&self, native_id: &str) {
        self.state
            .lock()
            .unwrap()
            .hidden_from_snapshot
            .insert(native_id.to_string());
    }

    fn remote_delete(&self, native_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.events.remove(native_id);
        state.version += 1;
        let version = state.version;
        state
            .change_log
            .push((version, ChangeKind::Delete, native_id.to_string()));
    }

    fn remote_upsert(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let version = state.version;
        state
            .change_log
            .push((version, ChangeKind::Upsert, event.native_id.clone()));
        state.events.insert(event.native_id.clone(), event);
    }

    fn event(&self, native_id: &str) -> Option<Event> {
        self.state.lock().unwrap().events.get(native_id).cloned()
    }

    fn events_with_uid(&self, uid: &str) -> Vec<Event> {
        self.state
            .lock()
            .unwrap()
            .events
            .values()
            .filter(|e| e.uid == uid)
            .cloned()
            .collect()
    }

    fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    fn native_id_for(&self, event: &Event) -> String {
        match self.source {
            EventSource::Google => derive_event_id(&event.uid),
            EventSource::CalDav => format!(
                "https://cal.example.com/home/work/{}.ics",
                event.uid.replace(['/', ':'], "-")
            ),
        }
    }
}

impl CalendarAdapter for FakeAdapter {
    fn source(&self) -> EventSource {
        self.source
    }

    async fn list_calendars(&self) -> AdapterResult<Vec<CalendarInfo>> {
        let id = match self.source {
            EventSource::Google => GOOGLE_CAL,
            EventSource::CalDav => CALDAV_CAL,
        };
        Ok(vec![CalendarInfo {
            id: id.to_string(),
            name: "Work".to_string(),
            source: self.source,
            description: None,
            timezone: "UTC".to_string(),
            color: None,
            access_role: None,
            is_primary: true,
        }])
    }

    async fn get_sync_token(&self, _calendar_id: &str) -> AdapterResult<String> {
        let state = self.state.lock().unwrap();
        if state.token_acquisition_fails {
            return Err(AdapterError::Transient("token endpoint down".into()));
        }
        Ok(format!("tok-{}", state.version))
    }

    async fn get_change_set(
        &self,
        _calendar_id: &str,
        since_token: Option<&str>,
        _window: TimeWindow,
        _max_events: usize,
    ) -> AdapterResult<ChangeSet> {
        let state = self.state.lock().unwrap();
        match since_token {
            Some(token) => {
                let since: Option<u64> = (!state.reject_tokens)
                    .then(|| token.strip_prefix("tok-").and_then(|n| n.parse().ok()))
                    .flatten();
                let Some(since) = since else {
                    // Contract: rejected token becomes a snapshot with the
                    // invalidated token reported
                    let changed = state
                        .events
                        .iter()
                        .filter(|(id, _)| !state.hidden_from_snapshot.contains(*id))
                        .map(|(id, e)| (id.clone(), e.clone()))
                        .collect();
                    let mut snapshot = ChangeSet::snapshot(changed, None);
                    snapshot.invalidated_token = Some(token.to_string());
                    return Ok(snapshot);
                };

                let mut changed = HashMap::new();
                let mut deleted = HashSet::new();
                for (version, kind, native_id) in &state.change_log {
                    if *version <= since {
                        continue;
                    }
                    match kind {
                        ChangeKind::Upsert => {
                            if let Some(event) = state.events.get(native_id) {
                                changed.insert(native_id.clone(), event.clone());
                            }
                        }
                        ChangeKind::Delete => {
                            deleted.insert(native_id.clone());
                        }
                    }
                }
                deleted.retain(|id| !changed.contains_key(id));
                Ok(ChangeSet {
                    changed,
                    deleted_native_ids: deleted,
                    next_token: Some(format!("tok-{}", state.version)),
                    used_token: true,
                    invalidated_token: None,
                })
            }
            None => {
                let changed = state
                    .events
                    .iter()
                    .filter(|(id, _)| !state.hidden_from_snapshot.contains(*id))
                    .map(|(id, e)| (id.clone(), e.clone()))
                    .collect();
                Ok(ChangeSet::snapshot(changed, None))
            }
        }
    }

    async fn get_event(&self, _calendar_id: &str, native_id: &str) -> AdapterResult<Event> {
        self.state
            .lock()
            .unwrap()
            .events
            .get(native_id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(native_id.to_string()))
    }

    async fn create_event(&self, _calendar_id: &str, event: &Event) -> AdapterResult<Event> {
        let native_id = self.native_id_for(event);
        {
            let state = self.state.lock().unwrap();
            if let Some(existing) = state.events.get(&native_id) {
                // Deterministic id collision: the prior attempt survives
                return Ok(existing.clone());
            }
        }
        let mut created = event.clone();
        created.source = self.source;
        created.native_id = native_id;
        created.etag = Some(format!("\"e{}\"", Uuid::new_v4().simple()));
        self.remote_upsert(created.clone());
        Ok(created)
    }

    async fn update_event(
        &self,
        _calendar_id: &str,
        native_id: &str,
        event: &Event,
    ) -> AdapterResult<Event> {
        if self.event(native_id).is_none() {
            return Err(AdapterError::NotFound(native_id.to_string()));
        }
        let mut updated = event.clone();
        updated.source = self.source;
        updated.native_id = native_id.to_string();
        updated.etag = Some(format!("\"e{}\"", Uuid::new_v4().simple()));
        self.remote_upsert(updated.clone());
        Ok(updated)
    }

    async fn delete_event(&self, _calendar_id: &str, native_id: &str) -> AdapterResult<()> {
        if self.event(native_id).is_none() {
            return Err(AdapterError::NotFound(native_id.to_string()));
        }
        self.remote_delete(native_id);
        Ok(())
    }

    async fn apply_recurrence_override(
        &self,
        calendar_id: &str,
        _master_native_id: Option<&str>,
        master_uid: &str,
        event: &Event,
    ) -> AdapterResult<Event> {
        let master = {
            let state = self.state.lock().unwrap();
            state
                .events
                .values()
                .find(|e| e.uid == master_uid && e.rrule.is_some())
                .cloned()
        };
        let Some(mut master) = master else {
            let mut standalone = event.clone();
            standalone.demote_to_standalone();
            return self.create_event(calendar_id, &standalone).await;
        };

        if event.status == EventStatus::Cancelled {
            master
                .overrides
                .push(RecurrenceOverride::ExDate {
                    dates: vec![event.original_start()],
                });
            master.sequence += 1;
            master.updated = Utc::now();
            self.remote_upsert(master.clone());
            return Ok(master);
        }

        let mut instance = event.clone();
        instance.source = self.source;
        instance.uid = master_uid.to_string();
        instance.native_id = format!(
            "{}#{}",
            master.native_id,
            event.original_start().format("%Y%m%dT%H%M%SZ")
        );
        master.sequence += 1;
        self.remote_upsert(master);
        self.remote_upsert(instance.clone());
        Ok(instance)
    }

    async fn find_instance(
        &self,
        _calendar_id: &str,
        master_native_id: &str,
        occurrence_start: DateTime<Utc>,
    ) -> AdapterResult<Option<Event>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .values()
            .find(|e| {
                e.master_native_id.as_deref() == Some(master_native_id)
                    && e.recurrence_id() == Some(occurrence_start)
            })
            .cloned())
    }
}

#[derive(Default)]
struct MemoryInner {
    pairs: Vec<CalendarPair>,
    mappings: Vec<EventMapping>,
    sessions: Vec<SyncSession>,
    operations: Vec<OperationRecord>,
    conflicts: Vec<ConflictRecord>,
}

#[derive(Clone, Default)]
struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    fn seed_pair(&self) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.inner.lock().unwrap().pairs.push(CalendarPair {
            id,
            google_calendar_id: GOOGLE_CAL.to_string(),
            caldav_calendar_id: CALDAV_CAL.to_string(),
            google_calendar_name: Some("Work".to_string()),
            caldav_calendar_name: Some("Work".to_string()),
            direction: "bidirectional".to_string(),
            enabled: true,
            conflict_policy: None,
            google_sync_token: None,
            caldav_sync_token: None,
            google_last_synced_at: None,
            caldav_last_synced_at: None,
            created_at: now,
            updated_at: now,
        });
        id
    }

    fn seed_mapping(
        &self,
        pair_id: Uuid,
        google_id: &str,
        caldav_id: &str,
        uid: &str,
        content_hash: &str,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.inner.lock().unwrap().mappings.push(EventMapping {
            id,
            pair_id,
            google_event_id: Some(google_id.to_string()),
            caldav_event_id: Some(caldav_id.to_string()),
            google_ical_uid: Some(uid.to_string()),
            caldav_uid: Some(uid.to_string()),
            canonical_uid: Some(uid.to_string()),
            caldav_resource_href: Some(caldav_id.split('#').next().unwrap().to_string()),
            google_self_link: None,
            google_etag: None,
            caldav_etag: None,
            google_sequence: 0,
            caldav_sequence: 0,
            content_hash: content_hash.to_string(),
            status: MappingStatus::Active,
            sync_direction: None,
            created_at: now,
            updated_at: now,
            last_synced_at,
        });
        id
    }

    fn pair(&self, pair_id: Uuid) -> CalendarPair {
        self.inner
            .lock()
            .unwrap()
            .pairs
            .iter()
            .find(|p| p.id == pair_id)
            .cloned()
            .unwrap()
    }

    fn mappings(&self) -> Vec<EventMapping> {
        self.inner.lock().unwrap().mappings.clone()
    }

    fn sessions(&self) -> Vec<SyncSession> {
        self.inner.lock().unwrap().sessions.clone()
    }

    fn operations(&self) -> Vec<OperationRecord> {
        self.inner.lock().unwrap().operations.clone()
    }

    fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.lock().unwrap().conflicts.clone()
    }
}

impl SyncStore for MemoryStore {
    async fn list_enabled_pairs(&self) -> ServiceResult<Vec<CalendarPair>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pairs
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect())
    }

    async fn find_pair(
        &self,
        google_calendar_id: &str,
        caldav_calendar_id: &str,
    ) -> ServiceResult<Option<CalendarPair>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pairs
            .iter()
            .find(|p| {
                p.google_calendar_id == google_calendar_id
                    && p.caldav_calendar_id == caldav_calendar_id
            })
            .cloned())
    }

    async fn insert_pair(&self, draft: PairDraft) -> ServiceResult<CalendarPair> {
        let now = Utc::now();
        let pair = CalendarPair {
            id: Uuid::new_v4(),
            google_calendar_id: draft.google_calendar_id,
            caldav_calendar_id: draft.caldav_calendar_id,
            google_calendar_name: draft.google_calendar_name,
            caldav_calendar_name: draft.caldav_calendar_name,
            direction: draft.direction.as_str().to_string(),
            enabled: draft.enabled,
            conflict_policy: draft.conflict_policy.map(|p| p.as_str().to_string()),
            google_sync_token: None,
            caldav_sync_token: None,
            google_last_synced_at: None,
            caldav_last_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().pairs.push(pair.clone());
        Ok(pair)
    }

    async fn update_pair_names(
        &self,
        pair_id: Uuid,
        google_name: Option<String>,
        caldav_name: Option<String>,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pair) = inner.pairs.iter_mut().find(|p| p.id == pair_id) {
            pair.google_calendar_name = google_name;
            pair.caldav_calendar_name = caldav_name;
        }
        Ok(())
    }

    async fn persist_tokens(
        &self,
        pair_id: Uuid,
        google_sync_token: Option<String>,
        caldav_sync_token: Option<String>,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pair) = inner.pairs.iter_mut().find(|p| p.id == pair_id) {
            pair.google_sync_token = google_sync_token;
            pair.caldav_sync_token = caldav_sync_token;
            let now = Utc::now();
            pair.google_last_synced_at = Some(now);
            pair.caldav_last_synced_at = Some(now);
            pair.updated_at = now;
        }
        Ok(())
    }

    async fn clear_google_token(&self, pair_id: Uuid) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pair) = inner.pairs.iter_mut().find(|p| p.id == pair_id) {
            pair.google_sync_token = None;
            pair.google_last_synced_at = None;
        }
        Ok(())
    }

    async fn clear_caldav_token(&self, pair_id: Uuid) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pair) = inner.pairs.iter_mut().find(|p| p.id == pair_id) {
            pair.caldav_sync_token = None;
            pair.caldav_last_synced_at = None;
        }
        Ok(())
    }

    async fn clear_tokens(&self, pair_id: Uuid) -> ServiceResult<()> {
        self.clear_google_token(pair_id).await?;
        self.clear_caldav_token(pair_id).await
    }

    async fn load_mappings(&self, pair_id: Uuid) -> ServiceResult<Vec<EventMapping>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .mappings
            .iter()
            .filter(|m| m.pair_id == pair_id)
            .cloned()
            .collect())
    }

    async fn find_mapping_by_native(
        &self,
        pair_id: Uuid,
        source: EventSource,
        native_id: &str,
    ) -> ServiceResult<Option<EventMapping>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .mappings
            .iter()
            .find(|m| m.pair_id == pair_id && m.native_id_for(source) == Some(native_id))
            .cloned())
    }

    async fn find_mapping_by_uid(
        &self,
        pair_id: Uuid,
        canonical_uid: &str,
    ) -> ServiceResult<Option<EventMapping>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .mappings
            .iter()
            .find(|m| m.pair_id == pair_id && m.canonical_uid.as_deref() == Some(canonical_uid))
            .cloned())
    }

    async fn insert_mapping(&self, draft: MappingDraft) -> ServiceResult<EventMapping> {
        let now = Utc::now();
        let mapping = EventMapping {
            id: Uuid::new_v4(),
            pair_id: draft.pair_id,
            google_event_id: draft.google_event_id,
            caldav_event_id: draft.caldav_event_id,
            google_ical_uid: draft.google_ical_uid,
            caldav_uid: draft.caldav_uid,
            canonical_uid: draft.canonical_uid,
            caldav_resource_href: draft.caldav_resource_href,
            google_self_link: draft.google_self_link,
            google_etag: draft.google_etag,
            caldav_etag: draft.caldav_etag,
            google_sequence: draft.google_sequence,
            caldav_sequence: draft.caldav_sequence,
            content_hash: draft.content_hash,
            status: MappingStatus::Active,
            sync_direction: draft.sync_direction,
            created_at: now,
            updated_at: now,
            last_synced_at: draft.last_synced_at,
        };
        self.inner.lock().unwrap().mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn refresh_mapping(
        &self,
        mapping_id: Uuid,
        refresh: MappingRefresh,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mapping) = inner.mappings.iter_mut().find(|m| m.id == mapping_id) {
            mapping.content_hash = refresh.content_hash;
            if refresh.google_etag.is_some() {
                mapping.google_etag = refresh.google_etag;
            }
            if refresh.caldav_etag.is_some() {
                mapping.caldav_etag = refresh.caldav_etag;
            }
            if let Some(sequence) = refresh.google_sequence {
                mapping.google_sequence = sequence;
            }
            if let Some(sequence) = refresh.caldav_sequence {
                mapping.caldav_sequence = sequence;
            }
            mapping.sync_direction = refresh.sync_direction;
            let now = Utc::now();
            mapping.last_synced_at = Some(now);
            mapping.updated_at = now;
        }
        Ok(())
    }

    async fn rebind_and_refresh(
        &self,
        mapping_id: Uuid,
        side: EventSource,
        rebind: SideRebind,
        refresh: MappingRefresh,
    ) -> ServiceResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(mapping) = inner.mappings.iter_mut().find(|m| m.id == mapping_id) {
                match side {
                    EventSource::Google => {
                        mapping.google_event_id = Some(rebind.native_id);
                        mapping.google_ical_uid = rebind.uid;
                        mapping.google_self_link = rebind.link;
                        mapping.google_etag = rebind.etag;
                        mapping.google_sequence = rebind.sequence;
                    }
                    EventSource::CalDav => {
                        mapping.caldav_event_id = Some(rebind.native_id);
                        mapping.caldav_uid = rebind.uid;
                        mapping.caldav_resource_href = rebind.link;
                        mapping.caldav_etag = rebind.etag;
                        mapping.caldav_sequence = rebind.sequence;
                    }
                }
            }
        }
        self.refresh_mapping(mapping_id, refresh).await
    }

    async fn set_mapping_status(
        &self,
        mapping_id: Uuid,
        status: MappingStatus,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mapping) = inner.mappings.iter_mut().find(|m| m.id == mapping_id) {
            mapping.status = status;
            mapping.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_session(&self, dry_run: bool) -> ServiceResult<SyncSession> {
        let session = SyncSession {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            dry_run,
            status: SessionStatus::Running,
            error_message: None,
            google_to_caldav_created: 0,
            google_to_caldav_updated: 0,
            google_to_caldav_deleted: 0,
            google_to_caldav_skipped: 0,
            caldav_to_google_created: 0,
            caldav_to_google_updated: 0,
            caldav_to_google_deleted: 0,
            caldav_to_google_skipped: 0,
        };
        self.inner.lock().unwrap().sessions.push(session.clone());
        Ok(session)
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        error_message: Option<String>,
        counters: SessionCounters,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = status;
            session.error_message = error_message;
            session.completed_at = Some(Utc::now());
            session.google_to_caldav_created = counters.google_to_caldav_created;
            session.google_to_caldav_updated = counters.google_to_caldav_updated;
            session.google_to_caldav_deleted = counters.google_to_caldav_deleted;
            session.google_to_caldav_skipped = counters.google_to_caldav_skipped;
            session.caldav_to_google_created = counters.caldav_to_google_created;
            session.caldav_to_google_updated = counters.caldav_to_google_updated;
            session.caldav_to_google_deleted = counters.caldav_to_google_deleted;
            session.caldav_to_google_skipped = counters.caldav_to_google_skipped;
        }
        Ok(())
    }

    async fn record_operation(&self, record: OperationRecord) -> ServiceResult<()> {
        self.inner.lock().unwrap().operations.push(record);
        Ok(())
    }

    async fn record_conflict(&self, record: ConflictRecord) -> ServiceResult<()> {
        self.inner.lock().unwrap().conflicts.push(record);
        Ok(())
    }
}

fn engine(
    google: FakeAdapter,
    caldav: FakeAdapter,
    store: MemoryStore,
) -> SyncEngine<FakeAdapter, FakeAdapter, MemoryStore> {
    let options = EngineOptions {
        past_days: 30,
        future_days: 365,
        max_events_per_pass: 1000,
        conflict_policy: calbridge_core::types::ConflictPolicy::LatestWins,
        dry_run: false,
    };
    SyncEngine::new(google, caldav, store, options)
}

#[test_log::test(tokio::test)]
async fn fresh_pair_arms_tokens_without_operations() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    let pair_id = store.seed_pair();

    let report = engine(google, caldav, store.clone())
        .run_session()
        .await
        .unwrap();

    assert_eq!(report.total_operations(), 0);
    let pair = store.pair(pair_id);
    assert!(pair.google_sync_token.is_some());
    assert!(pair.caldav_sync_token.is_some());
    assert_eq!(store.sessions()[0].status, SessionStatus::Completed);
}

#[test_log::test(tokio::test)]
async fn create_on_google_propagates_to_caldav() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    store.seed_pair();

    let event = base_event(EventSource::Google, "g-evt-1", "standup@example.com", "Standup");
    google.seed(event.clone());

    engine(google.clone(), caldav.clone(), store.clone())
        .run_session()
        .await
        .unwrap();

    let propagated = caldav.events_with_uid("standup@example.com");
    assert_eq!(propagated.len(), 1);
    assert_eq!(propagated[0].summary, "Standup");

    let mappings = store.mappings();
    assert_eq!(mappings.len(), 1);
    let mapping = &mappings[0];
    assert_eq!(mapping.google_event_id.as_deref(), Some("g-evt-1"));
    assert!(mapping.caldav_event_id.is_some());
    assert_eq!(mapping.canonical_uid.as_deref(), Some("standup@example.com"));
    assert_eq!(mapping.content_hash, event.content_hash());
    assert_eq!(mapping.content_hash, propagated[0].content_hash());
}

#[test_log::test(tokio::test)]
async fn repeated_pass_is_idempotent() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    store.seed_pair();
    google.seed(base_event(
        EventSource::Google,
        "g-evt-1",
        "standup@example.com",
        "Standup",
    ));

    let sync = engine(google.clone(), caldav.clone(), store.clone());
    sync.run_session().await.unwrap();
    let report = sync.run_session().await.unwrap();

    // Still exactly one event on the target, one mapping row
    assert_eq!(caldav.events_with_uid("standup@example.com").len(), 1);
    assert_eq!(store.mappings().len(), 1);
    assert_eq!(caldav.event_count(), 1);
    // With the tokens armed and no external activity, the repeated pass
    // observes empty change sets
    assert_eq!(report.total_operations(), 0);
}

#[test_log::test(tokio::test)]
async fn bilateral_edit_resolves_latest_wins() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    let pair_id = store.seed_pair();

    let last_synced = t(6, 0);
    let mut google_event = base_event(
        EventSource::Google,
        "g-evt-1",
        "meeting@example.com",
        "A1",
    );
    google_event.updated = t(7, 0);
    let mut caldav_event = base_event(
        EventSource::CalDav,
        "https://cal.example.com/home/work/meeting.ics",
        "meeting@example.com",
        "B1",
    );
    caldav_event.updated = t(8, 0);

    google.seed(google_event);
    caldav.seed(caldav_event.clone());
    store.seed_mapping(
        pair_id,
        "g-evt-1",
        "https://cal.example.com/home/work/meeting.ics",
        "meeting@example.com",
        "stale-hash",
        Some(last_synced),
    );

    engine(google.clone(), caldav.clone(), store.clone())
        .run_session()
        .await
        .unwrap();

    // Later edit wins on both sides
    assert_eq!(google.event("g-evt-1").unwrap().summary, "B1");
    assert_eq!(
        caldav
            .event("https://cal.example.com/home/work/meeting.ics")
            .unwrap()
            .summary,
        "B1"
    );
    assert_eq!(store.conflicts().len(), 1);
    let mapping = &store.mappings()[0];
    assert_eq!(mapping.content_hash, caldav_event.content_hash());
}

#[test_log::test(tokio::test)]
async fn deletions_require_a_token_armed_pass() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    let pair_id = store.seed_pair();

    let google_event = base_event(
        EventSource::Google,
        "g-evt-1",
        "standup@example.com",
        "Standup",
    );
    let caldav_event = base_event(
        EventSource::CalDav,
        "https://cal.example.com/home/work/standup.ics",
        "standup@example.com",
        "Standup",
    );
    let shared_hash = google_event.content_hash();
    google.seed(google_event);
    caldav.seed(caldav_event);
    store.seed_mapping(
        pair_id,
        "g-evt-1",
        "https://cal.example.com/home/work/standup.ics",
        "standup@example.com",
        &shared_hash,
        Some(t(6, 0)),
    );

    // Pass with no Google token: the event is absent from the snapshot but
    // absence never means deletion
    google.set_token_acquisition_fails(true);
    google.hide_from_snapshot("g-evt-1");
    let sync = engine(google.clone(), caldav.clone(), store.clone());
    sync.run_session().await.unwrap();

    assert!(caldav
        .event("https://cal.example.com/home/work/standup.ics")
        .is_some());
    assert_eq!(store.mappings()[0].status, MappingStatus::Active);

    // Arm the token, then delete explicitly; the next delta reports it
    google.set_token_acquisition_fails(false);
    sync.run_session().await.unwrap();
    assert!(store.pair(pair_id).google_sync_token.is_some());

    google.remote_delete("g-evt-1");
    sync.run_session().await.unwrap();

    assert!(caldav
        .event("https://cal.example.com/home/work/standup.ics")
        .is_none());
    assert_eq!(store.mappings()[0].status, MappingStatus::Deleted);
}

#[test_log::test(tokio::test)]
async fn invalidated_token_suppresses_deletions_and_clears_it() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    let pair_id = store.seed_pair();

    let google_event = base_event(
        EventSource::Google,
        "g-evt-1",
        "standup@example.com",
        "Standup",
    );
    let caldav_event = base_event(
        EventSource::CalDav,
        "https://cal.example.com/home/work/standup.ics",
        "standup@example.com",
        "Standup",
    );
    let shared_hash = google_event.content_hash();
    google.seed(google_event);
    caldav.seed(caldav_event);
    store.seed_mapping(
        pair_id,
        "g-evt-1",
        "https://cal.example.com/home/work/standup.ics",
        "standup@example.com",
        &shared_hash,
        Some(t(6, 0)),
    );
    {
        let mut inner = store.inner.lock().unwrap();
        let pair = inner.pairs.iter_mut().find(|p| p.id == pair_id).unwrap();
        pair.google_sync_token = Some("tok-stale".to_string());
    }
    google.state.lock().unwrap().reject_tokens = true;
    // The event is even gone server-side; the snapshot must not read that
    // as a deletion
    google.state.lock().unwrap().events.remove("g-evt-1");

    engine(google.clone(), caldav.clone(), store.clone())
        .run_session()
        .await
        .unwrap();

    assert!(caldav
        .event("https://cal.example.com/home/work/standup.ics")
        .is_some());
    assert_eq!(store.mappings()[0].status, MappingStatus::Active);
}

#[test_log::test(tokio::test)]
async fn cancelled_override_merges_as_exdate() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    let pair_id = store.seed_pair();

    let mut google_master = base_event(
        EventSource::Google,
        "g-master",
        "series@example.com",
        "Weekly sync",
    );
    google_master.rrule = Some("FREQ=WEEKLY;BYDAY=MO".to_string());

    let cancelled_at = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
    let mut cancelled = base_event(
        EventSource::Google,
        "g-master_20260309T090000Z",
        "series@example.com",
        "Weekly sync",
    );
    cancelled.status = EventStatus::Cancelled;
    cancelled.master_native_id = Some("g-master".to_string());
    cancelled.overrides.push(RecurrenceOverride::RecurrenceId {
        instant: cancelled_at,
        original_start: Some(cancelled_at),
    });
    cancelled.start = cancelled_at;
    cancelled.end = cancelled_at + TimeDelta::hours(1);

    let mut caldav_master = base_event(
        EventSource::CalDav,
        "https://cal.example.com/home/work/series.ics",
        "series@example.com",
        "Weekly sync",
    );
    caldav_master.rrule = Some("FREQ=WEEKLY;BYDAY=MO".to_string());
    let master_hash = google_master.content_hash();
    assert_eq!(master_hash, caldav_master.content_hash());

    google.seed(google_master);
    google.seed(cancelled);
    caldav.seed(caldav_master);
    store.seed_mapping(
        pair_id,
        "g-master",
        "https://cal.example.com/home/work/series.ics",
        "series@example.com",
        &master_hash,
        Some(t(6, 0)),
    );

    engine(google.clone(), caldav.clone(), store.clone())
        .run_session()
        .await
        .unwrap();

    // The master resource gained an EXDATE and a sequence bump; no second
    // object with the series UID was created
    let caldav_events = caldav.events_with_uid("series@example.com");
    assert_eq!(caldav_events.len(), 1);
    let master = &caldav_events[0];
    assert!(master.overrides.iter().any(|o| matches!(
        o,
        RecurrenceOverride::ExDate { dates } if dates.contains(&cancelled_at)
    )));
    assert_eq!(master.sequence, 1);
}

#[test_log::test(tokio::test)]
async fn caldav_edit_propagates_back_to_google() {
    let google = FakeAdapter::new(EventSource::Google);
    let caldav = FakeAdapter::new(EventSource::CalDav);
    let store = MemoryStore::default();
    store.seed_pair();
    google.seed(base_event(
        EventSource::Google,
        "g-evt-1",
        "standup@example.com",
        "Standup",
    ));

    let sync = engine(google.clone(), caldav.clone(), store.clone());
    sync.run_session().await.unwrap();

    // Edit on the CalDAV side between passes
    let caldav_native = store.mappings()[0].caldav_event_id.clone().unwrap();
    let mut edited = caldav.event(&caldav_native).unwrap();
    edited.summary = "Standup (moved)".to_string();
    edited.updated = Utc::now();
    edited.sequence = 1;
    caldav.remote_upsert(edited);

    sync.run_session().await.unwrap();

    assert_eq!(google.event("g-evt-1").unwrap().summary, "Standup (moved)");
    let mapping = &store.mappings()[0];
    assert!(mapping.caldav_sequence >= mapping.google_sequence);
}
