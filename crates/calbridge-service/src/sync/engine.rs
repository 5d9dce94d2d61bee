//! Per-pair bidirectional reconciliation.
//!
//! A pass walks the eight steps: token preflight, concurrent change set
//! fetch, recurrence grouping, reconciliation in both directions, deletion
//! handling gated on token validity, post-processing token capture with a
//! race probe, and audit emission. Mapping writes for one event land before
//! the next event is processed; token persistence is the last write of a
//! pass.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use calbridge_core::config::SyncConfig;
use calbridge_core::event::Event;
use calbridge_core::types::{
    ChangeSet, ConflictPolicy, EventSource, OperationKind, SyncDirection,
};
use calbridge_db::db::enums::{MappingStatus, SessionStatus};
use calbridge_db::model::mapping::EventMapping;
use calbridge_db::model::pair::CalendarPair;
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::adapter::{CalendarAdapter, TimeWindow};
use crate::error::{AdapterError, ServiceError, ServiceResult};
use crate::store::{
    ConflictRecord, MappingDraft, MappingRefresh, OperationRecord, SideRebind, SyncStore,
};
use crate::sync::grouping::{RecurrenceGroup, group_recurrences};
use crate::sync::hrefs::map_deleted_hrefs;
use crate::sync::report::{ConflictOutcome, OperationOutcome, SyncReport};
use crate::sync::resolver;

/// Slack applied around the pass window when probing for racing writes
fn race_probe_slack() -> TimeDelta {
    TimeDelta::minutes(5)
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub past_days: i64,
    pub future_days: i64,
    pub max_events_per_pass: usize,
    pub conflict_policy: ConflictPolicy,
    pub dry_run: bool,
}

impl EngineOptions {
    #[must_use]
    pub fn from_config(config: &SyncConfig, dry_run: bool) -> Self {
        Self {
            past_days: config.past_days,
            future_days: config.future_days,
            max_events_per_pass: config.max_events_per_pass,
            conflict_policy: config.conflict_policy,
            dry_run,
        }
    }
}

/// Per-pass working state: the pair's mappings plus processed bookkeeping
struct PassState {
    mappings: Vec<EventMapping>,
    processed_google: HashSet<String>,
    processed_caldav: HashSet<String>,
}

impl PassState {
    fn new(mappings: Vec<EventMapping>) -> Self {
        Self {
            mappings,
            processed_google: HashSet::new(),
            processed_caldav: HashSet::new(),
        }
    }

    fn find_by_native(&self, source: EventSource, native_id: &str) -> Option<&EventMapping> {
        self.mappings
            .iter()
            .find(|m| m.native_id_for(source) == Some(native_id))
    }

    fn find_by_uid(&self, canonical_uid: &str) -> Option<&EventMapping> {
        self.mappings
            .iter()
            .find(|m| m.canonical_uid.as_deref() == Some(canonical_uid))
    }

    fn upsert(&mut self, mapping: EventMapping) {
        if let Some(existing) = self.mappings.iter_mut().find(|m| m.id == mapping.id) {
            *existing = mapping;
        } else {
            self.mappings.push(mapping);
        }
    }

    fn apply_refresh(&mut self, mapping_id: Uuid, refresh: &MappingRefresh, now: DateTime<Utc>) {
        if let Some(mapping) = self.mappings.iter_mut().find(|m| m.id == mapping_id) {
            mapping.content_hash.clone_from(&refresh.content_hash);
            if let Some(etag) = &refresh.google_etag {
                mapping.google_etag = Some(etag.clone());
            }
            if let Some(etag) = &refresh.caldav_etag {
                mapping.caldav_etag = Some(etag.clone());
            }
            if let Some(sequence) = refresh.google_sequence {
                mapping.google_sequence = sequence;
            }
            if let Some(sequence) = refresh.caldav_sequence {
                mapping.caldav_sequence = sequence;
            }
            mapping.sync_direction.clone_from(&refresh.sync_direction);
            mapping.last_synced_at = Some(now);
            mapping.updated_at = now;
        }
    }

    fn mark_processed(&mut self, source: EventSource, native_id: &str) {
        match source {
            EventSource::Google => self.processed_google.insert(native_id.to_string()),
            EventSource::CalDav => self.processed_caldav.insert(native_id.to_string()),
        };
    }

    fn is_processed(&self, source: EventSource, native_id: &str) -> bool {
        match source {
            EventSource::Google => self.processed_google.contains(native_id),
            EventSource::CalDav => self.processed_caldav.contains(native_id),
        }
    }
}

/// Per-direction context threaded through the reconciliation helpers
struct DirectionCtx<'a> {
    pair_id: Uuid,
    session_id: Uuid,
    source_calendar: &'a str,
    target_calendar: &'a str,
    policy: ConflictPolicy,
    dry_run: bool,
}

pub struct SyncEngine<G, C, S> {
    google: G,
    caldav: C,
    store: S,
    options: EngineOptions,
    locks: StdMutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl<G, C, S> SyncEngine<G, C, S>
where
    G: CalendarAdapter,
    C: CalendarAdapter,
    S: SyncStore,
{
    #[must_use]
    pub fn new(google: G, caldav: C, store: S, options: EngineOptions) -> Self {
        Self {
            google,
            caldav,
            store,
            options,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// ## Summary
    /// Runs one full session over every enabled pair and closes the audit
    /// session. Errors that compromise one pair abort that pair's pass but
    /// not the others.
    ///
    /// ## Errors
    /// Returns an error only when the session itself cannot be opened or
    /// closed; per-pair failures are recorded in the report.
    #[tracing::instrument(skip(self))]
    pub async fn run_session(&self) -> ServiceResult<SyncReport> {
        let session = self.store.create_session(self.options.dry_run).await?;
        let mut report = SyncReport::new(session.id, session.started_at, session.dry_run);

        let pairs = self.store.list_enabled_pairs().await?;
        tracing::info!(pair_count = pairs.len(), "Starting sync session");

        for pair in &pairs {
            if let Err(err) = self.sync_pair(pair, &mut report).await {
                tracing::error!(
                    pair_id = %pair.id,
                    error = %err,
                    "Pair pass aborted"
                );
                report.errors.push(format!("pair {}: {err}", pair.id));
            }
        }

        let status = if report.made_progress() {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        let error_message = (!report.errors.is_empty()).then(|| report.errors.join("; "));
        self.store
            .complete_session(session.id, status, error_message, report.counters())
            .await?;
        report.completed_at = Some(Utc::now());

        tracing::info!(
            operations = report.total_operations(),
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            status = %status,
            "Sync session finished"
        );
        Ok(report)
    }

    /// ## Summary
    /// Runs a single pair pass. A pair is pinned to at most one in-flight
    /// pass; an overlapping invocation is skipped.
    ///
    /// ## Errors
    /// Returns pair-fatal errors (authentication, invariant violations);
    /// per-event failures only reach the audit.
    #[tracing::instrument(skip(self, pair, report), fields(pair_id = %pair.id))]
    pub async fn sync_pair(
        &self,
        pair: &CalendarPair,
        report: &mut SyncReport,
    ) -> ServiceResult<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| ServiceError::InvariantViolation("pair lock poisoned"))?;
            Arc::clone(locks.entry(pair.id).or_default())
        };
        let Ok(_guard) = lock.try_lock_owned() else {
            tracing::info!("Pair pass already in flight, skipping");
            return Ok(());
        };

        if !pair.enabled {
            return Ok(());
        }
        let direction = SyncDirection::parse(&pair.direction).ok_or(
            ServiceError::InvariantViolation("pair row carries unknown direction"),
        )?;
        let policy = pair
            .conflict_policy
            .as_deref()
            .and_then(ConflictPolicy::parse)
            .unwrap_or(self.options.conflict_policy);

        let session_start = Utc::now();
        let window = TimeWindow::around_now(self.options.past_days, self.options.future_days);

        // Step 1: token preflight. A token acquired here is only persisted
        // at step 7 to arm deletion detection for subsequent passes; this
        // pass still fetches against the stored token so events that
        // predate the acquisition are not skipped.
        let stored_google_token = pair.google_sync_token.clone();
        let preflight_google_token = if stored_google_token.is_none() {
            self.acquire_token(&self.google, &pair.google_calendar_id)
                .await
        } else {
            None
        };
        let stored_caldav_token = pair.caldav_sync_token.clone();
        let preflight_caldav_token = if stored_caldav_token.is_none() {
            self.acquire_token(&self.caldav, &pair.caldav_calendar_id)
                .await
        } else {
            None
        };

        // Step 2: fetch both change sets concurrently
        let (google_result, caldav_result) = tokio::join!(
            self.google.get_change_set(
                &pair.google_calendar_id,
                stored_google_token.as_deref(),
                window,
                self.options.max_events_per_pass,
            ),
            self.caldav.get_change_set(
                &pair.caldav_calendar_id,
                stored_caldav_token.as_deref(),
                window,
                self.options.max_events_per_pass,
            ),
        );
        let google_changes = google_result?;
        let caldav_changes = caldav_result?;

        let stored_google_token = self
            .settle_token(pair, EventSource::Google, stored_google_token, &google_changes)
            .await?;
        let stored_caldav_token = self
            .settle_token(pair, EventSource::CalDav, stored_caldav_token, &caldav_changes)
            .await?;

        tracing::info!(
            google_changed = google_changes.changed.len(),
            google_deleted = google_changes.deleted_native_ids.len(),
            google_used_token = google_changes.used_token,
            caldav_changed = caldav_changes.changed.len(),
            caldav_deleted = caldav_changes.deleted_native_ids.len(),
            caldav_used_token = caldav_changes.used_token,
            "Change sets fetched"
        );

        let mut state = PassState::new(self.store.load_mappings(pair.id).await?);

        // Step 3: recurrence grouping per side
        let google_groups = group_recurrences(&google_changes.changed);
        let caldav_groups = group_recurrences(&caldav_changes.changed);
        let caldav_by_uid = index_by_uid(&caldav_changes.changed);
        let google_by_uid = index_by_uid(&google_changes.changed);

        // Steps 4 and 5: reconcile both directions sequentially so mapping
        // updates stay serializable
        if direction.propagates_from(EventSource::Google) {
            let ctx = DirectionCtx {
                pair_id: pair.id,
                session_id: report.session_id,
                source_calendar: &pair.google_calendar_id,
                target_calendar: &pair.caldav_calendar_id,
                policy,
                dry_run: self.options.dry_run,
            };
            self.reconcile_direction(
                &self.google,
                &self.caldav,
                &ctx,
                &google_groups,
                &caldav_by_uid,
                &mut state,
                report,
            )
            .await?;
        }
        if direction.propagates_from(EventSource::CalDav) {
            let ctx = DirectionCtx {
                pair_id: pair.id,
                session_id: report.session_id,
                source_calendar: &pair.caldav_calendar_id,
                target_calendar: &pair.google_calendar_id,
                policy,
                dry_run: self.options.dry_run,
            };
            self.reconcile_direction(
                &self.caldav,
                &self.google,
                &ctx,
                &caldav_groups,
                &google_by_uid,
                &mut state,
                report,
            )
            .await?;
        }

        // Step 6: deletions, only from sides whose pass consumed a token
        let google_deleted = if google_changes.used_token {
            google_changes.deleted_native_ids.clone()
        } else {
            HashSet::new()
        };
        let caldav_deleted_hrefs = if caldav_changes.used_token {
            caldav_changes.deleted_native_ids.clone()
        } else {
            HashSet::new()
        };
        self.handle_deletions(
            pair,
            report.session_id,
            &mut state,
            &google_deleted,
            &caldav_deleted_hrefs,
            report,
        )
        .await?;

        // Step 7: post-processing token capture with race verification
        self.capture_fresh_tokens(
            pair,
            session_start,
            google_changes
                .next_token
                .clone()
                .or(preflight_google_token)
                .or(stored_google_token),
            caldav_changes
                .next_token
                .clone()
                .or(preflight_caldav_token)
                .or(stored_caldav_token),
        )
        .await?;

        Ok(())
    }

    async fn acquire_token<A: CalendarAdapter>(
        &self,
        adapter: &A,
        calendar_id: &str,
    ) -> Option<String> {
        match adapter.get_sync_token(calendar_id).await {
            Ok(token) => {
                tracing::info!(source = %adapter.source(), "Initial sync token acquired");
                Some(token)
            }
            Err(err) => {
                tracing::warn!(
                    source = %adapter.source(),
                    error = %err,
                    "Sync token unavailable, falling back to window snapshots"
                );
                None
            }
        }
    }

    /// Clears a stored token the server rejected; the pass continues on the
    /// snapshot the adapter already substituted.
    async fn settle_token(
        &self,
        pair: &CalendarPair,
        source: EventSource,
        token: Option<String>,
        changes: &ChangeSet,
    ) -> ServiceResult<Option<String>> {
        let Some(invalidated) = &changes.invalidated_token else {
            return Ok(token);
        };
        tracing::warn!(
            %source,
            rejected = %invalidated,
            "Clearing invalidated sync token"
        );
        if !self.options.dry_run {
            match source {
                EventSource::Google => self.store.clear_google_token(pair.id).await?,
                EventSource::CalDav => self.store.clear_caldav_token(pair.id).await?,
            }
        }
        Ok(None)
    }

    #[expect(clippy::too_many_arguments)]
    async fn reconcile_direction<SA, TA>(
        &self,
        source: &SA,
        target: &TA,
        ctx: &DirectionCtx<'_>,
        groups: &[RecurrenceGroup],
        target_events_by_uid: &HashMap<String, Event>,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> ServiceResult<()>
    where
        SA: CalendarAdapter,
        TA: CalendarAdapter,
    {
        for group in groups {
            self.propagate_event(
                source,
                target,
                ctx,
                &group.master,
                None,
                target_events_by_uid,
                state,
                report,
            )
            .await?;

            let master_target_native = state
                .find_by_native(source.source(), &group.master.native_id)
                .and_then(|m| m.native_id_for(target.source()))
                .map(String::from);

            for override_event in &group.overrides {
                self.propagate_event(
                    source,
                    target,
                    ctx,
                    override_event,
                    master_target_native.as_deref(),
                    target_events_by_uid,
                    state,
                    report,
                )
                .await?;
            }
        }
        Ok(())
    }

    #[expect(clippy::too_many_arguments)]
    #[expect(clippy::too_many_lines)]
    async fn propagate_event<SA, TA>(
        &self,
        source: &SA,
        target: &TA,
        ctx: &DirectionCtx<'_>,
        event: &Event,
        master_target_native: Option<&str>,
        target_events_by_uid: &HashMap<String, Event>,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> ServiceResult<()>
    where
        SA: CalendarAdapter,
        TA: CalendarAdapter,
    {
        let source_side = source.source();
        let target_side = target.source();
        if state.is_processed(source_side, &event.native_id) {
            return Ok(());
        }
        state.mark_processed(source_side, &event.native_id);

        if let Err(err) = event.validate() {
            self.record(
                report,
                ctx,
                event,
                None,
                OperationKind::Skip,
                false,
                Some(err.to_string()),
            )
            .await?;
            return Ok(());
        }

        let content_hash = event.content_hash();
        // Overrides share their master's UID, so only the native id may
        // identify their mapping
        let uid_lookup_allowed = !event.uid.is_empty() && !event.is_recurrence_override();
        let mapping = state
            .find_by_native(source_side, &event.native_id)
            .cloned()
            .or_else(|| {
                uid_lookup_allowed
                    .then(|| state.find_by_uid(&event.uid).cloned())
                    .flatten()
            });

        let Some(mapping) = mapping else {
            self.create_with_mapping(
                source,
                target,
                ctx,
                event,
                master_target_native,
                target_events_by_uid,
                &content_hash,
                state,
                report,
            )
            .await?;
            return Ok(());
        };

        // Unchanged content never propagates
        if mapping.content_hash == content_hash {
            self.record(
                report,
                ctx,
                event,
                Some(mapping.id),
                OperationKind::Skip,
                true,
                None,
            )
            .await?;
            return Ok(());
        }

        let Some(target_native) = mapping.native_id_for(target_side).map(String::from) else {
            // One-direction pair before its first completed propagation
            self.fill_missing_target(
                target,
                ctx,
                event,
                master_target_native,
                &mapping,
                &content_hash,
                state,
                report,
            )
            .await?;
            return Ok(());
        };

        match target.get_event(ctx.target_calendar, &target_native).await {
            Ok(target_event) => {
                if resolver::is_conflict(event, &target_event, mapping.last_synced_at) {
                    self.handle_conflict(
                        source,
                        target,
                        ctx,
                        event,
                        &target_event,
                        &mapping,
                        state,
                        report,
                    )
                    .await?;
                    return Ok(());
                }

                let update_result = if ctx.dry_run {
                    Ok(target_event)
                } else {
                    target
                        .update_event(ctx.target_calendar, &target_native, event)
                        .await
                };
                match update_result {
                    Ok(updated) => {
                        if !ctx.dry_run {
                            let refresh = refresh_for(event, &updated, content_hash);
                            self.store.refresh_mapping(mapping.id, refresh.clone()).await?;
                            state.apply_refresh(mapping.id, &refresh, Utc::now());
                        }
                        self.record(
                            report,
                            ctx,
                            event,
                            Some(mapping.id),
                            OperationKind::Update,
                            true,
                            None,
                        )
                        .await?;
                    }
                    Err(err) if is_pair_fatal(&err) => return Err(err.into()),
                    Err(err) => {
                        self.record(
                            report,
                            ctx,
                            event,
                            Some(mapping.id),
                            OperationKind::Update,
                            false,
                            Some(err.to_string()),
                        )
                        .await?;
                    }
                }
            }
            Err(AdapterError::NotFound(_)) => {
                // Target copy vanished; recreate it and rebind the mapping
                if ctx.dry_run {
                    self.record(
                        report,
                        ctx,
                        event,
                        Some(mapping.id),
                        OperationKind::Create,
                        true,
                        None,
                    )
                    .await?;
                    return Ok(());
                }
                match self
                    .create_on_target(target, ctx, event, master_target_native)
                    .await
                {
                    Ok(created) => {
                        let refresh = refresh_for(event, &created, content_hash);
                        self.store
                            .rebind_and_refresh(
                                mapping.id,
                                target_side,
                                rebind_for(&created),
                                refresh.clone(),
                            )
                            .await?;
                        let mut revived = mapping.clone();
                        set_side_identity(&mut revived, &created);
                        state.upsert(revived);
                        state.apply_refresh(mapping.id, &refresh, Utc::now());
                        self.record(
                            report,
                            ctx,
                            event,
                            Some(mapping.id),
                            OperationKind::Create,
                            true,
                            None,
                        )
                        .await?;
                    }
                    Err(err) if is_pair_fatal(&err) => return Err(err.into()),
                    Err(err) => {
                        self.record(
                            report,
                            ctx,
                            event,
                            Some(mapping.id),
                            OperationKind::Create,
                            false,
                            Some(err.to_string()),
                        )
                        .await?;
                    }
                }
            }
            Err(err) if is_pair_fatal(&err) => return Err(err.into()),
            Err(err) => {
                self.record(
                    report,
                    ctx,
                    event,
                    Some(mapping.id),
                    OperationKind::Update,
                    false,
                    Some(err.to_string()),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn create_on_target<TA: CalendarAdapter>(
        &self,
        target: &TA,
        ctx: &DirectionCtx<'_>,
        event: &Event,
        master_target_native: Option<&str>,
    ) -> Result<Event, AdapterError> {
        if event.is_recurrence_override() {
            target
                .apply_recurrence_override(
                    ctx.target_calendar,
                    master_target_native,
                    &event.uid,
                    event,
                )
                .await
        } else {
            target.create_event(ctx.target_calendar, event).await
        }
    }

    #[expect(clippy::too_many_arguments)]
    async fn create_with_mapping<SA, TA>(
        &self,
        _source: &SA,
        target: &TA,
        ctx: &DirectionCtx<'_>,
        event: &Event,
        master_target_native: Option<&str>,
        target_events_by_uid: &HashMap<String, Event>,
        content_hash: &str,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> ServiceResult<()>
    where
        SA: CalendarAdapter,
        TA: CalendarAdapter,
    {
        // A same-UID event already on the target is adopted, not duplicated.
        // Overrides never adopt: their UID is the master's.
        if let Some(existing) = target_events_by_uid
            .get(&event.uid)
            .filter(|_| !event.is_recurrence_override())
        {
            if !ctx.dry_run {
                let draft = draft_for_pairing(ctx.pair_id, event, existing, content_hash);
                let inserted = self.store.insert_mapping(draft).await?;
                state.upsert(inserted);
            }
            self.record(report, ctx, event, None, OperationKind::Skip, true, None)
                .await?;
            return Ok(());
        }

        if ctx.dry_run {
            self.record(report, ctx, event, None, OperationKind::Create, true, None)
                .await?;
            return Ok(());
        }

        match self
            .create_on_target(target, ctx, event, master_target_native)
            .await
        {
            Ok(created) => {
                // An EXDATE merge lands inside an already-mapped master
                // resource; only a genuinely new target object gets its own
                // identity row
                if let Some(existing) = state
                    .find_by_native(created.source, &created.native_id)
                    .map(|m| m.id)
                {
                    self.record(
                        report,
                        ctx,
                        event,
                        Some(existing),
                        OperationKind::Update,
                        true,
                        None,
                    )
                    .await?;
                    return Ok(());
                }
                let draft = draft_for_pairing(ctx.pair_id, event, &created, content_hash);
                let inserted = self.store.insert_mapping(draft).await?;
                let mapping_id = inserted.id;
                state.upsert(inserted);
                self.record(
                    report,
                    ctx,
                    event,
                    Some(mapping_id),
                    OperationKind::Create,
                    true,
                    None,
                )
                .await?;
            }
            Err(err) if is_pair_fatal(&err) => return Err(err.into()),
            Err(err) => {
                self.record(
                    report,
                    ctx,
                    event,
                    None,
                    OperationKind::Create,
                    false,
                    Some(err.to_string()),
                )
                .await?;
            }
        }
        Ok(())
    }

    #[expect(clippy::too_many_arguments)]
    async fn fill_missing_target<TA: CalendarAdapter>(
        &self,
        target: &TA,
        ctx: &DirectionCtx<'_>,
        event: &Event,
        master_target_native: Option<&str>,
        mapping: &EventMapping,
        content_hash: &str,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> ServiceResult<()> {
        if ctx.dry_run {
            self.record(
                report,
                ctx,
                event,
                Some(mapping.id),
                OperationKind::Create,
                true,
                None,
            )
            .await?;
            return Ok(());
        }
        match self
            .create_on_target(target, ctx, event, master_target_native)
            .await
        {
            Ok(created) => {
                let refresh = refresh_for(event, &created, content_hash.to_string());
                self.store
                    .rebind_and_refresh(
                        mapping.id,
                        target.source(),
                        rebind_for(&created),
                        refresh.clone(),
                    )
                    .await?;
                let mut updated = mapping.clone();
                set_side_identity(&mut updated, &created);
                state.upsert(updated);
                state.apply_refresh(mapping.id, &refresh, Utc::now());
                self.record(
                    report,
                    ctx,
                    event,
                    Some(mapping.id),
                    OperationKind::Create,
                    true,
                    None,
                )
                .await?;
            }
            Err(err) if is_pair_fatal(&err) => return Err(err.into()),
            Err(err) => {
                self.record(
                    report,
                    ctx,
                    event,
                    Some(mapping.id),
                    OperationKind::Create,
                    false,
                    Some(err.to_string()),
                )
                .await?;
            }
        }
        Ok(())
    }

    #[expect(clippy::too_many_arguments)]
    async fn handle_conflict<SA, TA>(
        &self,
        source: &SA,
        target: &TA,
        ctx: &DirectionCtx<'_>,
        source_event: &Event,
        target_event: &Event,
        mapping: &EventMapping,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> ServiceResult<()>
    where
        SA: CalendarAdapter,
        TA: CalendarAdapter,
    {
        let (google_event, caldav_event) = if source.source() == EventSource::Google {
            (source_event, target_event)
        } else {
            (target_event, source_event)
        };
        let resolution = resolver::resolve(google_event, caldav_event, ctx.policy);
        tracing::warn!(
            winner = ?resolution.winner,
            reason = %resolution.reason,
            uid = %source_event.uid,
            "Conflict detected, applying automatic resolution"
        );

        report.conflicts.push(ConflictOutcome {
            google_native_id: Some(google_event.native_id.clone()),
            caldav_native_id: Some(caldav_event.native_id.clone()),
            reason: resolution.reason.clone(),
            resolution: Some(format!("{:?}_wins", resolution.winner).to_lowercase()),
        });
        self.store
            .record_conflict(ConflictRecord {
                session_id: ctx.session_id,
                mapping_id: Some(mapping.id),
                google_event_id: Some(google_event.native_id.clone()),
                caldav_event_id: Some(caldav_event.native_id.clone()),
                google_payload: serde_json::to_value(google_event).ok(),
                caldav_payload: serde_json::to_value(caldav_event).ok(),
                conflict_kind: "content_mismatch".to_string(),
                resolution: Some(resolution.reason.clone()),
            })
            .await?;

        let winner_is_source = resolution.winner.source() == source.source();
        let (winner, loser_native) = if winner_is_source {
            (source_event, target_event.native_id.clone())
        } else {
            (target_event, source_event.native_id.clone())
        };
        let winning_hash = winner.content_hash();

        let apply_result = if ctx.dry_run {
            Ok(winner.clone())
        } else if winner_is_source {
            target
                .update_event(ctx.target_calendar, &loser_native, winner)
                .await
        } else {
            source
                .update_event(ctx.source_calendar, &loser_native, winner)
                .await
        };

        match apply_result {
            Ok(applied) => {
                if !ctx.dry_run {
                    let refresh = refresh_for(winner, &applied, winning_hash);
                    self.store.refresh_mapping(mapping.id, refresh.clone()).await?;
                    state.apply_refresh(mapping.id, &refresh, Utc::now());
                }
                // Both copies are settled now; neither side reprocesses
                state.mark_processed(EventSource::Google, &google_event.native_id);
                state.mark_processed(EventSource::CalDav, &caldav_event.native_id);
                self.record(
                    report,
                    ctx,
                    source_event,
                    Some(mapping.id),
                    OperationKind::Update,
                    true,
                    None,
                )
                .await?;
            }
            Err(err) if is_pair_fatal(&err) => return Err(err.into()),
            Err(err) => {
                self.record(
                    report,
                    ctx,
                    source_event,
                    Some(mapping.id),
                    OperationKind::Skip,
                    false,
                    Some(format!("conflict resolution failed: {err}")),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_deletions(
        &self,
        pair: &CalendarPair,
        session_id: Uuid,
        state: &mut PassState,
        google_deleted: &HashSet<String>,
        caldav_deleted_hrefs: &HashSet<String>,
        report: &mut SyncReport,
    ) -> ServiceResult<()> {
        if google_deleted.is_empty() && caldav_deleted_hrefs.is_empty() {
            return Ok(());
        }

        let mapped = map_deleted_hrefs(caldav_deleted_hrefs, &state.mappings);
        if !mapped.unmatched.is_empty() {
            tracing::warn!(
                count = mapped.unmatched.len(),
                sample = ?mapped.unmatched.iter().take(3).collect::<Vec<_>>(),
                "Deleted hrefs without a mapping row"
            );
        }

        let mappings = state.mappings.clone();
        for mapping in mappings {
            if mapping.status != MappingStatus::Active {
                continue;
            }
            let google_gone = mapping
                .google_event_id
                .as_deref()
                .is_some_and(|id| google_deleted.contains(id));
            let caldav_gone = mapping
                .caldav_event_id
                .as_deref()
                .is_some_and(|id| mapped.caldav_event_ids.contains(id));

            match (google_gone, caldav_gone) {
                (false, false) => {}
                (true, true) => {
                    // Both sides already gone; just retire the row
                    if !self.options.dry_run {
                        self.store
                            .set_mapping_status(mapping.id, MappingStatus::Deleted)
                            .await?;
                    }
                }
                (true, false) => {
                    self.delete_counterpart(
                        &self.caldav,
                        &pair.caldav_calendar_id,
                        EventSource::Google,
                        &mapping,
                        session_id,
                        report,
                    )
                    .await?;
                }
                (false, true) => {
                    self.delete_counterpart(
                        &self.google,
                        &pair.google_calendar_id,
                        EventSource::CalDav,
                        &mapping,
                        session_id,
                        report,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Deletes the surviving copy after the other side reported a deletion
    async fn delete_counterpart<A: CalendarAdapter>(
        &self,
        adapter: &A,
        calendar_id: &str,
        deleted_on: EventSource,
        mapping: &EventMapping,
        session_id: Uuid,
        report: &mut SyncReport,
    ) -> ServiceResult<()> {
        let target_side = deleted_on.opposite();
        let Some(target_native) = mapping.native_id_for(target_side).map(String::from) else {
            if !self.options.dry_run {
                self.store
                    .set_mapping_status(mapping.id, MappingStatus::Deleted)
                    .await?;
            }
            return Ok(());
        };

        let delete_result = if self.options.dry_run {
            Ok(())
        } else {
            match adapter.delete_event(calendar_id, &target_native).await {
                // Already gone remotely counts as done
                Err(AdapterError::NotFound(_)) | Ok(()) => Ok(()),
                Err(err) => Err(err),
            }
        };

        let origin_native = mapping
            .native_id_for(deleted_on)
            .unwrap_or(&target_native)
            .to_string();
        match delete_result {
            Ok(()) => {
                if !self.options.dry_run {
                    self.store
                        .set_mapping_status(mapping.id, MappingStatus::Deleted)
                        .await?;
                }
                let outcome = OperationOutcome {
                    kind: OperationKind::Delete,
                    source: deleted_on,
                    target: target_side,
                    native_id: origin_native.clone(),
                    summary: Some("Deleted event".to_string()),
                    success: true,
                    error: None,
                };
                report.record(outcome);
                self.store
                    .record_operation(OperationRecord {
                        session_id,
                        mapping_id: Some(mapping.id),
                        kind: OperationKind::Delete,
                        source: deleted_on,
                        target: target_side,
                        native_id: origin_native,
                        summary: Some("Deleted event".to_string()),
                        success: true,
                        error: None,
                    })
                    .await?;
            }
            Err(err) if is_pair_fatal(&err) => return Err(err.into()),
            Err(err) => {
                let outcome = OperationOutcome {
                    kind: OperationKind::Delete,
                    source: deleted_on,
                    target: target_side,
                    native_id: origin_native.clone(),
                    summary: Some("Deleted event".to_string()),
                    success: false,
                    error: Some(err.to_string()),
                };
                report.record(outcome);
                self.store
                    .record_operation(OperationRecord {
                        session_id,
                        mapping_id: Some(mapping.id),
                        kind: OperationKind::Delete,
                        source: deleted_on,
                        target: target_side,
                        native_id: origin_native,
                        summary: Some("Deleted event".to_string()),
                        success: false,
                        error: Some(err.to_string()),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Step 7: re-read fresh tokens after all writes; a fresh token that
    /// moved while concurrent events exist means a race, which clears both
    /// tokens so the next pass runs as a snapshot.
    async fn capture_fresh_tokens(
        &self,
        pair: &CalendarPair,
        session_start: DateTime<Utc>,
        observed_google: Option<String>,
        observed_caldav: Option<String>,
    ) -> ServiceResult<()> {
        if self.options.dry_run {
            return Ok(());
        }

        let fresh_google = self
            .google
            .get_sync_token(&pair.google_calendar_id)
            .await
            .map_err(|err| tracing::warn!(error = %err, "Fresh Google token unavailable"))
            .ok();
        let fresh_caldav = self
            .caldav
            .get_sync_token(&pair.caldav_calendar_id)
            .await
            .map_err(|err| tracing::warn!(error = %err, "Fresh CalDAV token unavailable"))
            .ok();

        let mut race = false;
        if let (Some(fresh), Some(observed)) = (&fresh_google, &observed_google) {
            if fresh != observed {
                race = race
                    || self
                        .probe_concurrent(&self.google, &pair.google_calendar_id, session_start)
                        .await;
            }
        }
        if !race {
            if let (Some(fresh), Some(observed)) = (&fresh_caldav, &observed_caldav) {
                if fresh != observed {
                    race = self
                        .probe_concurrent(&self.caldav, &pair.caldav_calendar_id, session_start)
                        .await;
                }
            }
        }

        if race {
            tracing::warn!(
                pair_id = %pair.id,
                "Race detected during processing, clearing tokens for a snapshot pass"
            );
            self.store.clear_tokens(pair.id).await?;
            return Ok(());
        }

        let final_google = fresh_google.or(observed_google);
        let final_caldav = fresh_caldav.or(observed_caldav);
        self.store
            .persist_tokens(pair.id, final_google, final_caldav)
            .await?;
        Ok(())
    }

    /// Narrow-window listing for events that moved while the pass ran
    async fn probe_concurrent<A: CalendarAdapter>(
        &self,
        adapter: &A,
        calendar_id: &str,
        session_start: DateTime<Utc>,
    ) -> bool {
        let window = TimeWindow::probe(session_start, race_probe_slack());
        match adapter.get_change_set(calendar_id, None, window, 250).await {
            Ok(changes) => changes
                .changed
                .values()
                .any(|event| event.updated >= session_start - race_probe_slack()),
            Err(err) => {
                tracing::warn!(error = %err, "Race probe failed, assuming no race");
                false
            }
        }
    }

    #[expect(clippy::too_many_arguments)]
    async fn record(
        &self,
        report: &mut SyncReport,
        ctx: &DirectionCtx<'_>,
        event: &Event,
        mapping_id: Option<Uuid>,
        kind: OperationKind,
        success: bool,
        error: Option<String>,
    ) -> ServiceResult<()> {
        let outcome = OperationOutcome {
            kind,
            source: event.source,
            target: event.source.opposite(),
            native_id: event.native_id.clone(),
            summary: Some(event.summary.clone()),
            success,
            error: error.clone(),
        };
        report.record(outcome);
        self.store
            .record_operation(OperationRecord {
                session_id: ctx.session_id,
                mapping_id,
                kind,
                source: event.source,
                target: event.source.opposite(),
                native_id: event.native_id.clone(),
                summary: Some(event.summary.clone()),
                success,
                error,
            })
            .await?;
        Ok(())
    }
}

/// Whether an adapter error compromises the whole pair pass
const fn is_pair_fatal(err: &AdapterError) -> bool {
    matches!(err, AdapterError::AuthFailure(_) | AdapterError::Fatal(_))
}

fn index_by_uid(events: &HashMap<String, Event>) -> HashMap<String, Event> {
    events
        .values()
        .filter(|e| !e.uid.is_empty())
        .map(|e| (e.uid.clone(), e.clone()))
        .collect()
}

fn caldav_href_of(native_id: &str) -> String {
    native_id
        .split('#')
        .next()
        .unwrap_or(native_id)
        .to_string()
}

fn direction_label(source: EventSource) -> String {
    format!("{}_to_{}", source.as_str(), source.opposite().as_str())
}

/// Builds the mapping draft for a freshly paired (created or adopted)
/// event couple, with full identity columns
fn draft_for_pairing(
    pair_id: Uuid,
    source_event: &Event,
    target_event: &Event,
    content_hash: &str,
) -> MappingDraft {
    let (google, caldav) = if source_event.source == EventSource::Google {
        (source_event, target_event)
    } else {
        (target_event, source_event)
    };
    let canonical_uid = if source_event.uid.is_empty() {
        None
    } else {
        Some(source_event.uid.clone())
    };
    MappingDraft {
        pair_id,
        google_event_id: Some(google.native_id.clone()),
        caldav_event_id: Some(caldav.native_id.clone()),
        google_ical_uid: (!google.uid.is_empty()).then(|| google.uid.clone()),
        caldav_uid: (!caldav.uid.is_empty()).then(|| caldav.uid.clone()),
        canonical_uid,
        caldav_resource_href: Some(caldav_href_of(&caldav.native_id)),
        google_self_link: google
            .raw
            .as_ref()
            .and_then(|raw| raw.get("self_link"))
            .and_then(|v| v.as_str())
            .map(String::from),
        google_etag: google.etag.clone(),
        caldav_etag: caldav.etag.clone(),
        google_sequence: google.sequence,
        caldav_sequence: caldav.sequence,
        content_hash: content_hash.to_string(),
        sync_direction: Some(direction_label(source_event.source)),
        last_synced_at: Some(Utc::now()),
    }
}

/// Refresh data after a propagation: the applied event's hash plus both
/// sides' version tags as far as they are known
fn refresh_for(
    source_event: &Event,
    applied_event: &Event,
    content_hash: String,
) -> MappingRefresh {
    let mut refresh = MappingRefresh {
        content_hash,
        sync_direction: Some(direction_label(source_event.source)),
        ..MappingRefresh::default()
    };
    for event in [source_event, applied_event] {
        match event.source {
            EventSource::Google => {
                refresh.google_etag = event.etag.clone().or(refresh.google_etag);
                refresh.google_sequence = Some(event.sequence);
            }
            EventSource::CalDav => {
                refresh.caldav_etag = event.etag.clone().or(refresh.caldav_etag);
                refresh.caldav_sequence = Some(event.sequence);
            }
        }
    }
    refresh
}

fn rebind_for(created: &Event) -> SideRebind {
    SideRebind {
        native_id: created.native_id.clone(),
        uid: (!created.uid.is_empty()).then(|| created.uid.clone()),
        link: match created.source {
            EventSource::CalDav => Some(caldav_href_of(&created.native_id)),
            EventSource::Google => created
                .raw
                .as_ref()
                .and_then(|raw| raw.get("self_link"))
                .and_then(|v| v.as_str())
                .map(String::from),
        },
        etag: created.etag.clone(),
        sequence: created.sequence,
    }
}

fn set_side_identity(mapping: &mut EventMapping, created: &Event) {
    match created.source {
        EventSource::Google => {
            mapping.google_event_id = Some(created.native_id.clone());
            mapping.google_etag.clone_from(&created.etag);
            mapping.google_sequence = created.sequence;
        }
        EventSource::CalDav => {
            mapping.caldav_event_id = Some(created.native_id.clone());
            mapping.caldav_resource_href = Some(caldav_href_of(&created.native_id));
            mapping.caldav_etag.clone_from(&created.etag);
            mapping.caldav_sequence = created.sequence;
        }
    }
}
