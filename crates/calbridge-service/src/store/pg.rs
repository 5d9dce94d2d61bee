//! Postgres-backed store implementation over the connection pool.

use calbridge_core::types::EventSource;
use calbridge_db::db::connection::DbPool;
use calbridge_db::db::transaction::in_transaction;
use calbridge_db::db::enums::{MappingStatus, SessionStatus};
use calbridge_db::db::query::audit::{self, SessionCounters};
use calbridge_db::db::query::{mappings, pairs};
use calbridge_db::model::mapping::{EventMapping, NewEventMapping};
use calbridge_db::model::pair::{CalendarPair, NewCalendarPair};
use calbridge_db::model::session::{NewSyncOperation, NewSyncSession, SyncSession};
use calbridge_db::model::conflict::NewConflict;
use chrono::Utc;
use uuid::Uuid;

use crate::error::ServiceResult;
use crate::store::{
    ConflictRecord, MappingDraft, MappingRefresh, OperationRecord, PairDraft, SideRebind,
    SyncStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl SyncStore for PgStore {
    async fn list_enabled_pairs(&self) -> ServiceResult<Vec<CalendarPair>> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::list_enabled(&mut conn).await?)
    }

    async fn find_pair(
        &self,
        google_calendar_id: &str,
        caldav_calendar_id: &str,
    ) -> ServiceResult<Option<CalendarPair>> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::find_by_calendars(&mut conn, google_calendar_id, caldav_calendar_id).await?)
    }

    async fn insert_pair(&self, draft: PairDraft) -> ServiceResult<CalendarPair> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let new_pair = NewCalendarPair {
            id: Uuid::new_v4(),
            google_calendar_id: &draft.google_calendar_id,
            caldav_calendar_id: &draft.caldav_calendar_id,
            google_calendar_name: draft.google_calendar_name.as_deref(),
            caldav_calendar_name: draft.caldav_calendar_name.as_deref(),
            direction: draft.direction.as_str(),
            enabled: draft.enabled,
            conflict_policy: draft.conflict_policy.map(|p| p.as_str()),
        };
        Ok(pairs::insert(&mut conn, &new_pair).await?)
    }

    async fn update_pair_names(
        &self,
        pair_id: Uuid,
        google_name: Option<String>,
        caldav_name: Option<String>,
    ) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::update_names(
            &mut conn,
            pair_id,
            google_name.as_deref(),
            caldav_name.as_deref(),
            Utc::now(),
        )
        .await?)
    }

    async fn persist_tokens(
        &self,
        pair_id: Uuid,
        google_sync_token: Option<String>,
        caldav_sync_token: Option<String>,
    ) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::persist_tokens(
            &mut conn,
            pair_id,
            google_sync_token.as_deref(),
            caldav_sync_token.as_deref(),
            Utc::now(),
        )
        .await?)
    }

    async fn clear_google_token(&self, pair_id: Uuid) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::clear_google_token(&mut conn, pair_id, Utc::now()).await?)
    }

    async fn clear_caldav_token(&self, pair_id: Uuid) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::clear_caldav_token(&mut conn, pair_id, Utc::now()).await?)
    }

    async fn clear_tokens(&self, pair_id: Uuid) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(pairs::clear_tokens(&mut conn, pair_id, Utc::now()).await?)
    }

    async fn load_mappings(&self, pair_id: Uuid) -> ServiceResult<Vec<EventMapping>> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(mappings::load_for_pair(&mut conn, pair_id).await?)
    }

    async fn find_mapping_by_native(
        &self,
        pair_id: Uuid,
        source: EventSource,
        native_id: &str,
    ) -> ServiceResult<Option<EventMapping>> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let found = match source {
            EventSource::Google => {
                mappings::find_by_google_event(&mut conn, pair_id, native_id).await?
            }
            EventSource::CalDav => {
                mappings::find_by_caldav_event(&mut conn, pair_id, native_id).await?
            }
        };
        Ok(found)
    }

    async fn find_mapping_by_uid(
        &self,
        pair_id: Uuid,
        canonical_uid: &str,
    ) -> ServiceResult<Option<EventMapping>> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(mappings::find_by_canonical_uid(&mut conn, pair_id, canonical_uid).await?)
    }

    async fn insert_mapping(&self, draft: MappingDraft) -> ServiceResult<EventMapping> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let new_mapping = NewEventMapping {
            id: Uuid::new_v4(),
            pair_id: draft.pair_id,
            google_event_id: draft.google_event_id.as_deref(),
            caldav_event_id: draft.caldav_event_id.as_deref(),
            google_ical_uid: draft.google_ical_uid.as_deref(),
            caldav_uid: draft.caldav_uid.as_deref(),
            canonical_uid: draft.canonical_uid.as_deref(),
            caldav_resource_href: draft.caldav_resource_href.as_deref(),
            google_self_link: draft.google_self_link.as_deref(),
            google_etag: draft.google_etag.as_deref(),
            caldav_etag: draft.caldav_etag.as_deref(),
            google_sequence: draft.google_sequence,
            caldav_sequence: draft.caldav_sequence,
            content_hash: &draft.content_hash,
            status: MappingStatus::Active,
            sync_direction: draft.sync_direction.as_deref(),
            last_synced_at: draft.last_synced_at,
        };
        Ok(mappings::insert(&mut conn, &new_mapping).await?)
    }

    async fn refresh_mapping(
        &self,
        mapping_id: Uuid,
        refresh: MappingRefresh,
    ) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let now = Utc::now();
        let changes = mappings::PropagationRefresh {
            content_hash: &refresh.content_hash,
            google_etag: refresh.google_etag.as_deref(),
            caldav_etag: refresh.caldav_etag.as_deref(),
            google_sequence: refresh.google_sequence,
            caldav_sequence: refresh.caldav_sequence,
            sync_direction: refresh.sync_direction.as_deref(),
            updated_at: now,
            last_synced_at: now,
        };
        Ok(mappings::refresh_propagation(&mut conn, mapping_id, &changes).await?)
    }

    async fn rebind_and_refresh(
        &self,
        mapping_id: Uuid,
        side: EventSource,
        rebind: SideRebind,
        refresh: MappingRefresh,
    ) -> ServiceResult<()> {
        use diesel_async::scoped_futures::ScopedFutureExt;

        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let now = Utc::now();
        in_transaction(&mut conn, |conn| {
            async move {
                match side {
                    EventSource::Google => {
                        mappings::rebind_google_identity(
                            conn,
                            mapping_id,
                            &rebind.native_id,
                            rebind.uid.as_deref(),
                            rebind.link.as_deref(),
                            rebind.etag.as_deref(),
                            rebind.sequence,
                            now,
                        )
                        .await?;
                    }
                    EventSource::CalDav => {
                        mappings::rebind_caldav_identity(
                            conn,
                            mapping_id,
                            &rebind.native_id,
                            rebind.uid.as_deref(),
                            rebind.link.as_deref(),
                            rebind.etag.as_deref(),
                            rebind.sequence,
                            now,
                        )
                        .await?;
                    }
                }
                let changes = mappings::PropagationRefresh {
                    content_hash: &refresh.content_hash,
                    google_etag: refresh.google_etag.as_deref(),
                    caldav_etag: refresh.caldav_etag.as_deref(),
                    google_sequence: refresh.google_sequence,
                    caldav_sequence: refresh.caldav_sequence,
                    sync_direction: refresh.sync_direction.as_deref(),
                    updated_at: now,
                    last_synced_at: now,
                };
                mappings::refresh_propagation(conn, mapping_id, &changes).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await?;
        Ok(())
    }

    async fn set_mapping_status(
        &self,
        mapping_id: Uuid,
        status: MappingStatus,
    ) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(mappings::set_status(&mut conn, mapping_id, status, Utc::now()).await?)
    }

    async fn create_session(&self, dry_run: bool) -> ServiceResult<SyncSession> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let new_session = NewSyncSession {
            id: Uuid::new_v4(),
            dry_run,
            status: SessionStatus::Running,
        };
        Ok(audit::create_session(&mut conn, &new_session).await?)
    }

    async fn complete_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        error_message: Option<String>,
        counters: SessionCounters,
    ) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        Ok(audit::complete_session(
            &mut conn,
            session_id,
            status,
            error_message.as_deref(),
            counters,
            Utc::now(),
        )
        .await?)
    }

    async fn record_operation(&self, record: OperationRecord) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let operation = NewSyncOperation {
            id: Uuid::new_v4(),
            session_id: record.session_id,
            mapping_id: record.mapping_id,
            kind: record.kind.as_str(),
            source: record.source.as_str(),
            target: record.target.as_str(),
            native_id: &record.native_id,
            summary: record.summary.as_deref(),
            success: record.success,
            error_message: record.error.as_deref(),
        };
        Ok(audit::insert_operation(&mut conn, &operation).await?)
    }

    async fn record_conflict(&self, record: ConflictRecord) -> ServiceResult<()> {
        let mut conn = self.pool.get().await.map_err(calbridge_db::error::DbError::from)?;
        let conflict = NewConflict {
            id: Uuid::new_v4(),
            session_id: record.session_id,
            mapping_id: record.mapping_id,
            google_event_id: record.google_event_id.as_deref(),
            caldav_event_id: record.caldav_event_id.as_deref(),
            google_payload: record.google_payload,
            caldav_payload: record.caldav_payload,
            conflict_kind: &record.conflict_kind,
            resolution: record.resolution.as_deref(),
            resolved: record.resolution.is_some(),
        };
        Ok(audit::insert_conflict(&mut conn, &conflict).await?)
    }
}
