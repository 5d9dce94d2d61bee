// Table definitions for the sync state store; kept in lockstep with the
// SQL under migrations/.

diesel::table! {
    calendar_pairs (id) {
        id -> Uuid,
        google_calendar_id -> Text,
        caldav_calendar_id -> Text,
        google_calendar_name -> Nullable<Text>,
        caldav_calendar_name -> Nullable<Text>,
        direction -> Text,
        enabled -> Bool,
        conflict_policy -> Nullable<Text>,
        google_sync_token -> Nullable<Text>,
        caldav_sync_token -> Nullable<Text>,
        google_last_synced_at -> Nullable<Timestamptz>,
        caldav_last_synced_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    event_mappings (id) {
        id -> Uuid,
        pair_id -> Uuid,
        google_event_id -> Nullable<Text>,
        caldav_event_id -> Nullable<Text>,
        google_ical_uid -> Nullable<Text>,
        caldav_uid -> Nullable<Text>,
        canonical_uid -> Nullable<Text>,
        caldav_resource_href -> Nullable<Text>,
        google_self_link -> Nullable<Text>,
        google_etag -> Nullable<Text>,
        caldav_etag -> Nullable<Text>,
        google_sequence -> Int4,
        caldav_sequence -> Int4,
        content_hash -> Text,
        status -> Text,
        sync_direction -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        last_synced_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    sync_sessions (id) {
        id -> Uuid,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        dry_run -> Bool,
        status -> Text,
        error_message -> Nullable<Text>,
        google_to_caldav_created -> Int4,
        google_to_caldav_updated -> Int4,
        google_to_caldav_deleted -> Int4,
        google_to_caldav_skipped -> Int4,
        caldav_to_google_created -> Int4,
        caldav_to_google_updated -> Int4,
        caldav_to_google_deleted -> Int4,
        caldav_to_google_skipped -> Int4,
    }
}

diesel::table! {
    sync_operations (id) {
        id -> Uuid,
        session_id -> Uuid,
        mapping_id -> Nullable<Uuid>,
        kind -> Text,
        source -> Text,
        target -> Text,
        native_id -> Text,
        summary -> Nullable<Text>,
        success -> Bool,
        error_message -> Nullable<Text>,
        timestamp -> Timestamptz,
    }
}

diesel::table! {
    conflicts (id) {
        id -> Uuid,
        session_id -> Uuid,
        mapping_id -> Nullable<Uuid>,
        google_event_id -> Nullable<Text>,
        caldav_event_id -> Nullable<Text>,
        google_payload -> Nullable<Jsonb>,
        caldav_payload -> Nullable<Jsonb>,
        conflict_kind -> Text,
        resolution -> Nullable<Text>,
        resolved -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(event_mappings -> calendar_pairs (pair_id));
diesel::joinable!(sync_operations -> sync_sessions (session_id));
diesel::joinable!(conflicts -> sync_sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(
    calendar_pairs,
    event_mappings,
    sync_sessions,
    sync_operations,
    conflicts,
);
