//! Calendar discovery and pair materialization.
//!
//! Matching runs in a fixed order: explicitly configured pairs (by id, then
//! by case-insensitive name), exact case-insensitive name matches among the
//! rest, substring similarity at or above 0.8, and finally an optional
//! mapping of leftover CalDAV calendars onto Google's primary. Pair rows
//! are created with null tokens so the first pass arms them.

use std::collections::HashSet;

use calbridge_core::config::SyncConfig;
use calbridge_core::types::{CalendarInfo, SyncDirection};
use calbridge_db::model::pair::CalendarPair;

use crate::adapter::CalendarAdapter;
use crate::error::{ServiceError, ServiceResult};
use crate::store::{PairDraft, SyncStore};

const SIMILARITY_THRESHOLD: f64 = 0.8;

/// ## Summary
/// Discovers calendars on both services in parallel and materializes pair
/// rows for them. Existing rows win; discovery only fills the gaps.
///
/// ## Errors
/// Returns an error on discovery failure, duplicate calendar ids across
/// pairs, or store failures.
#[tracing::instrument(skip_all)]
pub async fn materialize_pairs<G, C, S>(
    google: &G,
    caldav: &C,
    store: &S,
    config: &SyncConfig,
) -> ServiceResult<Vec<CalendarPair>>
where
    G: CalendarAdapter,
    C: CalendarAdapter,
    S: SyncStore,
{
    let existing = store.list_enabled_pairs().await?;
    if !existing.is_empty() {
        tracing::info!(count = existing.len(), "Using existing calendar pairs");
        return Ok(existing);
    }

    let (google_result, caldav_result) =
        tokio::join!(google.list_calendars(), caldav.list_calendars());
    let google_calendars = google_result?;
    let caldav_calendars = caldav_result?;
    tracing::info!(
        google = google_calendars.len(),
        caldav = caldav_calendars.len(),
        "Discovered calendars"
    );

    let drafts = match_calendars(&google_calendars, &caldav_calendars, config)?;
    if drafts.is_empty() {
        tracing::warn!("No calendar pairs could be matched");
    }

    let mut pairs = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let pair = match store
            .find_pair(&draft.google_calendar_id, &draft.caldav_calendar_id)
            .await?
        {
            Some(found) => found,
            None => {
                tracing::info!(
                    google = %draft.google_calendar_id,
                    caldav = %draft.caldav_calendar_id,
                    "Creating calendar pair"
                );
                store.insert_pair(draft).await?
            }
        };
        pairs.push(pair);
    }
    Ok(pairs)
}

/// ## Summary
/// Pure matching over discovered calendar lists per the configured policy.
///
/// ## Errors
/// Returns `InvalidConfiguration` when a calendar id appears in more than
/// one pair.
pub fn match_calendars(
    google_calendars: &[CalendarInfo],
    caldav_calendars: &[CalendarInfo],
    config: &SyncConfig,
) -> ServiceResult<Vec<PairDraft>> {
    let mut drafts: Vec<PairDraft> = Vec::new();
    let mut used_google: HashSet<String> = HashSet::new();
    let mut used_caldav: HashSet<String> = HashSet::new();

    // 1. Explicitly configured pairs, by id then case-insensitive name
    for configured in &config.pairs {
        if !configured.enabled {
            continue;
        }
        let google = find_calendar(google_calendars, &configured.google_calendar_id);
        let caldav = find_calendar(caldav_calendars, &configured.caldav_calendar_id);
        match (google, caldav) {
            (Some(google), Some(caldav)) => {
                used_google.insert(google.id.clone());
                used_caldav.insert(caldav.id.clone());
                drafts.push(PairDraft {
                    google_calendar_id: google.id.clone(),
                    caldav_calendar_id: caldav.id.clone(),
                    google_calendar_name: Some(google.name.clone()),
                    caldav_calendar_name: Some(caldav.name.clone()),
                    direction: configured.direction,
                    enabled: true,
                    conflict_policy: configured.conflict_policy,
                });
            }
            _ => {
                tracing::warn!(
                    google = %configured.google_calendar_id,
                    caldav = %configured.caldav_calendar_id,
                    "Configured pair references unknown calendars, skipping"
                );
            }
        }
    }

    // 2. Exact case-insensitive name matches among the remainder
    for google in google_calendars {
        if used_google.contains(&google.id) {
            continue;
        }
        if let Some(caldav) = caldav_calendars.iter().find(|c| {
            !used_caldav.contains(&c.id) && c.name.eq_ignore_ascii_case(&google.name)
        }) {
            used_google.insert(google.id.clone());
            used_caldav.insert(caldav.id.clone());
            drafts.push(auto_draft(google, caldav));
            tracing::info!(name = %google.name, "Matched calendars by name");
        }
    }

    // 3. Substring similarity
    for google in google_calendars {
        if used_google.contains(&google.id) {
            continue;
        }
        let best = caldav_calendars
            .iter()
            .filter(|c| !used_caldav.contains(&c.id))
            .filter_map(|c| {
                let score = name_similarity(&google.name, &c.name);
                (score >= SIMILARITY_THRESHOLD).then_some((c, score))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((caldav, score)) = best {
            used_google.insert(google.id.clone());
            used_caldav.insert(caldav.id.clone());
            tracing::info!(
                google = %google.name,
                caldav = %caldav.name,
                score,
                "Matched calendars by similarity"
            );
            drafts.push(auto_draft(google, caldav));
        }
    }

    // Duplicate ids are rejected before the leftover step, which is
    // allowed to reuse the primary across several pairs
    reject_duplicates(&drafts)?;

    // 4. Leftover CalDAV calendars onto Google's primary, when enabled
    if config.match_leftover_to_primary {
        if let Some(primary) = google_calendars.iter().find(|c| c.is_primary) {
            for caldav in caldav_calendars {
                if used_caldav.contains(&caldav.id) {
                    continue;
                }
                used_caldav.insert(caldav.id.clone());
                drafts.push(auto_draft(primary, caldav));
            }
        }
    }

    Ok(drafts)
}

fn auto_draft(google: &CalendarInfo, caldav: &CalendarInfo) -> PairDraft {
    PairDraft {
        google_calendar_id: google.id.clone(),
        caldav_calendar_id: caldav.id.clone(),
        google_calendar_name: Some(google.name.clone()),
        caldav_calendar_name: Some(caldav.name.clone()),
        direction: SyncDirection::Bidirectional,
        enabled: true,
        conflict_policy: None,
    }
}

fn find_calendar<'a>(calendars: &'a [CalendarInfo], key: &str) -> Option<&'a CalendarInfo> {
    calendars
        .iter()
        .find(|c| c.id == key)
        .or_else(|| calendars.iter().find(|c| c.name.eq_ignore_ascii_case(key)))
}

/// Containment-based similarity: length ratio when one name contains the
/// other (case-insensitive), else 0
#[expect(clippy::cast_precision_loss)]
fn name_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if !(a.contains(&b) || b.contains(&a)) {
        return 0.0;
    }
    let longer = a.len().max(b.len()) as f64;
    let shorter = a.len().min(b.len()) as f64;
    shorter / longer
}

fn reject_duplicates(drafts: &[PairDraft]) -> ServiceResult<()> {
    let mut google_ids = HashSet::new();
    let mut caldav_ids = HashSet::new();
    for draft in drafts {
        if !google_ids.insert(&draft.google_calendar_id) {
            return Err(ServiceError::InvalidConfiguration(format!(
                "Google calendar {} appears in more than one pair",
                draft.google_calendar_id
            )));
        }
        if !caldav_ids.insert(&draft.caldav_calendar_id) {
            return Err(ServiceError::InvalidConfiguration(format!(
                "CalDAV calendar {} appears in more than one pair",
                draft.caldav_calendar_id
            )));
        }
    }
    Ok(())
}
