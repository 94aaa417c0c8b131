use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use welltrack_protocol::{ItemId, ProtocolEvent, ResultPayload};

use crate::session_key::SessionKey;
use crate::status::{classify, ItemStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: ItemId,
    pub display_name: String,
    pub measurement_count: u64,
    pub has_data: bool,
    pub status: ItemStatus,
    pub is_overridden: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub expected: Option<u64>,
    pub completed: u64,
    pub finished: bool,
}

/// In-memory state for one input location.
///
/// `items` is kept in encounter order; ids are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSession {
    pub session_key: SessionKey,
    pub input_dir: PathBuf,
    pub items: Vec<ItemRecord>,
    pub full_results: BTreeMap<ItemId, ResultPayload>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub progress: BatchProgress,
}

impl AnalysisSession {
    pub fn new(session_key: SessionKey, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_key,
            input_dir: input_dir.into(),
            items: Vec::new(),
            full_results: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
            progress: BatchProgress::default(),
        }
    }

    pub fn item(&self, id: &ItemId) -> Option<&ItemRecord> {
        self.items.iter().find(|record| &record.id == id)
    }

    /// Full results in item encounter order, as written to the cache.
    pub fn results(&self) -> Vec<ResultPayload> {
        self.items
            .iter()
            .filter_map(|record| self.full_results.get(&record.id).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// What one applied protocol event did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub changed: Vec<ItemId>,
    pub full_results: usize,
    pub progress_changed: bool,
}

impl Applied {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.full_results == 0 && !self.progress_changed
    }

    /// Full results were merged, so the cache must be rewritten.
    pub fn needs_save(&self) -> bool {
        self.full_results > 0
    }

    fn record(&mut self, id: &ItemId, outcome: MergeOutcome) {
        if outcome.changed() {
            self.changed.push(id.clone());
        }
    }
}

/// Authoritative per-item state for the live session.
///
/// The store itself is not synchronized; callers funnel every mutation
/// through a single owner.
#[derive(Debug)]
pub struct ItemStateStore {
    session: AnalysisSession,
    index: HashMap<ItemId, usize>,
    overridden: BTreeSet<ItemId>,
}

impl ItemStateStore {
    pub fn new(session_key: SessionKey, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            session: AnalysisSession::new(session_key, input_dir),
            index: HashMap::new(),
            overridden: BTreeSet::new(),
        }
    }

    pub fn for_input(input_dir: &Path) -> Self {
        Self::new(SessionKey::for_input(input_dir), input_dir)
    }

    /// Discards every item and starts a fresh session. Override membership
    /// is kept since it belongs to the parameter set, not the session.
    pub fn reset(&mut self, session_key: SessionKey, input_dir: impl Into<PathBuf>) {
        self.session = AnalysisSession::new(session_key, input_dir);
        self.index.clear();
    }

    pub fn session(&self) -> &AnalysisSession {
        &self.session
    }

    pub fn snapshot(&self) -> AnalysisSession {
        self.session.clone()
    }

    pub fn len(&self) -> usize {
        self.session.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session.items.is_empty()
    }

    pub fn merge_summary(&mut self, summary: &ResultPayload) -> MergeOutcome {
        self.merge_record(summary, OffsetDateTime::now_utc())
    }

    /// Merges a complete payload; it also replaces the stored full result.
    pub fn merge_full_result(&mut self, payload: &ResultPayload) -> MergeOutcome {
        let record_outcome = self.merge_record(payload, OffsetDateTime::now_utc());
        let previous = self
            .session
            .full_results
            .insert(payload.id.clone(), payload.clone());
        match (record_outcome, previous) {
            (MergeOutcome::Inserted, _) => MergeOutcome::Inserted,
            (MergeOutcome::Unchanged, Some(previous)) if previous == *payload => {
                MergeOutcome::Unchanged
            }
            _ => MergeOutcome::Updated,
        }
    }

    /// Applies one parsed event.
    ///
    /// With a `target`, only payloads for that id are merged and batch-level
    /// events are ignored; a single-item invocation never touches siblings.
    pub fn apply_event(&mut self, event: &ProtocolEvent, target: Option<&ItemId>) -> Applied {
        let mut applied = Applied::default();
        let in_scope = |id: &ItemId| target.map_or(true, |target| target == id);

        match event {
            ProtocolEvent::BatchSize(expected) if target.is_none() => {
                applied.progress_changed = self.update_progress(|progress| {
                    progress.expected = Some(*expected);
                });
            }
            ProtocolEvent::Progress(update) if target.is_none() => {
                applied.progress_changed = self.update_progress(|progress| {
                    progress.expected = Some(update.total);
                    progress.completed = update.done;
                });
            }
            ProtocolEvent::BatchFinished { .. } if target.is_none() => {
                applied.progress_changed = self.update_progress(|progress| {
                    progress.finished = true;
                });
            }
            ProtocolEvent::ItemSummary(summary) if in_scope(&summary.id) => {
                let outcome = self.merge_summary(summary);
                applied.record(&summary.id, outcome);
            }
            ProtocolEvent::ItemFullResult(payload) if in_scope(&payload.id) => {
                let outcome = self.merge_full_result(payload);
                applied.record(&payload.id, outcome);
                applied.full_results += 1;
            }
            ProtocolEvent::BatchResults(results) => {
                for payload in results.iter().filter(|payload| in_scope(&payload.id)) {
                    let outcome = self.merge_full_result(payload);
                    applied.record(&payload.id, outcome);
                    applied.full_results += 1;
                }
            }
            ProtocolEvent::ItemSummary(payload) | ProtocolEvent::ItemFullResult(payload) => {
                tracing::debug!(
                    item_id = %payload.id,
                    "ignoring payload outside the invocation scope"
                );
            }
            _ => {}
        }
        applied
    }

    /// Loads cached full results into the current session, in cache order.
    pub fn hydrate(&mut self, results: &[ResultPayload]) -> Applied {
        let mut applied = Applied::default();
        for payload in results {
            let outcome = self.merge_full_result(payload);
            applied.record(&payload.id, outcome);
        }
        let total = self.len() as u64;
        applied.progress_changed = self.update_progress(|progress| {
            progress.expected = Some(total);
            progress.completed = total;
            progress.finished = true;
        });
        applied
    }

    /// Replaces override membership and refreshes every affected record.
    pub fn sync_overrides(&mut self, overridden: BTreeSet<ItemId>) -> Vec<ItemId> {
        self.overridden = overridden;
        let now = OffsetDateTime::now_utc();
        let mut changed = Vec::new();
        for record in &mut self.session.items {
            let is_overridden = self.overridden.contains(&record.id);
            if record.is_overridden != is_overridden {
                record.is_overridden = is_overridden;
                record.last_updated_at = now;
                changed.push(record.id.clone());
            }
        }
        changed
    }

    fn update_progress(&mut self, update: impl FnOnce(&mut BatchProgress)) -> bool {
        let before = self.session.progress;
        update(&mut self.session.progress);
        before != self.session.progress
    }

    fn merge_record(&mut self, payload: &ResultPayload, now: OffsetDateTime) -> MergeOutcome {
        let status = classify(payload);
        let is_overridden = self.overridden.contains(&payload.id);

        let Some(&position) = self.index.get(&payload.id) else {
            let measurement_count = payload.measurement_count.unwrap_or(0);
            self.index.insert(payload.id.clone(), self.session.items.len());
            self.session.items.push(ItemRecord {
                id: payload.id.clone(),
                display_name: payload
                    .display_name
                    .clone()
                    .unwrap_or_else(|| payload.id.to_string()),
                measurement_count,
                has_data: payload.has_data.unwrap_or(measurement_count > 0),
                status,
                is_overridden,
                last_updated_at: now,
            });
            return MergeOutcome::Inserted;
        };

        let record = &mut self.session.items[position];
        let mut next = record.clone();
        if let Some(display_name) = &payload.display_name {
            next.display_name = display_name.clone();
        }
        if let Some(measurement_count) = payload.measurement_count {
            next.measurement_count = measurement_count;
        }
        if let Some(has_data) = payload.has_data {
            next.has_data = has_data;
        }
        next.status = status;
        next.is_overridden = is_overridden;

        if next == *record {
            return MergeOutcome::Unchanged;
        }
        next.last_updated_at = now;
        *record = next;
        MergeOutcome::Updated
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use welltrack_protocol::{ItemId, ProgressEvent, ProtocolEvent, ResultPayload};

    use super::{ItemStateStore, MergeOutcome};
    use crate::session_key::SessionKey;
    use crate::status::ItemStatus;

    fn store() -> ItemStateStore {
        ItemStateStore::new(SessionKey::new("plate-7"), "/data/plate-7")
    }

    fn summary(id: &str, count: u64) -> ResultPayload {
        ResultPayload {
            measurement_count: Some(count),
            has_data: Some(true),
            ..ResultPayload::new(id)
        }
    }

    #[test]
    fn applying_the_same_summary_twice_is_idempotent() {
        let mut store = store();
        let payload = summary("A01", 500);

        assert_eq!(store.merge_summary(&payload), MergeOutcome::Inserted);
        let once = store.snapshot();
        assert_eq!(store.merge_summary(&payload), MergeOutcome::Unchanged);

        assert_eq!(store.snapshot(), once);
    }

    #[test]
    fn full_result_supersedes_summary_status() {
        let mut store = store();
        store.merge_summary(&summary("A01", 500));
        store.merge_full_result(&ResultPayload {
            deviation_detected: true,
            ..summary("A01", 500)
        });

        let record = store.session().item(&ItemId::new("A01")).expect("record");
        assert_eq!(record.status, ItemStatus::Deviation);
        assert_eq!(store.session().full_results.len(), 1);
    }

    #[test]
    fn later_summary_still_wins_over_earlier_full_result() {
        let mut store = store();
        store.merge_full_result(&ResultPayload {
            buffer_zone: true,
            ..summary("B02", 900)
        });
        store.merge_summary(&summary("B02", 40));

        let record = store.session().item(&ItemId::new("B02")).expect("record");
        assert_eq!(record.status, ItemStatus::Warning);
        assert_eq!(record.measurement_count, 40);
    }

    #[test]
    fn duplicate_summary_updates_in_place() {
        let mut store = store();
        store.merge_summary(&summary("A01", 500));
        store.merge_summary(&summary("B01", 500));
        store.merge_summary(&ResultPayload {
            display_name: Some("NTC".to_owned()),
            ..summary("A01", 20)
        });

        let ids = store
            .session()
            .items
            .iter()
            .map(|record| record.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["A01", "B01"]);
        let record = &store.session().items[0];
        assert_eq!(record.display_name, "NTC");
        assert_eq!(record.status, ItemStatus::Warning);
    }

    #[test]
    fn targeted_apply_ignores_siblings_and_batch_events() {
        let mut store = store();
        store.merge_summary(&summary("A01", 500));
        let before = store.session().item(&ItemId::new("A01")).cloned();
        let target = ItemId::new("B01");

        let applied = store.apply_event(
            &ProtocolEvent::BatchResults(vec![summary("A01", 5), summary("B01", 5)]),
            Some(&target),
        );
        store.apply_event(&ProtocolEvent::BatchSize(96), Some(&target));

        assert_eq!(applied.changed, vec![target.clone()]);
        assert_eq!(applied.full_results, 1);
        assert_eq!(store.session().item(&ItemId::new("A01")).cloned(), before);
        assert_eq!(store.session().progress.expected, None);
    }

    #[test]
    fn progress_events_update_batch_progress() {
        let mut store = store();
        store.apply_event(&ProtocolEvent::BatchSize(8), None);
        store.apply_event(
            &ProtocolEvent::Progress(ProgressEvent { done: 3, total: 8 }),
            None,
        );
        let applied = store.apply_event(
            &ProtocolEvent::BatchFinished {
                message: String::new(),
            },
            None,
        );

        assert!(applied.progress_changed);
        let progress = store.session().progress;
        assert_eq!(progress.expected, Some(8));
        assert_eq!(progress.completed, 3);
        assert!(progress.finished);
    }

    #[test]
    fn override_membership_drives_is_overridden() {
        let mut store = store();
        store.merge_summary(&summary("A01", 500));
        store.merge_summary(&summary("B01", 500));

        let changed = store.sync_overrides(BTreeSet::from([ItemId::new("B01")]));
        assert_eq!(changed, vec![ItemId::new("B01")]);
        store.merge_summary(&summary("C01", 500));

        let flags = store
            .session()
            .items
            .iter()
            .map(|record| (record.id.as_str(), record.is_overridden))
            .collect::<Vec<_>>();
        assert_eq!(flags, [("A01", false), ("B01", true), ("C01", false)]);

        store.sync_overrides(BTreeSet::new());
        assert!(store.session().items.iter().all(|record| !record.is_overridden));
    }

    #[test]
    fn hydrate_keeps_cache_order_and_marks_batch_finished() {
        let mut store = store();
        let results = vec![summary("H12", 300), summary("A01", 300)];
        store.hydrate(&results);

        assert_eq!(store.session().results(), results);
        assert!(store.session().progress.finished);
        assert_eq!(store.session().progress.completed, 2);
    }

    #[test]
    fn reset_discards_items() {
        let mut store = store();
        store.merge_full_result(&summary("A01", 500));
        store.reset(SessionKey::new("plate-8"), "/data/plate-8");

        assert!(store.is_empty());
        assert!(store.session().full_results.is_empty());
        assert_eq!(store.session().session_key, SessionKey::new("plate-8"));
    }
}
