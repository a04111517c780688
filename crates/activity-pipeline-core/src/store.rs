use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::{Activity, ActivityId, FollowUpRecord, PipelineError};

/// Read boundary the engine consumes. Implementations report every failure as
/// [`PipelineError::StoreUnavailable`]; timeouts are theirs to enforce.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn fetch_all_activities(&self) -> Result<Vec<Activity>, PipelineError>;

    /// Returns follow-ups owned by `activity_ids`, ascending by
    /// `follow_up_date`. An empty id set yields an empty list without I/O.
    async fn fetch_follow_ups(
        &self,
        activity_ids: &BTreeSet<ActivityId>,
    ) -> Result<Vec<FollowUpRecord>, PipelineError>;

    async fn fetch_activity_by_id(
        &self,
        id: &ActivityId,
    ) -> Result<Option<Activity>, PipelineError>;

    async fn fetch_children_of(&self, id: &ActivityId) -> Result<Vec<Activity>, PipelineError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub fetch_all_activities: usize,
    pub fetch_follow_ups: usize,
    pub fetch_activity_by_id: usize,
    pub fetch_children_of: usize,
}

/// Vec-backed store for tests and hosts that already hold records in memory.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    activities: Vec<Activity>,
    follow_ups: Vec<FollowUpRecord>,
    fail_bulk_reads: AtomicBool,
    fail_point_reads: AtomicBool,
    fail_follow_up_reads: AtomicBool,
    fetch_all_calls: AtomicUsize,
    follow_up_calls: AtomicUsize,
    by_id_calls: AtomicUsize,
    children_calls: AtomicUsize,
}

impl InMemoryActivityStore {
    #[must_use]
    pub fn new(activities: Vec<Activity>, follow_ups: Vec<FollowUpRecord>) -> Self {
        Self {
            activities,
            follow_ups,
            ..Self::default()
        }
    }

    /// Makes `fetch_all_activities` fail until reset.
    pub fn set_fail_bulk_reads(&self, fail: bool) {
        self.fail_bulk_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes `fetch_activity_by_id` and `fetch_children_of` fail until reset.
    pub fn set_fail_point_reads(&self, fail: bool) {
        self.fail_point_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_follow_up_reads(&self, fail: bool) {
        self.fail_follow_up_reads.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn call_counts(&self) -> StoreCallCounts {
        StoreCallCounts {
            fetch_all_activities: self.fetch_all_calls.load(Ordering::SeqCst),
            fetch_follow_ups: self.follow_up_calls.load(Ordering::SeqCst),
            fetch_activity_by_id: self.by_id_calls.load(Ordering::SeqCst),
            fetch_children_of: self.children_calls.load(Ordering::SeqCst),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<(), PipelineError> {
        if flag.load(Ordering::SeqCst) {
            return Err(PipelineError::StoreUnavailable(format!(
                "{operation} failed: in-memory store configured to fail"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn fetch_all_activities(&self) -> Result<Vec<Activity>, PipelineError> {
        self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_bulk_reads, "fetch_all_activities")?;
        Ok(self.activities.clone())
    }

    async fn fetch_follow_ups(
        &self,
        activity_ids: &BTreeSet<ActivityId>,
    ) -> Result<Vec<FollowUpRecord>, PipelineError> {
        if activity_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.follow_up_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_follow_up_reads, "fetch_follow_ups")?;

        let mut matched: Vec<FollowUpRecord> = self
            .follow_ups
            .iter()
            .filter(|item| activity_ids.contains(&item.activity_id))
            .cloned()
            .collect();
        matched.sort_by(|lhs, rhs| lhs.follow_up_date.cmp(&rhs.follow_up_date));
        Ok(matched)
    }

    async fn fetch_activity_by_id(
        &self,
        id: &ActivityId,
    ) -> Result<Option<Activity>, PipelineError> {
        self.by_id_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_point_reads, "fetch_activity_by_id")?;
        Ok(self.activities.iter().find(|item| &item.id == id).cloned())
    }

    async fn fetch_children_of(&self, id: &ActivityId) -> Result<Vec<Activity>, PipelineError> {
        self.children_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_point_reads, "fetch_children_of")?;
        Ok(self
            .activities
            .iter()
            .filter(|item| item.parent_activity_id.as_ref() == Some(id))
            .cloned()
            .collect())
    }
}
