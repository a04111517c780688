use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::orchestrator::PipelineOrchestrator;
use crate::{Activity, ActivityId, PipelineError};

/// Observable state exposed to a presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub activity_id: Option<ActivityId>,
    pub is_loading: bool,
    pub error: Option<PipelineError>,
    pub activities: Vec<Activity>,
}

#[derive(Debug, Default)]
struct HandleState {
    snapshot: PipelineSnapshot,
    generation: u64,
}

/// Caller-side binding around [`PipelineOrchestrator`].
///
/// Every load takes a new generation; a result arriving for a superseded
/// generation is returned to its caller but never written into the snapshot.
/// Failed loads keep the last delivered activities and set `error`.
pub struct PipelineHandle {
    orchestrator: Arc<PipelineOrchestrator>,
    state: Mutex<HandleState>,
}

impl PipelineHandle {
    #[must_use]
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self {
            orchestrator,
            state: Mutex::new(HandleState::default()),
        }
    }

    /// Loads the pipeline for `activity_id` and publishes it if still current.
    ///
    /// # Errors
    /// Propagates the orchestrator's error for this request.
    pub async fn load(&self, activity_id: ActivityId) -> Result<Vec<Activity>, PipelineError> {
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.snapshot.activity_id = Some(activity_id.clone());
            state.snapshot.is_loading = true;
            state.generation
        };

        let result = self.orchestrator.get_pipeline(&activity_id).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(
                activity_id = %activity_id,
                generation,
                current = state.generation,
                "discarding superseded pipeline result"
            );
            return result;
        }

        state.snapshot.is_loading = false;
        match &result {
            Ok(activities) => {
                state.snapshot.activities.clone_from(activities);
                state.snapshot.error = None;
            }
            Err(err) => {
                state.snapshot.error = Some(err.clone());
            }
        }
        result
    }

    /// Re-runs the most recently requested id.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when nothing was requested yet,
    /// otherwise whatever [`Self::load`] returns.
    pub async fn refetch(&self) -> Result<Vec<Activity>, PipelineError> {
        let last = self.state.lock().await.snapshot.activity_id.clone();
        let Some(activity_id) = last else {
            return Err(PipelineError::Validation(
                "refetch requires a previously requested activity id".to_string(),
            ));
        };
        self.load(activity_id).await
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.lock().await.snapshot.is_loading
    }

    pub async fn error(&self) -> Option<PipelineError> {
        self.state.lock().await.snapshot.error.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::fixtures::{activity, ids, must};
    use crate::store::{ActivityStore, InMemoryActivityStore};
    use crate::FollowUpRecord;

    fn fixture_store() -> Arc<InMemoryActivityStore> {
        Arc::new(InMemoryActivityStore::new(
            vec![
                activity("a", 1, None),
                activity("a1", 2, Some("a")),
                activity("b", 3, None),
            ],
            Vec::new(),
        ))
    }

    fn handle_for(store: Arc<dyn ActivityStore>) -> PipelineHandle {
        PipelineHandle::new(Arc::new(PipelineOrchestrator::new(store)))
    }

    #[tokio::test]
    async fn refetch_without_previous_request_is_rejected() {
        let handle = handle_for(fixture_store());
        assert!(matches!(
            handle.refetch().await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn refetch_reuses_last_requested_id() {
        let store = fixture_store();
        let handle = handle_for(store.clone());

        must(handle.load(ActivityId::from("a1")).await);
        let again = must(handle.refetch().await);
        assert_eq!(ids(&again), vec!["a", "a1"]);
        assert_eq!(store.call_counts().fetch_all_activities, 2);

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.activity_id, Some(ActivityId::from("a1")));
        assert!(!snapshot.is_loading);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_activities_and_sets_error() {
        let store = fixture_store();
        let handle = handle_for(store.clone());

        must(handle.load(ActivityId::from("a")).await);
        assert!(handle.load(ActivityId::from("missing")).await.is_err());

        let snapshot = handle.snapshot().await;
        assert_eq!(ids(&snapshot.activities), vec!["a", "a1"]);
        assert!(matches!(snapshot.error, Some(PipelineError::NotFound(_))));
        assert!(!handle.is_loading().await);
        assert!(handle.error().await.is_some());
    }

    /// Blocks the first bulk read until released.
    struct GatedStore {
        inner: InMemoryActivityStore,
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ActivityStore for GatedStore {
        async fn fetch_all_activities(&self) -> Result<Vec<Activity>, PipelineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.inner.fetch_all_activities().await
        }

        async fn fetch_follow_ups(
            &self,
            activity_ids: &BTreeSet<ActivityId>,
        ) -> Result<Vec<FollowUpRecord>, PipelineError> {
            self.inner.fetch_follow_ups(activity_ids).await
        }

        async fn fetch_activity_by_id(
            &self,
            id: &ActivityId,
        ) -> Result<Option<Activity>, PipelineError> {
            self.inner.fetch_activity_by_id(id).await
        }

        async fn fetch_children_of(
            &self,
            id: &ActivityId,
        ) -> Result<Vec<Activity>, PipelineError> {
            self.inner.fetch_children_of(id).await
        }
    }

    #[tokio::test]
    async fn last_request_wins_over_slower_earlier_request() {
        let store = Arc::new(GatedStore {
            inner: InMemoryActivityStore::new(
                vec![
                    activity("a", 1, None),
                    activity("a1", 2, Some("a")),
                    activity("b", 3, None),
                ],
                Vec::new(),
            ),
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
        });
        let handle = Arc::new(handle_for(store.clone()));

        let slow = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.load(ActivityId::from("a")).await })
        };
        store.started.notified().await;
        assert!(handle.is_loading().await);

        let fast = must(handle.load(ActivityId::from("b")).await);
        assert_eq!(ids(&fast), vec!["b"]);

        store.release.notify_one();
        let slow_result = match slow.await {
            Ok(result) => must(result),
            Err(err) => panic!("slow load task failed: {err}"),
        };
        assert_eq!(ids(&slow_result), vec!["a", "a1"]);

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.activity_id, Some(ActivityId::from("b")));
        assert_eq!(ids(&snapshot.activities), vec!["b"]);
        assert!(!snapshot.is_loading);
    }
}
