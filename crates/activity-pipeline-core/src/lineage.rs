use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use tracing::debug;

use crate::store::ActivityStore;
use crate::{sort_chronologically, Activity, ActivityId, PipelineError, StrategyKind};

/// One way of turning a start id into its full, date-ordered lineage.
#[async_trait]
pub trait LineageStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Resolves ancestors and descendants of `start_id`.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] when `start_id` is unknown and
    /// [`PipelineError::StoreUnavailable`] when a read fails.
    async fn resolve(
        &self,
        store: &dyn ActivityStore,
        start_id: &ActivityId,
    ) -> Result<Vec<Activity>, PipelineError>;
}

/// Resolves the lineage of `start_id` within an already loaded activity set.
///
/// Ancestors are collected root-first by following `parent_activity_id` until
/// the parent is absent, missing from `activities`, or already visited.
/// Descendants are then discovered breadth-first. The combined set is sorted
/// by `activity_date` (ties by id). When `activities` holds duplicate ids the
/// first occurrence wins.
///
/// # Errors
/// Returns [`PipelineError::NotFound`] when `start_id` is not in `activities`.
pub fn resolve_lineage(
    start_id: &ActivityId,
    activities: &[Activity],
) -> Result<Vec<Activity>, PipelineError> {
    let mut by_id: BTreeMap<&ActivityId, &Activity> = BTreeMap::new();
    let mut children: BTreeMap<&ActivityId, Vec<&Activity>> = BTreeMap::new();
    for activity in activities {
        let Entry::Vacant(slot) = by_id.entry(&activity.id) else {
            continue;
        };
        slot.insert(activity);
        if let Some(parent_id) = &activity.parent_activity_id {
            children.entry(parent_id).or_default().push(activity);
        }
    }

    let start = *by_id
        .get(start_id)
        .ok_or_else(|| PipelineError::NotFound(start_id.clone()))?;

    let mut visited: BTreeSet<&ActivityId> = BTreeSet::new();
    visited.insert(&start.id);

    let mut path_to_root = vec![start];
    let mut current = start;
    while let Some(parent_id) = &current.parent_activity_id {
        if visited.contains(parent_id) {
            break;
        }
        let Some(parent) = by_id.get(parent_id).copied() else {
            break;
        };
        visited.insert(&parent.id);
        path_to_root.push(parent);
        current = parent;
    }
    path_to_root.reverse();

    let mut descendants = Vec::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for child in children.get(&node.id).into_iter().flatten() {
            if visited.insert(&child.id) {
                descendants.push(*child);
                queue.push_back(*child);
            }
        }
    }

    let mut pipeline: Vec<Activity> = path_to_root
        .into_iter()
        .chain(descendants)
        .cloned()
        .collect();
    sort_chronologically(&mut pipeline);
    Ok(pipeline)
}

/// Loads the whole collection with one bulk read and resolves in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizedStrategy;

#[async_trait]
impl LineageStrategy for OptimizedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Optimized
    }

    async fn resolve(
        &self,
        store: &dyn ActivityStore,
        start_id: &ActivityId,
    ) -> Result<Vec<Activity>, PipelineError> {
        let activities = store.fetch_all_activities().await?;
        debug!(
            strategy = "optimized",
            loaded = activities.len(),
            "bulk activity load complete"
        );
        resolve_lineage(start_id, &activities)
    }
}

/// Walks the lineage with one store read per traversal step.
///
/// Descendants are discovered depth-first in pre-order, using an explicit
/// stack of child lists so deep chains cannot exhaust the call stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalStrategy;

#[async_trait]
impl LineageStrategy for OriginalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Original
    }

    async fn resolve(
        &self,
        store: &dyn ActivityStore,
        start_id: &ActivityId,
    ) -> Result<Vec<Activity>, PipelineError> {
        let start = store
            .fetch_activity_by_id(start_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(start_id.clone()))?;

        let mut visited: BTreeSet<ActivityId> = BTreeSet::new();
        visited.insert(start.id.clone());

        let mut path_to_root = Vec::new();
        let mut next_parent = start.parent_activity_id.clone();
        while let Some(parent_id) = next_parent.take() {
            if visited.contains(&parent_id) {
                break;
            }
            let Some(parent) = store.fetch_activity_by_id(&parent_id).await? else {
                break;
            };
            visited.insert(parent.id.clone());
            next_parent.clone_from(&parent.parent_activity_id);
            path_to_root.push(parent);
        }
        path_to_root.reverse();

        let mut descendants = Vec::new();
        let mut stack = vec![store.fetch_children_of(&start.id).await?.into_iter()];
        while let Some(frame) = stack.last_mut() {
            let Some(child) = frame.next() else {
                stack.pop();
                continue;
            };
            if !visited.insert(child.id.clone()) {
                continue;
            }
            let grandchildren = store.fetch_children_of(&child.id).await?;
            descendants.push(child);
            stack.push(grandchildren.into_iter());
        }

        debug!(
            strategy = "original",
            ancestors = path_to_root.len(),
            descendants = descendants.len(),
            "per-node walk complete"
        );

        path_to_root.push(start);
        let mut pipeline: Vec<Activity> = path_to_root.into_iter().chain(descendants).collect();
        sort_chronologically(&mut pipeline);
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{activity, ids, must};
    use crate::store::InMemoryActivityStore;
    use proptest::prelude::*;

    fn chain() -> Vec<Activity> {
        vec![
            activity("root", 1, None),
            activity("a", 2, Some("root")),
            activity("b", 3, Some("a")),
            activity("c", 4, Some("b")),
        ]
    }

    #[test]
    fn ancestors_are_complete_and_date_ordered() {
        let pipeline = must(resolve_lineage(&ActivityId::from("c"), &chain()));
        assert_eq!(ids(&pipeline), vec!["root", "a", "b", "c"]);
    }

    #[test]
    fn descendants_cover_every_branch() {
        let activities = vec![
            activity("root", 1, None),
            activity("a", 3, Some("root")),
            activity("b", 2, Some("root")),
            activity("a1", 4, Some("a")),
        ];
        let pipeline = must(resolve_lineage(&ActivityId::from("root"), &activities));
        assert_eq!(ids(&pipeline), vec!["root", "b", "a", "a1"]);
    }

    #[test]
    fn siblings_of_the_start_are_not_descendants() {
        let activities = vec![
            activity("root", 1, None),
            activity("a", 2, Some("root")),
            activity("b", 3, Some("root")),
        ];
        let pipeline = must(resolve_lineage(&ActivityId::from("a"), &activities));
        assert_eq!(ids(&pipeline), vec!["root", "a"]);
    }

    #[test]
    fn two_node_cycle_terminates_with_each_node_once() {
        let activities = vec![activity("a", 1, Some("b")), activity("b", 2, Some("a"))];
        for start in ["a", "b"] {
            let pipeline = must(resolve_lineage(&ActivityId::from(start), &activities));
            assert_eq!(ids(&pipeline), vec!["a", "b"]);
        }
    }

    #[test]
    fn self_parent_is_treated_as_root() {
        let activities = vec![activity("a", 1, Some("a")), activity("b", 2, Some("a"))];
        let pipeline = must(resolve_lineage(&ActivityId::from("a"), &activities));
        assert_eq!(ids(&pipeline), vec!["a", "b"]);
    }

    #[test]
    fn broken_parent_reference_is_an_effective_root() {
        let activities = vec![
            activity("orphan", 1, Some("missing")),
            activity("child", 2, Some("orphan")),
        ];
        let pipeline = must(resolve_lineage(&ActivityId::from("child"), &activities));
        assert_eq!(ids(&pipeline), vec!["orphan", "child"]);
    }

    #[test]
    fn missing_start_is_not_found() {
        let err = resolve_lineage(&ActivityId::from("does-not-exist"), &chain());
        assert_eq!(
            err,
            Err(PipelineError::NotFound(ActivityId::from("does-not-exist")))
        );
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let mut shadow = activity("a", 9, None);
        shadow.activity_type = "shadow".to_string();
        let activities = vec![activity("a", 1, None), shadow];
        let pipeline = must(resolve_lineage(&ActivityId::from("a"), &activities));
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline[0].activity_type, "call");
    }

    #[tokio::test]
    async fn optimized_strategy_issues_one_bulk_read() {
        let store = InMemoryActivityStore::new(chain(), Vec::new());
        let pipeline = must(OptimizedStrategy.resolve(&store, &ActivityId::from("b")).await);
        assert_eq!(ids(&pipeline), vec!["root", "a", "b", "c"]);

        let counts = store.call_counts();
        assert_eq!(counts.fetch_all_activities, 1);
        assert_eq!(counts.fetch_activity_by_id, 0);
        assert_eq!(counts.fetch_children_of, 0);
    }

    #[tokio::test]
    async fn original_strategy_reads_once_per_step() {
        let store = InMemoryActivityStore::new(chain(), Vec::new());
        let pipeline = must(OriginalStrategy.resolve(&store, &ActivityId::from("b")).await);
        assert_eq!(ids(&pipeline), vec!["root", "a", "b", "c"]);

        let counts = store.call_counts();
        assert_eq!(counts.fetch_all_activities, 0);
        // b, a, root; root has no parent so the walk stops without a lookup.
        assert_eq!(counts.fetch_activity_by_id, 3);
        // b, then c.
        assert_eq!(counts.fetch_children_of, 2);
    }

    #[tokio::test]
    async fn original_strategy_survives_cycles() {
        let activities = vec![
            activity("a", 1, Some("c")),
            activity("b", 2, Some("a")),
            activity("c", 3, Some("b")),
        ];
        let store = InMemoryActivityStore::new(activities, Vec::new());
        let pipeline = must(OriginalStrategy.resolve(&store, &ActivityId::from("b")).await);
        assert_eq!(ids(&pipeline), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn original_strategy_handles_deep_chains() {
        let depth = 5_000_u32;
        let base = crate::fixtures::must_utc("2026-01-01T00:00:00Z");
        let activities: Vec<Activity> = (0..depth)
            .map(|index| {
                let parent = index.checked_sub(1).map(|value| format!("n{value}"));
                Activity::new(
                    format!("n{index}"),
                    base + time::Duration::minutes(i64::from(index)),
                    "call",
                    parent.as_deref(),
                )
            })
            .collect();
        let store = InMemoryActivityStore::new(activities, Vec::new());
        let pipeline = must(OriginalStrategy.resolve(&store, &ActivityId::from("n0")).await);
        assert_eq!(pipeline.len(), 5_000);
    }

    #[tokio::test]
    async fn original_strategy_reports_missing_start() {
        let store = InMemoryActivityStore::new(chain(), Vec::new());
        let err = OriginalStrategy
            .resolve(&store, &ActivityId::from("does-not-exist"))
            .await;
        assert!(matches!(err, Err(PipelineError::NotFound(_))));
    }

    /// Random forest over `size` nodes: each node points at an earlier node,
    /// at a dangling id, or nowhere. Optional back-edges introduce cycles.
    fn forest(parents: &[(u8, u8)], day_offsets: &[u8], with_cycles: bool) -> Vec<Activity> {
        let base = crate::fixtures::must_utc("2026-01-01T00:00:00Z");
        parents
            .iter()
            .enumerate()
            .map(|(index, (kind, pick))| {
                let parent = match kind % 4 {
                    0 => None,
                    1 => Some("dangling".to_string()),
                    2 if index > 0 => Some(format!("n{}", usize::from(*pick) % index)),
                    3 if with_cycles => Some(format!("n{}", usize::from(*pick) % parents.len())),
                    _ => None,
                };
                let offset = day_offsets.get(index).copied().unwrap_or_default();
                Activity::new(
                    format!("n{index}"),
                    base + time::Duration::hours(i64::from(offset)),
                    "call",
                    parent.as_deref(),
                )
            })
            .collect()
    }

    fn run_both(activities: Vec<Activity>, start: usize) -> (Vec<Activity>, Vec<Activity>) {
        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(value) => value,
            Err(err) => panic!("failed to build runtime: {err}"),
        };
        let store = InMemoryActivityStore::new(activities, Vec::new());
        let start_id = ActivityId::new(format!("n{start}"));
        runtime.block_on(async {
            let optimized = must(OptimizedStrategy.resolve(&store, &start_id).await);
            let original = must(OriginalStrategy.resolve(&store, &start_id).await);
            (optimized, original)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_strategies_agree_on_forests(
            parents in prop::collection::vec((0u8..4, any::<u8>()), 1..40),
            days in prop::collection::vec(0u8..24, 40),
            start in any::<usize>(),
        ) {
            let activities = forest(&parents, &days, false);
            let start = start % activities.len();
            let (optimized, original) = run_both(activities, start);
            prop_assert_eq!(optimized, original);
        }

        #[test]
        fn prop_cyclic_data_terminates_without_duplicates(
            parents in prop::collection::vec((0u8..4, any::<u8>()), 1..40),
            days in prop::collection::vec(0u8..24, 40),
            start in any::<usize>(),
        ) {
            let activities = forest(&parents, &days, true);
            let start = start % activities.len();
            let (optimized, original) = run_both(activities, start);
            let unique: BTreeSet<_> = optimized.iter().map(|item| item.id.clone()).collect();
            prop_assert_eq!(unique.len(), optimized.len());
            prop_assert_eq!(optimized, original);
        }
    }
}
