use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::store::ActivityStore;
use crate::{Activity, ActivityId, FollowUp, PipelineError};

/// Result of the annotation step. `error` is set when the follow-up read
/// failed; the activities are then returned with empty `follow_ups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotated {
    pub activities: Vec<Activity>,
    pub error: Option<PipelineError>,
}

/// Attaches follow-ups to every activity of a resolved pipeline using one bulk
/// read. Store order is kept within each activity's group.
pub async fn annotate_follow_ups(store: &dyn ActivityStore, pipeline: Vec<Activity>) -> Annotated {
    let ids: BTreeSet<ActivityId> = pipeline.iter().map(|item| item.id.clone()).collect();

    let records = match store.fetch_follow_ups(&ids).await {
        Ok(records) => records,
        Err(err) => {
            let error = PipelineError::Annotation(err.to_string());
            warn!(
                activities = pipeline.len(),
                error = %error,
                "follow-up load failed; returning pipeline without follow-ups"
            );
            return Annotated {
                activities: clear_follow_ups(pipeline),
                error: Some(error),
            };
        }
    };

    let mut grouped: BTreeMap<ActivityId, Vec<FollowUp>> = BTreeMap::new();
    let total = records.len();
    for record in records {
        grouped
            .entry(record.activity_id.clone())
            .or_default()
            .push(FollowUp::from(record));
    }
    debug!(
        follow_ups = total,
        annotated = grouped.len(),
        "follow-ups grouped"
    );

    let activities = pipeline
        .into_iter()
        .map(|mut activity| {
            activity.follow_ups = grouped.remove(&activity.id).unwrap_or_default();
            activity
        })
        .collect();

    Annotated {
        activities,
        error: None,
    }
}

fn clear_follow_ups(pipeline: Vec<Activity>) -> Vec<Activity> {
    pipeline
        .into_iter()
        .map(|mut activity| {
            activity.follow_ups.clear();
            activity
        })
        .collect()
}
