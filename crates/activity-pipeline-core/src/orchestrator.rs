use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::annotate::annotate_follow_ups;
use crate::lineage::{LineageStrategy, OptimizedStrategy, OriginalStrategy};
use crate::store::ActivityStore;
use crate::{Activity, ActivityId, PipelineConfig, PipelineError, StrategyKind};

/// Labels for the `pipeline state transition` debug events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineState {
    Idle,
    TryOptimized,
    TryOriginal,
    Annotate,
    Done,
    Failed,
}

/// A completed reconstruction plus the diagnostics gathered on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    pub start_id: ActivityId,
    pub strategy: StrategyKind,
    pub activities: Vec<Activity>,
    /// Optimized-tier failure that caused the fallback, if any.
    pub fallback_error: Option<PipelineError>,
    pub annotation_error: Option<PipelineError>,
}

enum Step {
    Idle,
    TryOptimized,
    TryOriginal {
        optimized_error: Option<PipelineError>,
    },
    Annotate {
        strategy: StrategyKind,
        pipeline: Vec<Activity>,
        fallback_error: Option<PipelineError>,
    },
    Done(PipelineRun),
    Failed(PipelineError),
}

impl Step {
    fn state(&self) -> PipelineState {
        match self {
            Self::Idle => PipelineState::Idle,
            Self::TryOptimized => PipelineState::TryOptimized,
            Self::TryOriginal { .. } => PipelineState::TryOriginal,
            Self::Annotate { .. } => PipelineState::Annotate,
            Self::Done(_) => PipelineState::Done,
            Self::Failed(_) => PipelineState::Failed,
        }
    }
}

/// Public entry point: optimized strategy first, original strategy once on
/// failure, then follow-up annotation.
pub struct PipelineOrchestrator {
    store: Arc<dyn ActivityStore>,
    optimized: Box<dyn LineageStrategy>,
    original: Box<dyn LineageStrategy>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self {
            store,
            optimized: Box::new(OptimizedStrategy),
            original: Box::new(OriginalStrategy),
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces both tiers, e.g. to inject failing strategies in tests.
    #[must_use]
    pub fn with_strategies(
        mut self,
        optimized: Box<dyn LineageStrategy>,
        original: Box<dyn LineageStrategy>,
    ) -> Self {
        self.optimized = optimized;
        self.original = original;
        self
    }

    /// Returns the annotated, date-ordered pipeline containing `start_id`.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] when the start id is unknown, or the
    /// original strategy's error when both tiers fail.
    pub async fn get_pipeline(&self, start_id: &ActivityId) -> Result<Vec<Activity>, PipelineError> {
        self.run(start_id).await.map(|run| run.activities)
    }

    /// Like [`Self::get_pipeline`] but keeps the tier that served the call and
    /// any swallowed errors.
    ///
    /// # Errors
    /// Same as [`Self::get_pipeline`].
    pub async fn run(&self, start_id: &ActivityId) -> Result<PipelineRun, PipelineError> {
        self.drive(start_id, Step::Idle, self.config.fallback_enabled)
            .await
    }

    /// Runs a single tier in isolation, with no fallback.
    ///
    /// # Errors
    /// Returns the chosen strategy's error unchanged.
    pub async fn run_strategy(
        &self,
        strategy: StrategyKind,
        start_id: &ActivityId,
    ) -> Result<PipelineRun, PipelineError> {
        let initial = match strategy {
            StrategyKind::Optimized => Step::TryOptimized,
            StrategyKind::Original => Step::TryOriginal {
                optimized_error: None,
            },
        };
        self.drive(start_id, initial, false).await
    }

    async fn drive(
        &self,
        start_id: &ActivityId,
        initial: Step,
        fallback_enabled: bool,
    ) -> Result<PipelineRun, PipelineError> {
        let mut step = initial;
        loop {
            let from = step.state();
            step = match step {
                Step::Idle => Step::TryOptimized,
                Step::TryOptimized => match self.attempt(self.optimized.as_ref(), start_id).await {
                    Ok(pipeline) => Step::Annotate {
                        strategy: StrategyKind::Optimized,
                        pipeline,
                        fallback_error: None,
                    },
                    Err(err @ PipelineError::NotFound(_)) => Step::Failed(err),
                    Err(err) if fallback_enabled => {
                        warn!(
                            start_id = %start_id,
                            error = %err,
                            "optimized strategy failed; falling back to original strategy"
                        );
                        Step::TryOriginal {
                            optimized_error: Some(err),
                        }
                    }
                    Err(err) => Step::Failed(err),
                },
                Step::TryOriginal { optimized_error } => {
                    match self.attempt(self.original.as_ref(), start_id).await {
                        Ok(pipeline) => Step::Annotate {
                            strategy: StrategyKind::Original,
                            pipeline,
                            fallback_error: optimized_error,
                        },
                        Err(err) => Step::Failed(err),
                    }
                }
                Step::Annotate {
                    strategy,
                    pipeline,
                    fallback_error,
                } => {
                    let annotated = annotate_follow_ups(self.store.as_ref(), pipeline).await;
                    let follow_ups: usize = annotated
                        .activities
                        .iter()
                        .map(|item| item.follow_ups.len())
                        .sum();
                    info!(
                        start_id = %start_id,
                        strategy = %strategy,
                        activities = annotated.activities.len(),
                        follow_ups,
                        "pipeline reconstructed"
                    );
                    Step::Done(PipelineRun {
                        start_id: start_id.clone(),
                        strategy,
                        activities: annotated.activities,
                        fallback_error,
                        annotation_error: annotated.error,
                    })
                }
                Step::Done(run) => return Ok(run),
                Step::Failed(err) => {
                    error!(start_id = %start_id, error = %err, "pipeline reconstruction failed");
                    return Err(err);
                }
            };
            debug!(from = ?from, to = ?step.state(), "pipeline state transition");
        }
    }

    async fn attempt(
        &self,
        strategy: &dyn LineageStrategy,
        start_id: &ActivityId,
    ) -> Result<Vec<Activity>, PipelineError> {
        info!(start_id = %start_id, strategy = %strategy.kind(), "resolving lineage");
        let pipeline = strategy.resolve(self.store.as_ref(), start_id).await?;
        info!(
            start_id = %start_id,
            strategy = %strategy.kind(),
            activities = pipeline.len(),
            "lineage resolved"
        );
        Ok(pipeline)
    }
}
