//! Sequential stage orchestration.
//!
//! Runs every registry stage in order, threading each output into the
//! next stage, and owns the in-memory [`PipelineRun`] for the duration of
//! the run. Status reporting happens only here: once per attempt start
//! and once per stage settle.

use super::{AttemptObserver, Attempted, RetryExecutor, StageDefinition, StageRegistry};
use crate::core::{PipelineRun, StatusPatch};
use crate::errors::{AttemptError, EvalflowError, PipelineFailedError, RegistryValidationError};
use crate::observability::{run_span, stage_span};
use crate::reporting::{report_best_effort, NoOpStatusReporter, StatusReporter};
use crate::stages::StageHandler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

/// The result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutput<T> {
    /// The last stage's output.
    pub output: T,
    /// The final run record.
    pub run: PipelineRun,
}

impl<T> RunOutput<T> {
    /// Returns true if any stage settled with its fallback value.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.run.used_fallback()
    }
}

/// Runs the stages of a [`StageRegistry`] with retry, timeout and fallback.
///
/// The orchestrator holds no per-run state, so one instance may serve any
/// number of concurrent runs.
pub struct PipelineOrchestrator<T: Send + 'static> {
    registry: StageRegistry,
    handlers: Vec<Arc<dyn StageHandler<T>>>,
    reporter: Arc<dyn StatusReporter>,
    executor: RetryExecutor,
}

impl<T: Send + 'static> fmt::Debug for PipelineOrchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.registry.names())
            .field("executor", &self.executor)
            .finish()
    }
}

impl<T> PipelineOrchestrator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts building an orchestrator over a registry.
    #[must_use]
    pub fn builder(registry: StageRegistry) -> OrchestratorBuilder<T> {
        OrchestratorBuilder::new(registry)
    }

    /// Returns the stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Returns the retry executor.
    #[must_use]
    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Upper bound on how long a single run can take.
    #[must_use]
    pub fn worst_case_duration(&self) -> Duration {
        self.registry.worst_case_duration(self.executor.max_jitter())
    }

    /// Runs every stage in order on `input`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalflowError::Reporting`] if the run could not be marked
    /// as started (no stage runs in that case), or
    /// [`EvalflowError::PipelineFailed`] naming the first stage that was
    /// exhausted without an allowed fallback.
    pub async fn run(
        &self,
        run_id: impl Into<String>,
        input: T,
    ) -> Result<RunOutput<T>, EvalflowError> {
        let run_id = run_id.into();
        let span = run_span(&run_id);
        self.run_stages(run_id, input).instrument(span).await
    }

    async fn run_stages(&self, run_id: String, input: T) -> Result<RunOutput<T>, EvalflowError> {
        self.reporter
            .report(&run_id, StatusPatch::run_started())
            .await?;
        info!(stages = self.registry.len(), "Pipeline run started");

        let run = Mutex::new(PipelineRun::new(run_id.as_str()));
        let mut current = input;

        for (definition, handler) in self.registry.iter().zip(&self.handlers) {
            let observer = StageObserver {
                run_id: &run_id,
                definition,
                run: &run,
                reporter: self.reporter.as_ref(),
            };
            let span = stage_span(definition);
            let handler = handler.as_ref();
            let stage_input = &current;

            let result = self
                .executor
                .execute(&definition.name, &definition.policy, &observer, move || {
                    handler.run(stage_input.clone())
                })
                .instrument(span)
                .await;

            match result {
                Ok(Attempted { value, attempts }) => {
                    run.lock().settle_done(&definition.name, attempts);
                    let patch = StatusPatch::done(&definition.name, definition.progress_weight);
                    self.report(&run_id, patch).await;
                    current = value;
                }
                Err(exhausted) => {
                    let message = exhausted.message();

                    if definition.policy.fallback_allowed {
                        if let Some(value) = handler.fallback(&current) {
                            warn!(
                                stage = %definition.name,
                                attempts = exhausted.attempts,
                                error = %message,
                                "Stage exhausted; continuing with fallback value"
                            );
                            run.lock()
                                .settle_fallback(&definition.name, exhausted.attempts, &message);
                            self.report(
                                &run_id,
                                StatusPatch::fallback(
                                    &definition.name,
                                    definition.progress_weight,
                                    &message,
                                ),
                            )
                            .await;
                            current = value;
                            continue;
                        }
                        warn!(stage = %definition.name, "Fallback declined for this input");
                    }

                    warn!(
                        stage = %definition.name,
                        attempts = exhausted.attempts,
                        error = %message,
                        "Stage exhausted; aborting run"
                    );
                    let snapshot = {
                        let mut run = run.lock();
                        run.settle_failed(&definition.name, exhausted.attempts, &message);
                        run.clone()
                    };
                    self.report(
                        &run_id,
                        StatusPatch::failed(&definition.name, definition.progress_weight, &message),
                    )
                    .await;
                    return Err(PipelineFailedError::new(snapshot, exhausted).into());
                }
            }
        }

        let mut run = run.into_inner();
        run.complete();
        self.report(&run_id, StatusPatch::run_completed(run.used_fallback()))
            .await;
        info!(
            fallback_stages = ?run.fallback_stages(),
            duration_ms = run.duration_ms(),
            "Pipeline run completed"
        );

        Ok(RunOutput {
            output: current,
            run,
        })
    }

    async fn report(&self, run_id: &str, patch: StatusPatch) {
        report_best_effort(self.reporter.as_ref(), run_id, patch).await;
    }
}

/// Mirrors attempt boundaries into the run record and the status store.
struct StageObserver<'a> {
    run_id: &'a str,
    definition: &'a StageDefinition,
    run: &'a Mutex<PipelineRun>,
    reporter: &'a dyn StatusReporter,
}

#[async_trait]
impl AttemptObserver for StageObserver<'_> {
    async fn on_attempt_start(&self, attempt: u32) {
        self.run.lock().begin_attempt(&self.definition.name, attempt);
        report_best_effort(
            self.reporter,
            self.run_id,
            StatusPatch::running(
                &self.definition.name,
                self.definition.progress_weight,
                attempt,
            ),
        )
        .await;
    }

    async fn on_attempt_failed(
        &self,
        attempt: u32,
        error: &AttemptError,
        _next_delay: Option<Duration>,
    ) {
        self.run
            .lock()
            .record_attempt_failure(&self.definition.name, attempt, error.to_string());
    }
}

/// Builder binding a handler to every registry stage.
pub struct OrchestratorBuilder<T: Send + 'static> {
    registry: StageRegistry,
    handlers: HashMap<String, Arc<dyn StageHandler<T>>>,
    duplicates: Vec<String>,
    reporter: Arc<dyn StatusReporter>,
    executor: RetryExecutor,
}

impl<T> OrchestratorBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a builder with a no-op reporter and the default executor.
    #[must_use]
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            duplicates: Vec::new(),
            reporter: Arc::new(NoOpStatusReporter),
            executor: RetryExecutor::default(),
        }
    }

    /// Binds a handler to a registry stage.
    #[must_use]
    pub fn stage(mut self, name: impl Into<String>, handler: Arc<dyn StageHandler<T>>) -> Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            self.duplicates.push(name);
        }
        self
    }

    /// Sets the status reporter.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sets the retry executor.
    #[must_use]
    pub fn executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage is bound twice, a registry stage has no
    /// handler, a handler names a stage outside the registry, or a stage
    /// that allows fallback is bound to a handler without one.
    pub fn build(mut self) -> Result<PipelineOrchestrator<T>, RegistryValidationError> {
        if !self.duplicates.is_empty() {
            return Err(RegistryValidationError::new(format!(
                "Stages bound more than once: {}",
                self.duplicates.join(", ")
            ))
            .with_stages(self.duplicates));
        }

        let mut unknown: Vec<String> = self
            .handlers
            .keys()
            .filter(|name| self.registry.get(name).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(RegistryValidationError::new(format!(
                "Handlers bound to unknown stages: {}",
                unknown.join(", ")
            ))
            .with_stages(unknown));
        }

        let mut handlers = Vec::with_capacity(self.registry.len());
        for definition in self.registry.iter() {
            match self.handlers.remove(&definition.name) {
                Some(handler) if definition.policy.fallback_allowed && !handler.has_fallback() => {
                    return Err(RegistryValidationError::new(format!(
                        "Stage '{}' allows fallback but its handler has no fallback value",
                        definition.name
                    ))
                    .with_stage(&definition.name));
                }
                Some(handler) => handlers.push(handler),
                None => {
                    return Err(RegistryValidationError::new(format!(
                        "Stage '{}' has no handler",
                        definition.name
                    ))
                    .with_stage(&definition.name));
                }
            }
        }

        Ok(PipelineOrchestrator {
            registry: self.registry,
            handlers,
            reporter: self.reporter,
            executor: self.executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PatchStatus, RunStatus, StageStatus, FALLBACK_USED};
    use crate::errors::{ReportingError, StageError};
    use crate::pipeline::ResiliencePolicy;
    use crate::reporting::{InMemoryStatusReporter, MockStatusReporter};
    use crate::stages::{FnStage, PassThroughStage};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> ResiliencePolicy {
        ResiliencePolicy::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(10)
            .with_timeout_ms(1_000)
    }

    fn three_stage_registry(fallback_middle: bool) -> StageRegistry {
        let middle = if fallback_middle {
            policy(2).with_fallback()
        } else {
            policy(2)
        };
        StageRegistry::builder()
            .stage("first", 30, policy(1))
            .stage("middle", 60, middle)
            .stage("last", 100, policy(1))
            .build()
            .unwrap()
    }

    fn add(n: u32) -> Arc<dyn StageHandler<u32>> {
        Arc::new(FnStage::new("add", move |x: u32| async move { Ok(x + n) }))
    }

    fn failing(counter: Arc<AtomicU32>) -> FnStage<u32, impl Fn(u32) -> futures::future::Ready<Result<u32, StageError>> + Send + Sync> {
        FnStage::new("failing", move |_x: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err(StageError::rejected("upstream 503")))
        })
    }

    #[test]
    fn test_build_requires_every_handler() {
        let err = PipelineOrchestrator::<u32>::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("middle", add(1))
            .build()
            .unwrap_err();
        assert_eq!(err.stages, vec!["last".to_string()]);
    }

    #[test]
    fn test_build_rejects_unknown_and_duplicate_stages() {
        let err = PipelineOrchestrator::<u32>::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("middle", add(1))
            .stage("last", add(1))
            .stage("extra", add(1))
            .build()
            .unwrap_err();
        assert_eq!(err.stages, vec!["extra".to_string()]);

        let err = PipelineOrchestrator::<u32>::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("first", add(2))
            .build()
            .unwrap_err();
        assert!(err.message.contains("more than once"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_threads_outputs_and_reports() {
        let reporter = Arc::new(InMemoryStatusReporter::new());
        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("middle", add(10))
            .stage("last", add(100))
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let result = orchestrator.run("run-1", 0).await.unwrap();

        assert_eq!(result.output, 111);
        assert_eq!(result.run.status, RunStatus::Completed);
        assert!(!result.used_fallback());
        assert_eq!(result.run.completed_stage_count(), 3);

        let statuses: Vec<_> = reporter
            .patches("run-1")
            .iter()
            .map(|p| (p.stage.clone(), p.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("Processing".to_string(), PatchStatus::Running),
                ("first".to_string(), PatchStatus::Running),
                ("first".to_string(), PatchStatus::Done),
                ("middle".to_string(), PatchStatus::Running),
                ("middle".to_string(), PatchStatus::Done),
                ("last".to_string(), PatchStatus::Running),
                ("last".to_string(), PatchStatus::Done),
                ("Done".to_string(), PatchStatus::Completed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_stage_without_fallback_aborts() {
        let reporter = Arc::new(InMemoryStatusReporter::new());
        let middle_calls = Arc::new(AtomicU32::new(0));
        let last_calls = Arc::new(AtomicU32::new(0));
        let last_counter = last_calls.clone();

        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("middle", Arc::new(failing(middle_calls.clone())))
            .stage(
                "last",
                Arc::new(FnStage::new("last", move |x: u32| {
                    last_counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(x) }
                })),
            )
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let err = orchestrator.run("run-2", 0).await.unwrap_err();

        assert_eq!(err.failed_stage(), Some("middle"));
        let EvalflowError::PipelineFailed(failed) = err else {
            panic!("expected PipelineFailed");
        };
        assert_eq!(failed.cause.attempts, 2);
        assert_eq!(failed.run.status, RunStatus::Failed);
        assert_eq!(
            failed.run.outcome("middle").unwrap().status,
            StageStatus::Failed
        );
        assert_eq!(middle_calls.load(Ordering::SeqCst), 2);
        assert_eq!(last_calls.load(Ordering::SeqCst), 0);

        let last_patch = reporter.patches("run-2").pop().unwrap();
        assert_eq!(last_patch.stage, "middle");
        assert_eq!(last_patch.status, PatchStatus::Failed);
        assert_eq!(last_patch.progress, 60);
        assert!(last_patch.error.unwrap().contains("upstream 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_stage_continues() {
        let reporter = Arc::new(InMemoryStatusReporter::new());
        let calls = Arc::new(AtomicU32::new(0));

        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(true))
            .stage("first", add(1))
            .stage(
                "middle",
                Arc::new(failing(calls.clone()).with_fallback(|x: &u32| x + 1000)),
            )
            .stage("last", add(100))
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let result = orchestrator.run("run-3", 0).await.unwrap();

        assert_eq!(result.output, 1101);
        assert!(result.used_fallback());
        assert_eq!(result.run.fallback_stages(), vec!["middle"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let middle = result.run.outcome("middle").unwrap();
        assert_eq!(middle.status, StageStatus::Done);
        assert_eq!(middle.attempt_count, 2);
        assert!(middle.used_fallback);

        let patches = reporter.patches("run-3");
        assert!(patches
            .iter()
            .any(|p| p.stage == "middle" && p.status == PatchStatus::Done && p.is_fallback()));
        let record = reporter.record("run-3").unwrap();
        assert_eq!(record.status, PatchStatus::Completed);
        assert_eq!(record.warning.as_deref(), Some(FALLBACK_USED));
    }

    #[test]
    fn test_build_rejects_fallback_stage_without_fallback_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = PipelineOrchestrator::builder(three_stage_registry(true))
            .stage("first", add(1))
            .stage("middle", Arc::new(failing(calls)))
            .stage("last", add(100))
            .build()
            .unwrap_err();
        assert_eq!(err.stages, vec!["middle".to_string()]);
        assert!(err.message.contains("allows fallback"));

        let err = PipelineOrchestrator::<u32>::builder(three_stage_registry(true))
            .stage("first", add(1))
            .stage("middle", Arc::new(PassThroughStage))
            .stage("last", add(100))
            .build()
            .unwrap_err();
        assert_eq!(err.stages, vec!["middle".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_fallback_aborts_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let middle = failing(calls).with_fallback(|x: &u32| x + 1000);
        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(true))
            .stage("first", add(1))
            .stage("middle", Arc::new(DecliningFallback(middle)))
            .stage("last", add(100))
            .build()
            .unwrap();

        let err = orchestrator.run("run-4", 0).await.unwrap_err();
        assert_eq!(err.failed_stage(), Some("middle"));
    }

    /// Claims a fallback but never produces one.
    struct DecliningFallback<S>(S);

    #[async_trait]
    impl<S: StageHandler<u32>> StageHandler<u32> for DecliningFallback<S> {
        async fn run(&self, input: u32) -> Result<u32, StageError> {
            self.0.run(input).await
        }

        fn fallback(&self, _input: &u32) -> Option<u32> {
            None
        }

        fn has_fallback(&self) -> bool {
            self.0.has_fallback()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_start_failure_aborts_before_stages() {
        let mut reporter = MockStatusReporter::new();
        reporter
            .expect_report()
            .times(1)
            .returning(|run_id, _| Err(ReportingError::new(run_id, "connection refused")));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(false))
            .stage(
                "first",
                Arc::new(FnStage::new("first", move |x: u32| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(x) }
                })),
            )
            .stage("middle", Arc::new(PassThroughStage))
            .stage("last", Arc::new(PassThroughStage))
            .reporter(Arc::new(reporter))
            .build()
            .unwrap();

        let err = orchestrator.run("run-5", 0).await.unwrap_err();
        assert!(matches!(err, EvalflowError::Reporting(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_report_failures_are_ignored() {
        let mut reporter = MockStatusReporter::new();
        reporter
            .expect_report()
            .withf(|_, patch| patch.stage == "Processing")
            .times(1)
            .returning(|_, _| Ok(()));
        reporter
            .expect_report()
            .returning(|run_id, _| Err(ReportingError::new(run_id, "timeout")));

        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("middle", add(1))
            .stage("last", add(1))
            .reporter(Arc::new(reporter))
            .build()
            .unwrap();

        let result = orchestrator.run("run-6", 0).await.unwrap();
        assert_eq!(result.output, 3);
        assert_eq!(result.run.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reports_each_attempt() {
        let reporter = Arc::new(InMemoryStatusReporter::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let orchestrator = PipelineOrchestrator::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage(
                "middle",
                Arc::new(FnStage::new("middle", move |x: u32| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n == 1 {
                            Err(StageError::rejected("flaky"))
                        } else {
                            Ok(x)
                        }
                    }
                })),
            )
            .stage("last", add(1))
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let result = orchestrator.run("run-7", 0).await.unwrap();
        assert_eq!(result.run.outcome("middle").unwrap().attempt_count, 2);

        let middle_attempts: Vec<_> = reporter
            .patches("run-7")
            .into_iter()
            .filter(|p| p.stage == "middle" && p.status == PatchStatus::Running)
            .map(|p| p.attempt)
            .collect();
        assert_eq!(middle_attempts, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_worst_case_duration() {
        let orchestrator = PipelineOrchestrator::<u32>::builder(three_stage_registry(false))
            .stage("first", add(1))
            .stage("middle", add(1))
            .stage("last", add(1))
            .executor(RetryExecutor::without_jitter())
            .build()
            .unwrap();

        // first: 1s; middle: 2 x 1s + 10ms; last: 1s
        assert_eq!(
            orchestrator.worst_case_duration(),
            Duration::from_millis(4_010)
        );
    }
}
