//! Registry and orchestrator fixtures.

use std::sync::Arc;

use crate::errors::RegistryValidationError;
use crate::pipeline::{
    PipelineOrchestrator, ResiliencePolicy, RetryExecutor, StageRegistry,
};
use crate::reporting::StatusReporter;
use crate::stages::StageHandler;

/// A policy with short delays and timeouts, suited to paused-clock tests.
#[must_use]
pub fn fast_policy(max_attempts: u32) -> ResiliencePolicy {
    ResiliencePolicy::new()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(10)
        .with_timeout_ms(1_000)
}

/// Builds a registry of the named stages with evenly spread progress.
///
/// # Errors
///
/// Returns an error if `names` is empty or repeats a name.
pub fn linear_registry(
    names: &[&str],
    policy: ResiliencePolicy,
) -> Result<StageRegistry, RegistryValidationError> {
    let count = names.len().max(1);
    names
        .iter()
        .enumerate()
        .fold(StageRegistry::builder(), |builder, (index, name)| {
            let progress = u8::try_from((index + 1) * 100 / count).unwrap_or(100);
            builder.stage(*name, progress, policy)
        })
        .build()
}

/// Binds handlers to a registry in order, without jitter.
///
/// # Errors
///
/// Returns an error if the handlers don't cover the registry exactly.
pub fn orchestrator_for<T>(
    registry: StageRegistry,
    handlers: Vec<Arc<dyn StageHandler<T>>>,
    reporter: Arc<dyn StatusReporter>,
) -> Result<PipelineOrchestrator<T>, RegistryValidationError>
where
    T: Clone + Send + Sync + 'static,
{
    let names: Vec<String> = registry.names().iter().map(ToString::to_string).collect();
    names
        .into_iter()
        .zip(handlers)
        .fold(PipelineOrchestrator::builder(registry), |builder, (name, handler)| {
            builder.stage(name, handler)
        })
        .reporter(reporter)
        .executor(RetryExecutor::without_jitter())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::NoOpStatusReporter;
    use crate::stages::PassThroughStage;

    #[test]
    fn test_linear_registry_progress() {
        let registry = linear_registry(&["a", "b", "c", "d"], fast_policy(2)).unwrap();
        let progress: Vec<u8> = registry.iter().map(|s| s.progress_weight).collect();
        assert_eq!(progress, vec![25, 50, 75, 100]);
    }

    #[test]
    fn test_linear_registry_rejects_empty() {
        assert!(linear_registry(&[], fast_policy(1)).is_err());
    }

    #[test]
    fn test_orchestrator_for_requires_all_handlers() {
        let registry = linear_registry(&["a", "b"], fast_policy(1)).unwrap();
        let handlers: Vec<Arc<dyn StageHandler<u8>>> = vec![Arc::new(PassThroughStage)];
        let result = orchestrator_for(registry, handlers, Arc::new(NoOpStatusReporter));
        assert!(result.is_err());
    }
}
