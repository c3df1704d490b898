//! Scripted stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::errors::StageError;
use crate::stages::StageHandler;

/// What a [`ScriptedStage`] does on one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Return the (mapped) input.
    Succeed,
    /// Fail with a rejection carrying this message.
    Fail(String),
    /// Sleep, then succeed. Longer than the stage timeout means a timeout.
    Sleep(Duration),
}

type MapFn<T> = Box<dyn Fn(T) -> T + Send + Sync>;
type FallbackFn<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

/// A stage that plays back a fixed script of outcomes.
///
/// Once the script is used up every further call takes the default step,
/// which is [`ScriptStep::Succeed`] unless changed.
pub struct ScriptedStage<T> {
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    default_step: ScriptStep,
    map: Option<MapFn<T>>,
    fallback: Option<FallbackFn<T>>,
    calls: AtomicU32,
    inputs: Mutex<Vec<T>>,
}

impl<T> ScriptedStage<T> {
    /// Creates a stage that succeeds on every call.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default_step: ScriptStep::Succeed,
            map: None,
            fallback: None,
            calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Creates a stage that fails on every call.
    #[must_use]
    pub fn always_failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name).otherwise(ScriptStep::Fail(message.into()))
    }

    /// Appends a step to the script.
    #[must_use]
    pub fn then(self, step: ScriptStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Appends a failing step.
    #[must_use]
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.then(ScriptStep::Fail(message.into()))
    }

    /// Appends a sleeping step.
    #[must_use]
    pub fn then_sleep(self, duration: Duration) -> Self {
        self.then(ScriptStep::Sleep(duration))
    }

    /// Sets the step taken once the script is exhausted.
    #[must_use]
    pub fn otherwise(mut self, step: ScriptStep) -> Self {
        self.default_step = step;
        self
    }

    /// Transforms the input on success.
    #[must_use]
    pub fn with_map(mut self, map: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.map = Some(Box::new(map));
        self
    }

    /// Registers a fallback constructor.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Fn(&T) -> T + Send + Sync + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of times the stage was invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone())
    }
}

impl<T: Clone> ScriptedStage<T> {
    /// Returns every input the stage received, in call order.
    #[must_use]
    pub fn inputs(&self) -> Vec<T> {
        self.inputs.lock().clone()
    }
}

impl<T> fmt::Debug for ScriptedStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedStage")
            .field("name", &self.name)
            .field("remaining", &self.script.lock().len())
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl<T> StageHandler<T> for ScriptedStage<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(&self, input: T) -> Result<T, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.clone());

        match self.next_step() {
            ScriptStep::Succeed => {}
            ScriptStep::Fail(message) => return Err(StageError::rejected(message)),
            ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
        }

        Ok(match &self.map {
            Some(map) => map(input),
            None => input,
        })
    }

    fn fallback(&self, input: &T) -> Option<T> {
        self.fallback.as_ref().map(|build| build(input))
    }

    fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let stage = ScriptedStage::new("flaky")
            .then_fail("first")
            .with_map(|n: u32| n + 1);

        assert_eq!(stage.run(1).await, Err(StageError::rejected("first")));
        assert_eq!(stage.run(1).await, Ok(2));
        assert_eq!(stage.run(5).await, Ok(6));
        assert_eq!(stage.calls(), 3);
        assert_eq!(stage.inputs(), vec![1, 1, 5]);
    }

    #[tokio::test]
    async fn test_always_failing() {
        let stage: ScriptedStage<u32> = ScriptedStage::always_failing("down", "503");
        assert!(stage.run(0).await.is_err());
        assert!(stage.run(0).await.is_err());
        assert_eq!(stage.fallback(&0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_step() {
        let stage = ScriptedStage::new("slow").then_sleep(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        assert_eq!(stage.run("x".to_string()).await, Ok("x".to_string()));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_fallback_and_debug() {
        let stage = ScriptedStage::new("summarize").with_fallback(|n: &u32| n * 10);
        assert_eq!(stage.fallback(&4), Some(40));
        assert!(stage.has_fallback());
        assert!(format!("{stage:?}").contains("summarize"));
    }
}
