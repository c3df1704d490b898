//! Stage handler trait and implementations.
//!
//! A handler is the function behind one registry entry: it consumes the
//! previous stage's output and produces the next stage's input. Handlers
//! may be invoked more than once with the same input.

use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;

/// Trait for pipeline stage functions.
#[async_trait]
pub trait StageHandler<T: Send + 'static>: Send + Sync {
    /// Executes the stage on the previous stage's output.
    ///
    /// Must fail with a [`StageError`] on any fault rather than returning
    /// a placeholder value.
    async fn run(&self, input: T) -> Result<T, StageError>;

    /// Builds a substitute output after the stage is exhausted.
    ///
    /// Only consulted when the stage policy allows fallback. Must be a
    /// pure function of `input`.
    fn fallback(&self, _input: &T) -> Option<T> {
        None
    }

    /// Whether this handler can build a fallback value at all.
    ///
    /// Stages whose policy allows fallback must be bound to a handler that
    /// returns true here.
    fn has_fallback(&self) -> bool {
        false
    }
}

type FallbackFn<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

/// An async function-based stage.
pub struct FnStage<T, F> {
    name: String,
    func: F,
    fallback: Option<FallbackFn<T>>,
}

impl<T, F, Fut> FnStage<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, StageError>> + Send,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            fallback: None,
        }
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
}

impl<T, F> fmt::Debug for FnStage<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl<T, F, Fut> StageHandler<T> for FnStage<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, StageError>> + Send,
{
    async fn run(&self, input: T) -> Result<T, StageError> {
        (self.func)(input).await
    }

    fn fallback(&self, input: &T) -> Option<T> {
        self.fallback.as_ref().map(|build| build(input))
    }

    fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// A stage that passes its input through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughStage;

#[async_trait]
impl<T: Send + 'static> StageHandler<T> for PassThroughStage {
    async fn run(&self, input: T) -> Result<T, StageError> {
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("double", |n: u32| async move { Ok(n * 2) });

        assert_eq!(stage.name(), "double");
        assert_eq!(stage.run(21).await, Ok(42));
        assert_eq!(stage.fallback(&21), None);
        assert!(!stage.has_fallback());
    }

    #[tokio::test]
    async fn test_fn_stage_error() {
        let stage = FnStage::new("fails", |_: u32| async { Err(StageError::rejected("boom")) });
        assert_eq!(stage.run(1).await, Err(StageError::rejected("boom")));
    }

    #[test]
    fn test_fn_stage_fallback() {
        let stage = FnStage::new("summarize", |s: String| async move { Ok(s) })
            .with_fallback(|s: &String| format!("fallback for {s}"));

        assert_eq!(stage.fallback(&"cv".to_string()).as_deref(), Some("fallback for cv"));
        assert!(stage.has_fallback());
        assert!(format!("{stage:?}").contains("has_fallback: true"));
    }

    #[tokio::test]
    async fn test_pass_through_stage() {
        let stage = PassThroughStage;
        assert_eq!(StageHandler::<u8>::run(&stage, 7).await, Ok(7));
    }
}
