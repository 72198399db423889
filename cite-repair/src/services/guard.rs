//! Guarded operations
//!
//! Scheduled validators implement [`GuardedOperation`]. Cross-cutting
//! behavior (timeouts, logging, preconditions) is added by wrapping an
//! operation in decorator types at construction time:
//!
//! ```rust,ignore
//! let op = FnOperation::new("link-check", |input| async move { check(input).await })
//!     .validated("input must be an object", |input| {
//!         anyhow::ensure!(input.is_object(), "expected object");
//!         Ok(())
//!     })
//!     .timed(Duration::from_secs(600))
//!     .logged();
//! ```

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[async_trait::async_trait]
pub trait GuardedOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &Value) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl<T: GuardedOperation + ?Sized> GuardedOperation for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(&self, input: &Value) -> anyhow::Result<Value> {
        (**self).run(input).await
    }
}

/// Closure-backed operation
pub struct FnOperation<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnOperation<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut> GuardedOperation for FnOperation<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &Value) -> anyhow::Result<Value> {
        (self.f)(input.clone()).await
    }
}

/// Fails with a validation timeout once the deadline passes
pub struct Timed<O> {
    inner: O,
    timeout: Duration,
}

#[async_trait::async_trait]
impl<O: GuardedOperation> GuardedOperation for Timed<O> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, input: &Value) -> anyhow::Result<Value> {
        match tokio::time::timeout(self.timeout, self.inner.run(input)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "{}: validation timeout after {} ms",
                self.inner.name(),
                self.timeout.as_millis()
            )),
        }
    }
}

/// Wraps each run in a tracing span and logs its outcome
pub struct Logged<O> {
    inner: O,
}

#[async_trait::async_trait]
impl<O: GuardedOperation> GuardedOperation for Logged<O> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, input: &Value) -> anyhow::Result<Value> {
        let span = tracing::info_span!("guarded_operation", operation = %self.inner.name());
        let started = tokio::time::Instant::now();
        let result = self.inner.run(input).instrument(span).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(operation = %self.inner.name(), duration_ms, "Operation succeeded"),
            Err(e) => tracing::warn!(
                operation = %self.inner.name(),
                duration_ms,
                error = %e,
                "Operation failed"
            ),
        }
        result
    }
}

type Precondition = Box<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Runs a precondition before delegating
pub struct Validated<O> {
    inner: O,
    description: String,
    check: Precondition,
}

#[async_trait::async_trait]
impl<O: GuardedOperation> GuardedOperation for Validated<O> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, input: &Value) -> anyhow::Result<Value> {
        (self.check)(input).map_err(|e| {
            anyhow::anyhow!(
                "{}: precondition '{}' failed: {}",
                self.inner.name(),
                self.description,
                e
            )
        })?;
        self.inner.run(input).await
    }
}

/// Decorator combinators for any [`GuardedOperation`]
pub trait GuardedOperationExt: GuardedOperation + Sized {
    fn timed(self, timeout: Duration) -> Timed<Self> {
        Timed {
            inner: self,
            timeout,
        }
    }

    fn logged(self) -> Logged<Self> {
        Logged { inner: self }
    }

    fn validated<C>(self, description: impl Into<String>, check: C) -> Validated<Self>
    where
        C: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Validated {
            inner: self,
            description: description.into(),
            check: Box::new(check),
        }
    }
}

impl<T: GuardedOperation + Sized> GuardedOperationExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_timed_reports_validation_timeout() {
        let op = FnOperation::new("slow", |_input| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>(Value::Null)
        })
        .timed(Duration::from_secs(1));

        let err = op.run(&Value::Null).await.unwrap_err();
        assert_eq!(
            ErrorClass::classify_message(&err.to_string()),
            ErrorClass::ValidationTimeout
        );
    }

    #[tokio::test]
    async fn test_validated_rejects_before_running_inner() {
        let op = FnOperation::new("echo", |input| async move { Ok::<_, anyhow::Error>(input) })
            .validated("object input", |input| {
                anyhow::ensure!(input.is_object(), "expected an object");
                Ok(())
            })
            .logged();

        assert_eq!(op.name(), "echo");
        assert_eq!(op.run(&json!({"a": 1})).await.unwrap(), json!({"a": 1}));

        let err = op.run(&json!([1, 2])).await.unwrap_err();
        assert!(err.to_string().contains("precondition 'object input' failed"));
    }

    #[tokio::test]
    async fn test_arc_dyn_operation_delegates() {
        let op: Arc<dyn GuardedOperation> =
            Arc::new(FnOperation::new("const", |_input| async move { Ok::<_, anyhow::Error>(json!(42)) }));
        assert_eq!(op.run(&Value::Null).await.unwrap(), json!(42));
        assert_eq!(op.name(), "const");
    }
}
