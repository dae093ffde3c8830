//! Saga definitions, executions, and the saga store trait.
//!
//! A saga is an ordered multi-step business operation where every step has
//! a compensating action. Steps run strictly sequentially; when one fails,
//! the completed steps are compensated in reverse order and the execution
//! ends in the terminal `Compensated` state. There is no distributed
//! transaction anywhere — only the ledger of what ran and what was undone.
//!
//! # Context
//!
//! Steps communicate through a [`SagaContext`]: a string-keyed JSON map.
//! The orchestrator stores each step's result under the step's name before
//! the next step starts, so later steps can read earlier results with the
//! typed accessors ([`SagaContext::get`]). The orchestrator itself stays
//! generic over the map — it never interprets step results.
//!
//! # Registry
//!
//! [`SagaRegistry`] is an explicit object constructed during startup wiring
//! and handed to the orchestrator — there is no ambient global saga table,
//! so tests build isolated registries.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors from saga definition and execution.
#[derive(Error, Debug)]
pub enum SagaError {
    /// No saga registered under the requested name.
    #[error("Unknown saga: {0}")]
    UnknownSaga(String),

    /// A step failed; compensation has already completed when the caller
    /// sees this.
    #[error("Saga step '{step}' failed: {message}")]
    StepFailed {
        /// Name of the failing step.
        step: String,
        /// The step's error description.
        message: String,
    },

    /// A value in the context could not be decoded as the requested type.
    #[error("Context value '{key}' has unexpected shape: {message}")]
    ContextType {
        /// The context key.
        key: String,
        /// Decode error description.
        message: String,
    },

    /// Database connection or query error from the saga store.
    #[error("Database error: {0}")]
    Database(String),

    /// Execution not found.
    #[error("Saga execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

impl SagaError {
    /// Convenience constructor for step failures.
    pub fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Lifecycle state of a saga execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Steps are executing.
    Running,
    /// All steps succeeded. Terminal.
    Completed,
    /// A step failed and compensation has not finished (transient state;
    /// persisted so a crash mid-compensation is visible).
    Compensating,
    /// A step failed and all prior steps were compensated. Terminal.
    Compensated,
    /// Reserved for executions that failed before any step ran.
    Failed,
}

impl SagaStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Compensating => "COMPENSATING",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, SagaError> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "COMPENSATING" => Ok(Self::Compensating),
            "COMPENSATED" => Ok(Self::Compensated),
            "FAILED" => Ok(Self::Failed),
            _ => Err(SagaError::Database(format!("invalid saga status: {s}"))),
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// String-keyed JSON map shared across a saga's steps.
///
/// # Examples
///
/// ```
/// use taskflow_core::saga::SagaContext;
///
/// let mut context = SagaContext::new();
/// context.insert("project_id", &serde_json::json!("p-1"));
///
/// let id: String = context.get("project_id").unwrap();
/// assert_eq!(id, "p-1");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaContext(BTreeMap<String, serde_json::Value>);

impl SagaContext {
    /// Create an empty context.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: &serde_json::Value) {
        self.0.insert(key.into(), value.clone());
    }

    /// Raw value under `key`, if present.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Decode the value under `key` as `T`.
    ///
    /// Returns `None` when the key is absent; step code that requires the
    /// key should surface that as its own failure.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the context is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One step of a saga: a forward action plus its compensating action.
///
/// Both actions receive the shared context; `execute` additionally returns
/// a JSON result the orchestrator stores under [`SagaStep::name`] before
/// the next step starts.
pub trait SagaStep: Send + Sync {
    /// Stable step name; the context key for this step's result and the
    /// value recorded in `completed_steps`/`failed_step`.
    fn name(&self) -> &str;

    /// Run the step's forward action.
    ///
    /// The context is a snapshot taken when the step starts; results of
    /// earlier steps are available under their step names.
    fn execute(
        &self,
        context: SagaContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, SagaError>> + Send + '_>>;

    /// Undo the step's forward action. Called only if `execute` succeeded
    /// and a later step failed. Must tolerate being called with partial
    /// downstream state.
    fn compensate(
        &self,
        context: SagaContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>>;
}

/// An ordered, named sequence of steps.
#[derive(Clone)]
pub struct SagaDefinition {
    /// Saga name, the registry key.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    /// Create a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn SagaStep>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Explicit name → definition registry, built at startup.
#[derive(Default)]
pub struct SagaRegistry {
    sagas: BTreeMap<String, SagaDefinition>,
}

impl SagaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sagas: BTreeMap::new(),
        }
    }

    /// Register a definition, replacing any previous one with the same
    /// name.
    pub fn register(&mut self, definition: SagaDefinition) {
        tracing::info!(saga = %definition.name, steps = definition.steps.len(), "Registered saga");
        self.sagas.insert(definition.name.clone(), definition);
    }

    /// Look up a definition by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SagaDefinition> {
        self.sagas.get(name)
    }

    /// Names of all registered sagas.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.sagas.keys().map(String::as_str).collect()
    }
}

/// The persisted ledger of one saga run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaExecution {
    /// Execution id.
    pub id: Uuid,
    /// Name of the saga that ran.
    pub saga_name: String,
    /// Current lifecycle state.
    pub status: SagaStatus,
    /// Index of the step currently (or last) executing.
    pub current_step: i32,
    /// Names of steps that completed, in order.
    pub completed_steps: Vec<String>,
    /// Name of the step that failed, if any.
    pub failed_step: Option<String>,
    /// The failing step's error, if any.
    pub error: Option<String>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Shared step context, including stored step results.
    pub context: SagaContext,
}

/// One row of the grouped saga statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStatRow {
    /// Saga name.
    pub saga_name: String,
    /// Execution status.
    pub status: SagaStatus,
    /// Number of executions with this (name, status).
    pub count: i64,
}

/// Durable store for saga execution ledgers.
pub trait SagaStore: Send + Sync {
    /// Persist a new execution row.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage failure.
    fn insert(
        &self,
        execution: &SagaExecution,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>>;

    /// Persist the current state of an execution (called after every step
    /// transition).
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage failure.
    fn update(
        &self,
        execution: &SagaExecution,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>>;

    /// Find an execution by id.
    ///
    /// # Errors
    ///
    /// - [`SagaError::ExecutionNotFound`]: no such execution
    /// - [`SagaError::Database`]: storage failure
    fn find(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<SagaExecution, SagaError>> + Send + '_>>;

    /// Execution history, newest first, optionally filtered by saga name,
    /// up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage failure.
    fn history(
        &self,
        saga_name: Option<&str>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaExecution>, SagaError>> + Send + '_>>;

    /// Execution counts grouped by (saga name, status).
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage failure.
    fn stats(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaStatRow>, SagaError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::Failed,
        ] {
            assert_eq!(SagaStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn status_invalid() {
        assert!(SagaStatus::parse("PAUSED").is_err());
    }

    #[test]
    fn context_typed_access() {
        let mut context = SagaContext::new();
        context.insert("project_id", &serde_json::json!("p-1"));
        context.insert("task_count", &serde_json::json!(3));

        let id: String = context.get("project_id").unwrap();
        let count: u32 = context.get("task_count").unwrap();

        assert_eq!(id, "p-1");
        assert_eq!(count, 3);
        assert_eq!(context.get::<String>("missing"), None);
        // Wrong type decodes to None rather than panicking.
        assert_eq!(context.get::<u32>("project_id"), None);
    }

    #[test]
    fn context_serde_is_transparent() {
        let mut context = SagaContext::new();
        context.insert("a", &serde_json::json!({"b": 1}));

        let json = serde_json::to_value(&context).unwrap();
        assert_eq!(json, serde_json::json!({"a": {"b": 1}}));
    }

    struct NoopStep(&'static str);

    impl SagaStep for NoopStep {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(
            &self,
            _context: SagaContext,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, SagaError>> + Send + '_>>
        {
            Box::pin(async { Ok(serde_json::Value::Null) })
        }

        fn compensate(
            &self,
            _context: SagaContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = SagaRegistry::new();
        registry.register(SagaDefinition::new(
            "create_project_with_setup",
            vec![Arc::new(NoopStep("create_project"))],
        ));

        assert!(registry.get("create_project_with_setup").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.names(), vec!["create_project_with_setup"]);
    }
}
