//! Saga orchestrator: sequential steps, best-effort total compensation.
//!
//! The execution state machine:
//!
//! ```text
//! Running ──(all steps succeed)──► Completed
//! Running ──(step i throws)──► Compensating ──► Compensated
//!                                  │
//!                                  └─ compensate steps i-1 .. 0, in
//!                                     strict reverse order; each
//!                                     compensation failure is logged and
//!                                     skipped, never aborting the rest
//! ```
//!
//! Compensation is total on purpose: stopping halfway leaves state no one
//! can reason about, so every previously completed step gets its
//! `compensate` call even when earlier compensations fail. The caller
//! always receives the ORIGINAL step error, not a compensation error.
//!
//! There is no automatic retry of a failed step; a step failure means the
//! operation is being unwound.

use std::sync::Arc;
use taskflow_core::environment::Clock;
use taskflow_core::saga::{
    SagaContext, SagaError, SagaExecution, SagaRegistry, SagaStatRow, SagaStatus, SagaStore,
};
use uuid::Uuid;

/// Executes registered sagas against a persisted execution ledger.
pub struct SagaOrchestrator {
    registry: Arc<SagaRegistry>,
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
}

impl SagaOrchestrator {
    /// Create an orchestrator over a registry built at startup.
    #[must_use]
    pub fn new(registry: Arc<SagaRegistry>, store: Arc<dyn SagaStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    /// Execute the named saga with the given initial context.
    ///
    /// Steps run strictly sequentially; each step's result is stored in
    /// the context under the step's name before the next step starts, and
    /// the ledger row is persisted after every transition.
    ///
    /// # Errors
    ///
    /// - [`SagaError::UnknownSaga`]: no definition registered under `name`
    /// - the original step error after compensation has completed
    /// - [`SagaError::Database`]: ledger persistence failed
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)] // Step counts are tiny
    pub async fn execute(
        &self,
        name: &str,
        initial_context: SagaContext,
    ) -> Result<SagaExecution, SagaError> {
        let definition = self
            .registry
            .get(name)
            .ok_or_else(|| SagaError::UnknownSaga(name.to_string()))?;

        let mut execution = SagaExecution {
            id: Uuid::new_v4(),
            saga_name: name.to_string(),
            status: SagaStatus::Running,
            current_step: 0,
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            started_at: self.clock.now(),
            completed_at: None,
            context: initial_context,
        };
        self.store.insert(&execution).await?;

        tracing::info!(saga = name, execution_id = %execution.id, "Saga started");

        for (index, step) in definition.steps.iter().enumerate() {
            execution.current_step = index as i32;
            self.store.update(&execution).await?;

            tracing::info!(
                saga = name,
                execution_id = %execution.id,
                step = step.name(),
                position = index + 1,
                total = definition.steps.len(),
                "Executing saga step"
            );

            match step.execute(execution.context.clone()).await {
                Ok(result) => {
                    execution.context.insert(step.name(), &result);
                    execution.completed_steps.push(step.name().to_string());
                    self.store.update(&execution).await?;
                },
                Err(step_error) => {
                    tracing::error!(
                        saga = name,
                        execution_id = %execution.id,
                        step = step.name(),
                        error = %step_error,
                        "Saga step failed, compensating"
                    );

                    execution.status = SagaStatus::Compensating;
                    execution.failed_step = Some(step.name().to_string());
                    execution.error = Some(step_error.to_string());
                    self.store.update(&execution).await?;

                    self.compensate(&definition.steps[..index], &execution).await;

                    execution.status = SagaStatus::Compensated;
                    execution.completed_at = Some(self.clock.now());
                    self.store.update(&execution).await?;

                    metrics::counter!("taskflow.saga.compensated", "saga" => name.to_string())
                        .increment(1);
                    return Err(step_error);
                },
            }
        }

        execution.status = SagaStatus::Completed;
        execution.completed_at = Some(self.clock.now());
        self.store.update(&execution).await?;

        tracing::info!(saga = name, execution_id = %execution.id, "Saga completed");
        metrics::counter!("taskflow.saga.completed", "saga" => name.to_string()).increment(1);
        Ok(execution)
    }

    /// Compensate `completed` in strict reverse order, never stopping on a
    /// compensation failure.
    async fn compensate(
        &self,
        completed: &[Arc<dyn taskflow_core::saga::SagaStep>],
        execution: &SagaExecution,
    ) {
        for step in completed.iter().rev() {
            tracing::info!(
                saga = %execution.saga_name,
                execution_id = %execution.id,
                step = step.name(),
                "Compensating saga step"
            );

            if let Err(err) = step.compensate(execution.context.clone()).await {
                // Logged, counted, and skipped: the remaining compensations
                // must still run, and the original step error must stay the
                // one the caller sees.
                tracing::error!(
                    saga = %execution.saga_name,
                    execution_id = %execution.id,
                    step = step.name(),
                    error = %err,
                    "Compensation failed, continuing with remaining steps"
                );
                metrics::counter!("taskflow.saga.compensation_failures").increment(1);
            }
        }
    }

    /// Execution history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage failure.
    pub async fn history(
        &self,
        saga_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SagaExecution>, SagaError> {
        self.store.history(saga_name, limit).await
    }

    /// Execution counts grouped by (saga name, status).
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Database`] on storage failure.
    pub async fn stats(&self) -> Result<Vec<SagaStatRow>, SagaError> {
        self.store.stats().await
    }

    /// Look up one execution's ledger.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::ExecutionNotFound`] when unknown.
    pub async fn execution(&self, id: Uuid) -> Result<SagaExecution, SagaError> {
        self.store.find(id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    // The orchestrator's state machine, context threading, and
    // compensation totality are covered in tests/saga_flow.rs against the
    // in-memory saga store.
}
