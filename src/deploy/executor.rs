//! Step executor.
//!
//! Performs one step against its provider, retrying transient failures with
//! backoff. The executor never touches the snapshot; it returns the
//! resulting resource state and the coordinator records it.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{EngineError, ProviderError, Result, StepError};
use crate::provider::{
    CreateRequest, DeleteRequest, ProviderHandle, ProviderRegistry, ReadRequest, UpdateRequest,
};
use crate::resource::{
    inherit_secret_outputs, merge_outputs, PropertyMap, ProviderReference, ResourceState,
    UNKNOWN_SENTINEL,
};

use super::step::{Step, StepKind};

/// How a step ended.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step completed. Carries the resulting state, or `None` when the
    /// resource is gone.
    Done(Option<ResourceState>),
    /// The provider changed infrastructure but could not confirm it. The
    /// state is recorded with its init errors and the step counts as failed.
    Partial(ResourceState, EngineError),
    /// The step failed without changing what the snapshot should record.
    Failed(EngineError),
}

impl StepOutcome {
    /// Returns true for [`StepOutcome::Done`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Result of executing a single step.
#[derive(Debug)]
pub struct StepResult {
    /// How the step ended.
    pub outcome: StepOutcome,
    /// Provider attempts made, including retries.
    pub attempts: u32,
}

/// Executes steps against providers.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<ProviderRegistry>,
    retry: RetryConfig,
    preview: bool,
}

impl StepExecutor {
    /// Creates an executor.
    #[must_use]
    pub const fn new(registry: Arc<ProviderRegistry>, retry: RetryConfig) -> Self {
        Self {
            registry,
            retry,
            preview: false,
        }
    }

    /// Sets preview mode. Preview never calls a mutating capability and
    /// reports unknown ids and outputs instead.
    #[must_use]
    pub const fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    /// Executes a step, retrying transient failures.
    pub async fn execute(&self, step: &Step) -> StepResult {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if attempts > 1 {
                debug!("Retry attempt {} of {} for {}", attempts, max_attempts, step);
            }

            let error = match self.execute_once(step).await {
                Ok(state) => {
                    return StepResult {
                        outcome: StepOutcome::Done(state),
                        attempts,
                    }
                }
                Err(e) => e,
            };

            if let EngineError::Provider(ProviderError::Partial {
                id, outputs, reasons, ..
            }) = error
            {
                return StepResult {
                    outcome: Self::partial(step, id, outputs, reasons),
                    attempts,
                };
            }

            if !error.is_retryable() {
                return StepResult {
                    outcome: StepOutcome::Failed(error),
                    attempts,
                };
            }
            if attempts >= max_attempts {
                warn!("{} failed after {} attempts: {}", step, attempts, error);
                return StepResult {
                    outcome: StepOutcome::Failed(
                        StepError::MaxRetriesExceeded {
                            attempts,
                            urn: step.urn.clone(),
                        }
                        .into(),
                    ),
                    attempts,
                };
            }
            let delay = self.retry.backoff(attempts, error.retry_delay());
            warn!("{} failed, retrying in {:?}: {}", step, delay, error);
            tokio::time::sleep(delay).await;
        }
    }

    async fn execute_once(&self, step: &Step) -> Result<Option<ResourceState>> {
        match step.kind {
            StepKind::Same | StepKind::Replace => Ok(step.new.clone()),
            StepKind::Create | StepKind::CreateReplacement => {
                let new = required(step, step.new.as_ref())?;
                self.create(new).await.map(Some)
            }
            StepKind::Update => {
                let old = required(step, step.old.as_ref())?;
                let new = required(step, step.new.as_ref())?;
                self.update(old, new).await.map(Some)
            }
            StepKind::Delete | StepKind::DeleteReplaced => {
                let old = required(step, step.old.as_ref())?;
                if step.only_forgets() {
                    debug!("Forgetting {} without calling its provider", old.urn);
                } else {
                    self.delete(old).await?;
                }
                Ok(None)
            }
            StepKind::Read => {
                let new = required(step, step.new.as_ref())?;
                self.read(new).await.map(Some)
            }
        }
    }

    async fn create(&self, new: &ResourceState) -> Result<ResourceState> {
        info!("Creating {}", new.urn);
        let (id, outputs) = if !new.custom {
            (None, PropertyMap::new())
        } else if new.urn.is_provider() {
            let created = self.registry.create(&new.urn, &new.inputs, self.preview).await?;
            (Some(created.id), created.outputs)
        } else if self.preview {
            (Some(UNKNOWN_SENTINEL.to_string()), new.inputs.clone())
        } else {
            let handle = self.handle(new)?;
            let created = handle
                .create(CreateRequest {
                    urn: new.urn.clone(),
                    inputs: new.inputs.clone(),
                })
                .await?;
            (Some(created.id), created.outputs)
        };

        let now = Utc::now();
        let mut state = new.clone();
        state.id = id;
        state.outputs = inherit_secret_outputs(&new.inputs, outputs, &new.additional_secret_outputs);
        state.init_errors.clear();
        state.created_at = Some(now);
        state.modified_at = Some(now);
        Ok(state)
    }

    async fn update(&self, old: &ResourceState, new: &ResourceState) -> Result<ResourceState> {
        info!("Updating {}", new.urn);
        let outputs = if !new.custom {
            PropertyMap::new()
        } else if new.urn.is_provider() {
            if self.preview {
                new.inputs.clone()
            } else {
                let reference = ProviderReference::new(new.urn.clone(), old.id.clone().unwrap_or_default());
                self.registry.update(&reference, &new.inputs).await?
            }
        } else if self.preview {
            merge_outputs(&old.outputs, &new.inputs)
        } else {
            let handle = self.handle(new)?;
            handle
                .update(UpdateRequest {
                    urn: new.urn.clone(),
                    id: old.id.clone().unwrap_or_default(),
                    old_inputs: old.inputs.clone(),
                    old_outputs: old.outputs.clone(),
                    new_inputs: new.inputs.clone(),
                })
                .await?
                .outputs
        };

        let mut state = new.clone();
        state.id.clone_from(&old.id);
        state.outputs = inherit_secret_outputs(&new.inputs, outputs, &new.additional_secret_outputs);
        state.init_errors.clear();
        state.created_at = old.created_at;
        state.modified_at = Some(Utc::now());
        Ok(state)
    }

    async fn delete(&self, old: &ResourceState) -> Result<()> {
        info!("Deleting {}", old.urn);
        if self.preview {
            return Ok(());
        }
        if old.urn.is_provider() {
            let reference = ProviderReference::new(old.urn.clone(), old.id.clone().unwrap_or_default());
            self.registry.delete(&reference).await;
            return Ok(());
        }
        let handle = self.handle(old)?;
        handle
            .delete(DeleteRequest {
                urn: old.urn.clone(),
                id: old.id.clone().unwrap_or_default(),
                inputs: old.inputs.clone(),
                outputs: old.outputs.clone(),
            })
            .await?;
        Ok(())
    }

    async fn read(&self, new: &ResourceState) -> Result<ResourceState> {
        info!("Reading {}", new.urn);
        let handle = self.handle(new)?;
        let response = handle
            .read(ReadRequest {
                urn: new.urn.clone(),
                id: new.id.clone().unwrap_or_default(),
                inputs: new.inputs.clone(),
            })
            .await?;

        let now = Utc::now();
        let mut state = new.clone();
        state.id = Some(response.id);
        if !response.inputs.is_empty() {
            state.inputs = response.inputs;
        }
        state.outputs = inherit_secret_outputs(&state.inputs, response.outputs, &new.additional_secret_outputs);
        state.external = true;
        state.created_at = Some(now);
        state.modified_at = Some(now);
        Ok(state)
    }

    fn handle(&self, state: &ResourceState) -> Result<Arc<ProviderHandle>> {
        let reference = state.provider.as_ref().ok_or_else(|| ProviderError::NotFound {
            reference: format!("provider for {}", state.urn),
        })?;
        Ok(self.registry.get(reference)?)
    }

    /// Builds the state a partial create or update leaves behind. Without an
    /// id nothing is known to exist and the step simply failed.
    fn partial(
        step: &Step,
        id: Option<String>,
        outputs: PropertyMap,
        reasons: Vec<String>,
    ) -> StepOutcome {
        let message = reasons.join("; ");
        let error: EngineError = StepError::Partial {
            urn: step.urn.clone(),
            message,
        }
        .into();

        let Some(new) = step.new.as_ref() else {
            return StepOutcome::Failed(error);
        };
        let recorded_id = step.old.as_ref().and_then(|old| old.id.clone());
        let Some(id) = id.or(recorded_id) else {
            return StepOutcome::Failed(error);
        };

        warn!("{} left {} partially initialized", step, id);
        let now = Utc::now();
        let mut state = new.clone();
        state.id = Some(id);
        state.outputs = inherit_secret_outputs(&new.inputs, outputs, &new.additional_secret_outputs);
        state.init_errors = reasons;
        state.created_at = step
            .old
            .as_ref()
            .filter(|_| step.kind == StepKind::Update)
            .and_then(|old| old.created_at)
            .or(Some(now));
        state.modified_at = Some(now);
        StepOutcome::Partial(state, error)
    }
}

fn required<'a>(step: &Step, state: Option<&'a ResourceState>) -> Result<&'a ResourceState> {
    state.ok_or_else(|| EngineError::internal(format!("{step} is missing resource state")))
}
