//! Step generation.
//!
//! [`prepare`] validates the complete registration stream against the prior
//! snapshot: duplicate urns, provider references, dependencies on resources
//! the program dropped, and cycles. It also synthesizes default providers
//! and collects the resources the program no longer declares.
//!
//! [`StepGenerator::generate`] then decides, per registration, whether the
//! resource is unchanged, created, updated, replaced or read. Property
//! diffs come from the provider; the generator only falls back to comparing
//! inputs itself when the provider cannot diff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, PlanError, ProviderError};
use crate::provider::{
    CheckFailure, CheckRequest, DiffChanges, DiffRequest, DiffResponse, ProviderRegistry,
};
use crate::resource::{
    ProviderReference, RegistrationEvent, ResourceState, Urn, PROVIDER_TYPE_PREFIX,
};
use crate::state::Snapshot;

use super::graph::DependencyGraph;
use super::step::{Step, StepKind};

/// Name given to synthesized default providers.
pub const DEFAULT_PROVIDER_NAME: &str = "default";

/// A resource the program wants, after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResource {
    /// The desired state. Its provider reference is resolved when the
    /// resource is analyzed.
    pub state: ResourceState,
    /// Provider resource that manages it, if any.
    pub provider: Option<Urn>,
    /// Replacement ordering override.
    pub delete_before_replace: Option<bool>,
    /// Physical id to adopt, for reads.
    pub read_id: Option<String>,
    /// True for default providers the engine added.
    pub synthesized: bool,
}

impl DesiredResource {
    /// Returns the urn.
    #[must_use]
    pub const fn urn(&self) -> &Urn {
        &self.state.urn
    }

    /// Returns every urn this resource must wait for: dependencies, parent
    /// and provider.
    pub fn references(&self) -> impl Iterator<Item = &Urn> {
        self.state
            .dependencies
            .iter()
            .chain(self.state.parent.iter())
            .chain(self.provider.iter())
    }

    /// The step kind to report if analysis never gets as far as deciding.
    #[must_use]
    pub const fn presumed_kind(&self, old: Option<&ResourceState>) -> StepKind {
        if self.read_id.is_some() {
            StepKind::Read
        } else if old.is_some() {
            StepKind::Update
        } else {
            StepKind::Create
        }
    }
}

/// A validated deployment.
#[derive(Debug, Clone, Default)]
pub struct Prepared {
    /// Desired resources, dependencies first.
    pub desired: Vec<DesiredResource>,
    /// Prior resources to remove, in snapshot order.
    pub deletes: Vec<ResourceState>,
}

/// Returns the urn of the default provider for `package` in the stack and
/// project `like` belongs to.
#[must_use]
pub fn default_provider_urn(like: &Urn, package: &str) -> Urn {
    Urn::new(
        like.stack(),
        like.project(),
        None,
        &format!("{PROVIDER_TYPE_PREFIX}{package}"),
        DEFAULT_PROVIDER_NAME,
    )
}

/// Validates a complete registration stream against the prior snapshot.
///
/// # Errors
///
/// Returns the first validation failure; nothing has been executed at that
/// point.
pub fn prepare(events: Vec<RegistrationEvent>, base: &Snapshot) -> Result<Prepared, PlanError> {
    let declared = declare(events)?;
    let desired = attach_providers(declared)?;
    let registered: HashSet<&Urn> = desired.iter().map(DesiredResource::urn).collect();

    for resource in &desired {
        for reference in resource.references() {
            if !registered.contains(reference) && base.contains(reference) {
                return Err(PlanError::UnknownDependency {
                    urn: resource.urn().clone(),
                    dependency: reference.clone(),
                });
            }
        }
    }

    let mut graph = DependencyGraph::new();
    for resource in &desired {
        graph.add_node(resource.urn().clone());
    }
    for resource in &desired {
        for reference in resource.references() {
            if reference == resource.urn() {
                return Err(PlanError::CyclicDependency {
                    cycle: format!("{0} -> {0}", resource.urn()),
                });
            }
            graph.add_dependency(resource.urn(), reference);
        }
    }
    let order = graph.topological_order()?;

    let deletes: Vec<ResourceState> = base
        .resources
        .iter()
        .filter(|r| r.delete || !registered.contains(&r.urn))
        .cloned()
        .collect();

    let mut by_urn: HashMap<Urn, DesiredResource> = desired
        .into_iter()
        .map(|d| (d.urn().clone(), d))
        .collect();
    let desired: Vec<DesiredResource> = order
        .iter()
        .filter_map(|urn| by_urn.remove(urn))
        .collect();

    info!(
        "Validated {} registrations; {} prior resources to delete",
        desired.len(),
        deletes.len()
    );
    Ok(Prepared { desired, deletes })
}

fn declare(events: Vec<RegistrationEvent>) -> Result<Vec<DesiredResource>, PlanError> {
    let mut seen: HashSet<Urn> = HashSet::new();
    let mut declared = Vec::with_capacity(events.len());

    for event in events {
        let resource = match event {
            RegistrationEvent::Register(registration) => {
                if registration.urn.is_provider() && !registration.custom {
                    return Err(PlanError::InvalidRegistration {
                        urn: registration.urn,
                        message: String::from("provider resources cannot be components"),
                    });
                }
                let mut state = ResourceState::new(registration.urn, registration.inputs);
                state.custom = registration.custom;
                state.dependencies = registration.dependencies;
                state.parent = registration.options.parent;
                state.protect = registration.options.protect;
                state.retain_on_delete = registration.options.retain_on_delete;
                state.additional_secret_outputs = registration.options.additional_secret_outputs;
                (
                    state,
                    registration.options.provider,
                    registration.options.delete_before_replace,
                    None,
                )
            }
            RegistrationEvent::Read(read) => {
                if read.id.is_empty() {
                    return Err(PlanError::InvalidRegistration {
                        urn: read.urn,
                        message: String::from("read requires a physical id"),
                    });
                }
                if read.urn.is_provider() {
                    return Err(PlanError::InvalidRegistration {
                        urn: read.urn,
                        message: String::from("provider resources cannot be read"),
                    });
                }
                let mut state = ResourceState::new(read.urn, read.inputs);
                state.dependencies = read.dependencies;
                state.parent = read.parent;
                state.external = true;
                (state, read.provider, None, Some(read.id))
            }
            RegistrationEvent::Complete => continue,
        };

        let (state, explicit, delete_before_replace, read_id) = resource;
        if !seen.insert(state.urn.clone()) {
            return Err(PlanError::DuplicateUrn { urn: state.urn });
        }
        if let Some(reference) = &explicit {
            if reference.package() != state.urn.package() {
                let reason = format!(
                    "provider serves package {}, resource belongs to {}",
                    reference.package(),
                    state.urn.package()
                );
                return Err(PlanError::InvalidProviderReference {
                    urn: state.urn,
                    reference: reference.to_string(),
                    reason,
                });
            }
        }

        declared.push(DesiredResource {
            provider: explicit.map(|reference| reference.urn),
            state,
            delete_before_replace,
            read_id,
            synthesized: false,
        });
    }

    Ok(declared)
}

/// Resolves explicit provider references and inserts a default provider
/// before the first resource that needs it.
fn attach_providers(declared: Vec<DesiredResource>) -> Result<Vec<DesiredResource>, PlanError> {
    let registered: HashSet<Urn> = declared.iter().map(|d| d.urn().clone()).collect();
    let mut synthesized: HashSet<Urn> = HashSet::new();
    let mut out = Vec::with_capacity(declared.len());

    for mut resource in declared {
        let needs_provider = resource.state.custom && !resource.urn().is_provider();
        if !needs_provider {
            resource.provider = None;
            out.push(resource);
            continue;
        }

        match resource.provider.clone() {
            Some(provider) if !registered.contains(&provider) => {
                return Err(PlanError::InvalidProviderReference {
                    urn: resource.urn().clone(),
                    reference: provider.to_string(),
                    reason: String::from("the provider is not registered in this deployment"),
                });
            }
            Some(_) => {}
            None => {
                let provider = default_provider_urn(resource.urn(), resource.urn().package());
                if !registered.contains(&provider) && synthesized.insert(provider.clone()) {
                    debug!("Synthesized default provider {}", provider);
                    out.push(DesiredResource {
                        state: ResourceState::new(provider.clone(), Default::default()),
                        provider: None,
                        delete_before_replace: None,
                        read_id: None,
                        synthesized: true,
                    });
                }
                resource.provider = Some(provider);
            }
        }
        out.push(resource);
    }

    Ok(out)
}

/// What a registration needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing changed.
    Same,
    /// The resource is new.
    Create,
    /// Update in place.
    Update,
    /// Replace, deleting the old copy first if `delete_before_replace`.
    Replace {
        /// Delete the old copy before creating the new one.
        delete_before_replace: bool,
    },
    /// Adopt an existing resource.
    Read,
}

impl Decision {
    /// The step kind reported for this decision.
    #[must_use]
    pub const fn kind(self) -> StepKind {
        match self {
            Self::Same => StepKind::Same,
            Self::Create => StepKind::Create,
            Self::Update => StepKind::Update,
            Self::Replace { .. } => StepKind::Replace,
            Self::Read => StepKind::Read,
        }
    }
}

/// The outcome of analyzing one registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    /// What to do.
    pub decision: Decision,
    /// Desired state with checked inputs and a resolved provider. For
    /// [`Decision::Same`] it also carries the recorded id and outputs.
    pub new: ResourceState,
    /// Recorded state, if any.
    pub old: Option<ResourceState>,
    /// Conditions the caller should surface.
    pub warnings: Vec<String>,
}

/// In-place change classification before partial-resource and protect
/// rules are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// No change.
    None,
    /// In-place update.
    Update,
    /// Replacement.
    Replace,
}

/// Classifies a diff.
///
/// Without a usable diff the inputs are compared directly: identical inputs
/// are unchanged, anything else is replaced.
#[must_use]
pub fn classify(old: &ResourceState, new: &ResourceState, diff: Option<&DiffResponse>) -> Change {
    match diff {
        Some(diff) if diff.changes == DiffChanges::None => Change::None,
        Some(diff) if diff.changes == DiffChanges::Some => {
            if diff.requires_replacement() {
                Change::Replace
            } else {
                Change::Update
            }
        }
        _ if old.inputs == new.inputs => Change::None,
        _ => Change::Replace,
    }
}

/// Resolves replacement ordering. An explicit annotation always wins; a
/// provider asking for delete-before-replace against an annotation saying
/// otherwise produces a warning.
#[must_use]
pub fn replace_mode(urn: &Urn, annotation: Option<bool>, provider_hint: bool) -> (bool, Option<String>) {
    match annotation {
        Some(false) if provider_hint => (
            false,
            Some(format!(
                "Provider requires {urn} to be deleted before it is replaced, but the resource opts out; creating the replacement first"
            )),
        ),
        Some(explicit) => (explicit, None),
        None => (provider_hint, None),
    }
}

/// Builds the delete step for a prior resource the program dropped.
///
/// # Errors
///
/// Returns [`PlanError::ProtectedResource`] for protected resources.
pub fn delete_step(old: ResourceState) -> Result<Step, PlanError> {
    if old.protect && !old.delete {
        return Err(PlanError::ProtectedResource {
            urn: old.urn,
            operation: "deleted",
        });
    }
    Ok(if old.delete {
        Step::delete_replaced(old)
    } else {
        Step::delete(old)
    })
}

fn check_failures(urn: &Urn, failures: &[CheckFailure]) -> Result<(), PlanError> {
    if failures.is_empty() {
        return Ok(());
    }
    Err(PlanError::CheckFailed {
        urn: urn.clone(),
        failures: failures
            .iter()
            .map(|f| {
                if f.property.is_empty() {
                    f.reason.clone()
                } else {
                    format!("{}: {}", f.property, f.reason)
                }
            })
            .collect(),
    })
}

/// Decides the step for each registration, consulting providers.
#[derive(Debug, Clone)]
pub struct StepGenerator {
    registry: Arc<ProviderRegistry>,
}

impl StepGenerator {
    /// Creates a generator over a provider registry.
    #[must_use]
    pub const fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Analyzes one registration.
    ///
    /// `provider` must be the resolved reference of the resource's provider
    /// when it has one.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CheckFailed`] if the provider rejects the inputs,
    /// [`PlanError::ProtectedResource`] if a protected resource would be
    /// replaced, or the provider error that prevented a decision.
    pub async fn generate(
        &self,
        desired: &DesiredResource,
        old: Option<&ResourceState>,
        provider: Option<ProviderReference>,
    ) -> Result<Generated, EngineError> {
        let mut new = desired.state.clone();
        new.provider = provider;

        if let Some(id) = &desired.read_id {
            new.id = Some(id.clone());
            return Ok(Generated {
                decision: Decision::Read,
                new,
                old: old.cloned(),
                warnings: Vec::new(),
            });
        }

        // A resource adopted by a read is not ours to update; managing it
        // starts with a fresh create.
        let old = old.filter(|o| !o.external);

        let change = if !new.custom {
            old.map(|old| {
                let change = if old.inputs == new.inputs && old.parent == new.parent {
                    Change::None
                } else {
                    Change::Update
                };
                (change, false)
            })
        } else if new.urn.is_provider() {
            let checked = self.registry.check(&new.urn, &new.inputs);
            check_failures(&new.urn, &checked.failures)?;
            new.inputs = checked.inputs;
            old.map(|old| {
                let diff = self.registry.diff(&old.inputs, &new.inputs);
                let change = classify(old, &new, Some(&diff));
                if change == Change::Replace {
                    debug!("Provider {} replaced: {}", new.urn, diff.replaces.join(", "));
                }
                (change, diff.delete_before_replace)
            })
        } else {
            self.diff_custom(&mut new, old).await?
        };

        let Some(old) = old else {
            return Ok(Generated {
                decision: Decision::Create,
                new,
                old: None,
                warnings: Vec::new(),
            });
        };
        let Some((change, hint)) = change else {
            return Err(EngineError::internal(format!("no classification for {}", new.urn)));
        };

        let mut warnings = Vec::new();
        let decision = match change {
            Change::None if old.is_partial() => {
                info!("{} was left partially initialized; updating it", new.urn);
                Decision::Update
            }
            Change::None => Decision::Same,
            Change::Update => Decision::Update,
            Change::Replace => {
                if new.protect {
                    return Err(PlanError::ProtectedResource {
                        urn: new.urn,
                        operation: "replaced",
                    }
                    .into());
                }
                let (delete_before_replace, warning) =
                    replace_mode(&new.urn, desired.delete_before_replace, hint);
                if let Some(warning) = warning {
                    warn!("{}", warning);
                    warnings.push(warning);
                }
                Decision::Replace {
                    delete_before_replace,
                }
            }
        };

        if decision == Decision::Same {
            new.id.clone_from(&old.id);
            new.outputs.clone_from(&old.outputs);
            new.created_at = old.created_at;
            new.modified_at = old.modified_at;
            if new.urn.is_provider() {
                self.registry.load_existing(old).await?;
            }
        }

        Ok(Generated {
            decision,
            new,
            old: Some(old.clone()),
            warnings,
        })
    }

    /// Checks and diffs a provider-managed resource. Returns the change and
    /// the provider's delete-before-replace hint, or `None` for new
    /// resources.
    async fn diff_custom(
        &self,
        new: &mut ResourceState,
        old: Option<&ResourceState>,
    ) -> Result<Option<(Change, bool)>, EngineError> {
        let reference = new.provider.clone().ok_or_else(|| ProviderError::NotFound {
            reference: format!("provider for {}", new.urn),
        })?;
        let handle = self.registry.get(&reference)?;

        let checked = handle
            .check(CheckRequest {
                urn: new.urn.clone(),
                olds: old.map(|o| o.inputs.clone()).unwrap_or_default(),
                news: new.inputs.clone(),
            })
            .await?;
        check_failures(&new.urn, &checked.failures)?;
        new.inputs = checked.inputs;

        let Some(old) = old else {
            return Ok(None);
        };
        let same_provider = old
            .provider
            .as_ref()
            .is_some_and(|p| p.urn == reference.urn);
        if !same_provider {
            info!("{} moved to provider {}; replacing", new.urn, reference.urn);
            return Ok(Some((Change::Replace, false)));
        }

        let diff = match handle
            .diff(DiffRequest {
                urn: new.urn.clone(),
                id: old.id.clone().unwrap_or_default(),
                old_inputs: old.inputs.clone(),
                old_outputs: old.outputs.clone(),
                new_inputs: new.inputs.clone(),
            })
            .await
        {
            Ok(diff) => Some(diff),
            Err(ProviderError::Unsupported { .. }) => {
                debug!("Provider {} cannot diff; comparing inputs", handle.package());
                None
            }
            Err(e) => return Err(e.into()),
        };

        let change = classify(old, new, diff.as_ref());
        if change == Change::Replace {
            if let Some(diff) = &diff {
                debug!("{} requires replacement: {}", new.urn, diff.replaces.join(", "));
            }
        }
        Ok(Some((change, diff.is_some_and(|d| d.delete_before_replace))))
    }
}
