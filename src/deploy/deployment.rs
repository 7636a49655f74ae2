//! Deployment coordinator.
//!
//! One [`Deployment::run`] call converges one target. The coordinator is a
//! single task that owns the scheduler and the working snapshot; provider
//! work (analysis and step execution) runs on a [`JoinSet`] and reports back
//! through completion events, and every checkpoint is written by the
//! coordinator in completion order.
//!
//! Each registered resource becomes two scheduler nodes: an analysis node
//! that waits for everything the resource references, and a gate that its
//! dependents wait for. Analysis decides the concrete steps and wires them
//! in front of the gate. Deletes of prior resources form the cleanup phase.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, PlanError, Result, StepError};
use crate::provider::{PluginLoader, ProviderRegistry};
use crate::resource::{ProviderReference, RegistrationStream, ResourceState, Urn};
use crate::secrets::{Decrypter, Encrypter, NoSecretsCrypter};
use crate::state::{LockInfo, Snapshot, SnapshotStore, LOCK_REFRESH_SECS};

use super::checkpoint::{CheckpointWriter, WorkingSnapshot};
use super::executor::{StepExecutor, StepOutcome, StepResult};
use super::generator::{delete_step, prepare, Decision, DesiredResource, Generated, StepGenerator};
use super::report::DeploymentReport;
use super::scheduler::{Phase, Scheduler};
use super::step::{Step, StepId, StepKind};

/// A deployment against one snapshot store.
pub struct Deployment {
    config: EngineConfig,
    store: Arc<dyn SnapshotStore>,
    loader: Arc<dyn PluginLoader>,
    encrypter: Arc<dyn Encrypter>,
    decrypter: Arc<dyn Decrypter>,
    dry_run: bool,
    lock_holder: Option<String>,
    lock_refresh: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("store", &self.store.location())
            .field("parallelism", &self.config.parallelism)
            .field("dry_run", &self.dry_run)
            .field("lock_holder", &self.lock_holder)
            .finish_non_exhaustive()
    }
}

impl Deployment {
    /// Creates a deployment. Secrets are rejected until
    /// [`with_secrets`](Self::with_secrets) supplies a crypter.
    #[must_use]
    pub fn new(config: EngineConfig, store: Arc<dyn SnapshotStore>, loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            config,
            store,
            loader,
            encrypter: Arc::new(NoSecretsCrypter),
            decrypter: Arc::new(NoSecretsCrypter),
            dry_run: false,
            lock_holder: None,
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the secrets crypters.
    #[must_use]
    pub fn with_secrets(mut self, encrypter: Arc<dyn Encrypter>, decrypter: Arc<dyn Decrypter>) -> Self {
        self.encrypter = encrypter;
        self.decrypter = decrypter;
        self
    }

    /// Previews the deployment: providers are asked to check and diff, but
    /// nothing is changed and no snapshot is written.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Holds the store lock for the duration of the run.
    #[must_use]
    pub fn with_lock(mut self, holder: impl Into<String>) -> Self {
        self.lock_holder = Some(holder.into());
        self
    }

    /// Sets how often the held lock is refreshed.
    #[must_use]
    pub const fn with_lock_refresh(mut self, interval: Duration) -> Self {
        self.lock_refresh = interval;
        self
    }

    /// Uses an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns a token that cancels this deployment.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the deployment to completion.
    ///
    /// Step failures are reported, not returned. The run stops releasing
    /// steps after the first failure unless `continue_on_error` is set, and
    /// after cancellation; steps already running always finish.
    ///
    /// # Errors
    ///
    /// Returns validation errors before any step runs, snapshot conflicts
    /// and storage failures, and [`EngineError::Cancelled`] if cancelled
    /// before the registration stream completed.
    pub async fn run(&self, stream: RegistrationStream) -> Result<DeploymentReport> {
        let lock = match &self.lock_holder {
            Some(holder) if !self.dry_run => Some(self.store.acquire_lock(holder).await?),
            _ => None,
        };

        let registry = Arc::new(ProviderRegistry::new(
            Arc::clone(&self.loader),
            self.config.provider_timeout(),
        ));
        let refresher = lock.clone().map(|lock| self.refresh_lock(lock));
        let result = self.deploy(&registry, stream).await;
        registry.shutdown_all().await;

        if let Some((stop, handle)) = refresher {
            stop.cancel();
            if let Err(e) = handle.await {
                warn!("Lock refresh task failed: {}", e);
            }
        }
        if let Some(lock) = lock {
            if let Err(e) = self.store.release_lock(&lock.lock_id).await {
                warn!("Failed to release lock {}: {}", lock.lock_id, e);
            }
        }

        match &result {
            Ok(report) => info!("{}", report),
            Err(e) => error!("Deployment failed: {}", e),
        }
        result
    }

    /// Keeps `lock` alive until the returned token is cancelled. If the lock
    /// is lost the deployment is cancelled.
    fn refresh_lock(&self, mut lock: LockInfo) -> (CancellationToken, JoinHandle<()>) {
        let stop = CancellationToken::new();
        let store = Arc::clone(&self.store);
        let deployment = self.cancel.clone();
        let period = self.lock_refresh.max(Duration::from_millis(1));

        let handle = tokio::spawn({
            let stop = stop.clone();
            async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticks = tokio::time::interval_at(start, period);
                loop {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        _ = ticks.tick() => match store.refresh_lock(&lock).await {
                            Ok(refreshed) => {
                                debug!(
                                    "Refreshed lock {} until {}",
                                    refreshed.lock_id, refreshed.expires_at
                                );
                                lock = refreshed;
                            }
                            Err(e) if lock.is_expired() => {
                                error!("Lost lock {}: {}; cancelling deployment", lock.lock_id, e);
                                deployment.cancel();
                                break;
                            }
                            Err(e) => warn!("Failed to refresh lock {}: {}", lock.lock_id, e),
                        },
                    }
                }
            }
        });
        (stop, handle)
    }

    async fn deploy(&self, registry: &Arc<ProviderRegistry>, stream: RegistrationStream) -> Result<DeploymentReport> {
        let mut report = DeploymentReport::new(self.dry_run);

        let base = self.store.load_or_empty(self.decrypter.as_ref()).await?;
        for op in &base.pending_operations {
            let warning = format!(
                "Operation {} on {} was interrupted by an earlier deployment; verify the resource",
                op.kind, op.resource.urn
            );
            warn!("{}", warning);
            report.warn(warning);
        }

        for provider in base.resources.iter().filter(|r| r.urn.is_provider() && r.id.is_some()) {
            if let Err(e) = registry.load_existing(provider).await {
                let warning = format!("Could not load provider {}: {}", provider.urn, e);
                warn!("{}", warning);
                report.warn(warning);
            }
        }

        let events = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!("Deployment cancelled while waiting for registrations");
                return Err(EngineError::Cancelled);
            }
            events = stream.collect() => events?,
        };
        let prepared = prepare(events, &base)?;

        let mut writer = CheckpointWriter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.encrypter),
            base.revision,
        );
        if self.dry_run {
            writer = writer.disabled();
        }

        let mut run = Run {
            deployment: self,
            generator: StepGenerator::new(Arc::clone(registry)),
            executor: StepExecutor::new(Arc::clone(registry), self.config.retry.clone())
                .with_preview(self.dry_run),
            registry: Arc::clone(registry),
            scheduler: Scheduler::new(self.config.parallelism),
            gates: Vec::with_capacity(prepared.desired.len()),
            desired: prepared.desired,
            cleanup: Vec::new(),
            working: WorkingSnapshot::new(base),
            writer,
            report,
            tasks: JoinSet::new(),
            cancelled: false,
            fatal: None,
        };
        run.plan(prepared.deletes);
        run.execute().await
    }
}

/// A scheduler node.
#[derive(Debug, Clone)]
enum Node {
    /// Decide the steps for a registered resource.
    Analyze(usize),
    /// Completes once a registered resource's steps have.
    Gate(usize),
    /// A concrete step.
    Step(Step),
    /// A delete refused because the resource is protected.
    Protected(ResourceState),
}

/// Work reported back by a worker task.
enum Completion {
    Analyzed(std::result::Result<Generated, EngineError>),
    Executed(StepResult),
}

/// State of one deployment run, owned by the coordinator.
struct Run<'a> {
    deployment: &'a Deployment,
    generator: StepGenerator,
    executor: StepExecutor,
    registry: Arc<ProviderRegistry>,
    scheduler: Scheduler<Node>,
    desired: Vec<DesiredResource>,
    gates: Vec<StepId>,
    /// Cleanup nodes and the prior resource each removes.
    cleanup: Vec<(ResourceState, StepId)>,
    working: WorkingSnapshot,
    writer: CheckpointWriter,
    report: DeploymentReport,
    tasks: JoinSet<(StepId, Completion)>,
    cancelled: bool,
    fatal: Option<EngineError>,
}

impl Run<'_> {
    /// Builds the initial graph: analysis and gate nodes for every
    /// registration, delete nodes for every dropped resource.
    fn plan(&mut self, deletes: Vec<ResourceState>) {
        let mut gate_of: HashMap<Urn, StepId> = HashMap::with_capacity(self.desired.len());
        for (idx, desired) in self.desired.iter().enumerate() {
            let dependencies: Vec<StepId> = desired
                .references()
                .filter_map(|urn| gate_of.get(urn).copied())
                .collect();
            let analyze = self.scheduler.add(Node::Analyze(idx), Phase::Main, &dependencies);
            let gate = self.scheduler.add_gate(Node::Gate(idx), &[analyze]);
            gate_of.insert(desired.urn().clone(), gate);
            self.gates.push(gate);
        }

        for old in deletes {
            let node = match delete_step(old.clone()) {
                Ok(step) => Node::Step(step),
                Err(_) => Node::Protected(old.clone()),
            };
            let id = self.scheduler.add(node, Phase::Cleanup, &[]);
            self.link_cleanup(old, id);
        }

        info!(
            "Planned {} registrations and {} deletes",
            self.desired.len(),
            self.cleanup.len()
        );
    }

    /// Orders a cleanup node against the others: a resource is deleted only
    /// after every resource that refers to it.
    fn link_cleanup(&mut self, old: ResourceState, id: StepId) {
        let mut skipped = Vec::new();
        for (other, other_id) in &self.cleanup {
            if old.references().any(|r| r == &other.urn) {
                skipped.extend(self.scheduler.add_dependency(*other_id, id));
            }
            if other.references().any(|r| r == &old.urn) {
                skipped.extend(self.scheduler.add_dependency(id, *other_id));
            }
        }
        self.cleanup.push((old, id));
        for skipped in skipped {
            self.report_skipped(skipped);
        }
    }

    async fn execute(mut self) -> Result<DeploymentReport> {
        let cancel = self.deployment.cancel.clone();
        if cancel.is_cancelled() {
            self.cancel();
        }

        loop {
            while let Some(id) = self.scheduler.next_ready() {
                self.dispatch(id).await;
            }
            if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled(), if !self.cancelled => self.cancel(),
                joined = self.tasks.join_next() => match joined {
                    Some(Ok((id, completion))) => self.complete(id, completion).await,
                    Some(Err(e)) => {
                        error!("Worker task failed: {}", e);
                        self.scheduler.halt();
                        self.fatal
                            .get_or_insert_with(|| EngineError::internal(format!("worker task failed: {e}")));
                    }
                    None => break,
                },
            }
        }

        self.finish().await
    }

    fn cancel(&mut self) {
        info!("Cancellation requested; waiting for running steps");
        self.cancelled = true;
        self.scheduler.halt();
    }

    async fn dispatch(&mut self, id: StepId) {
        let Some(node) = self.scheduler.payload(id).cloned() else {
            return;
        };
        match node {
            Node::Gate(_) => self.scheduler.succeed(id),
            Node::Protected(old) => {
                let error: EngineError = PlanError::ProtectedResource {
                    urn: old.urn.clone(),
                    operation: "deleted",
                }
                .into();
                self.report.warn(format!("{} is protected and was not deleted", old.urn));
                self.report.failed(old.urn, StepKind::Delete, &error, 0);
                self.fail(id, &error);
            }
            Node::Analyze(idx) => {
                let desired = self.desired[idx].clone();
                let old = self.working.base().find(desired.urn()).cloned();
                let provider = self.resolve_provider(&desired);
                let generator = self.generator.clone();
                debug!("Analyzing {}", desired.urn());
                self.tasks.spawn(async move {
                    let generated = generator.generate(&desired, old.as_ref(), provider).await;
                    (id, Completion::Analyzed(generated))
                });
            }
            Node::Step(step) => {
                if !self.journal(&step).await {
                    self.report
                        .skipped(step.urn.clone(), step.kind, "checkpoint failed before the step started");
                    for skipped in self.scheduler.fail(id) {
                        self.report_skipped(skipped);
                    }
                    return;
                }
                let executor = self.executor.clone();
                info!(urn = %step.urn, kind = %step.kind, "Starting step");
                self.tasks.spawn(async move {
                    let result = executor.execute(&step).await;
                    (id, Completion::Executed(result))
                });
            }
        }
    }

    /// Resolves a resource's provider to the instance currently recorded
    /// for it.
    fn resolve_provider(&self, desired: &DesiredResource) -> Option<ProviderReference> {
        let urn = desired.provider.as_ref()?;
        let state = self.working.find(urn)?;
        let id = state.id.as_ref()?;
        Some(ProviderReference::new(urn.clone(), id.clone()))
    }

    /// Records an operation as in flight before its provider is called.
    /// Returns false if the record could not be persisted.
    async fn journal(&mut self, step: &Step) -> bool {
        if step.kind == StepKind::DeleteReplaced {
            if let Some(old) = &step.old {
                self.working.mark_pending_delete(old);
            }
        }

        let journaled = self.deployment.config.checkpoint.journal_pending_operations
            && !self.deployment.dry_run
            && !step.only_forgets();
        let Some(operation) = step.kind.operation() else {
            return true;
        };
        let Some(subject) = step.subject().filter(|s| s.custom) else {
            return true;
        };
        if journaled {
            self.working.begin(subject.clone(), operation);
            self.checkpoint().await;
        }
        self.fatal.is_none()
    }

    async fn complete(&mut self, id: StepId, completion: Completion) {
        match completion {
            Completion::Analyzed(generated) => {
                let Some(Node::Analyze(idx)) = self.scheduler.payload(id).cloned() else {
                    return;
                };
                match generated {
                    Ok(generated) => self.analyzed(id, idx, generated).await,
                    Err(e) => {
                        let desired = &self.desired[idx];
                        let kind = if matches!(e, EngineError::Plan(PlanError::ProtectedResource { .. })) {
                            self.report
                                .warn(format!("{} is protected and was not replaced", desired.urn()));
                            StepKind::Replace
                        } else {
                            desired.presumed_kind(self.working.base().find(desired.urn()))
                        };
                        warn!("Analysis of {} failed: {}", desired.urn(), e);
                        self.report.failed(desired.urn().clone(), kind, &e, 0);
                        self.fail(id, &e);
                    }
                }
            }
            Completion::Executed(result) => {
                let Some(Node::Step(step)) = self.scheduler.payload(id).cloned() else {
                    return;
                };
                self.executed(id, step, result).await;
            }
        }
    }

    /// Turns an analysis into steps wired in front of the resource's gate.
    async fn analyzed(&mut self, id: StepId, idx: usize, generated: Generated) {
        let gate = self.gates[idx];
        for warning in generated.warnings {
            self.report.warn(warning);
        }
        let Generated { decision, new, old, .. } = generated;
        debug!("{} analyzed: {}", new.urn, decision.kind());

        match (decision, old) {
            (Decision::Same, _) => {
                self.report.succeeded(new.urn.clone(), StepKind::Same, 0);
                self.working.record(new);
                self.scheduler.succeed(id);
                self.checkpoint().await;
                return;
            }
            (Decision::Create, _) => {
                let step = self.scheduler.add(Node::Step(Step::create(new)), Phase::Main, &[]);
                self.scheduler.add_dependency(gate, step);
            }
            (Decision::Read, _) => {
                let step = self.scheduler.add(Node::Step(Step::read(new)), Phase::Main, &[]);
                self.scheduler.add_dependency(gate, step);
            }
            (Decision::Update, Some(old)) => {
                let step = self.scheduler.add(Node::Step(Step::update(old, new)), Phase::Main, &[]);
                self.scheduler.add_dependency(gate, step);
            }
            (
                Decision::Replace {
                    delete_before_replace: false,
                },
                Some(old),
            ) => {
                let create = self.scheduler.add(
                    Node::Step(Step::create_replacement(old.clone(), new)),
                    Phase::Main,
                    &[],
                );
                self.scheduler.add_dependency(gate, create);
                let delete = self.scheduler.add(
                    Node::Step(Step::delete_replaced(old.clone())),
                    Phase::Cleanup,
                    &[create],
                );
                self.link_cleanup(old, delete);
            }
            (
                Decision::Replace {
                    delete_before_replace: true,
                },
                Some(old),
            ) => {
                let delete = self.scheduler.add(
                    Node::Step(Step::delete_replaced(old.clone())),
                    Phase::Cleanup,
                    &[],
                );
                self.link_cleanup(old.clone(), delete);
                self.scheduler.promote(delete);
                let create = self.scheduler.add(
                    Node::Step(Step::create_replacement(old, new)),
                    Phase::Main,
                    &[delete],
                );
                self.scheduler.add_dependency(gate, create);
            }
            (decision, None) => {
                let error = EngineError::internal(format!(
                    "{} decided {} without a prior state",
                    new.urn,
                    decision.kind()
                ));
                self.report.failed(new.urn, decision.kind(), &error, 0);
                self.fail(id, &error);
                return;
            }
        }
        self.scheduler.succeed(id);
    }

    async fn executed(&mut self, id: StepId, step: Step, result: StepResult) {
        if let Some(operation) = step.kind.operation() {
            self.working.end(&step.urn, operation);
        }

        match result.outcome {
            StepOutcome::Done(state) => {
                match (step.kind, state) {
                    (StepKind::Delete, _) => {
                        if let Some(old) = &step.old {
                            self.working.mark_deleted(old, false);
                        }
                    }
                    (StepKind::DeleteReplaced, _) => {
                        if let Some(old) = &step.old {
                            self.working.mark_deleted(old, true);
                        }
                    }
                    (kind, Some(state)) => {
                        if kind == StepKind::CreateReplacement {
                            if let Some(old) = &step.old {
                                self.working.mark_pending_delete(old);
                            }
                        }
                        self.working.record(state);
                    }
                    (_, None) => {}
                }
                info!(urn = %step.urn, kind = %step.kind, attempt = result.attempts, "Step succeeded");
                self.report.succeeded(step.urn.clone(), step.kind, result.attempts);
                self.scheduler.succeed(id);
            }
            StepOutcome::Partial(state, e) => {
                if step.kind == StepKind::CreateReplacement {
                    if let Some(old) = &step.old {
                        self.working.mark_pending_delete(old);
                    }
                }
                self.working.record(state);
                let warning = format!("{} was left partially initialized: {}", step.urn, e);
                warn!("{}", warning);
                self.report.warn(warning);
                self.report.failed(step.urn.clone(), step.kind, &e, result.attempts);
                self.fail(id, &e);
            }
            StepOutcome::Failed(e) => {
                warn!(urn = %step.urn, kind = %step.kind, attempt = result.attempts, "Step failed: {}", e);
                self.report.failed(step.urn.clone(), step.kind, &e, result.attempts);
                self.fail(id, &e);
            }
        }

        self.checkpoint().await;
    }

    /// Fails a node, reports what it blocked, and halts unless the failure
    /// is contained.
    fn fail(&mut self, id: StepId, error: &EngineError) {
        for skipped in self.scheduler.fail(id) {
            self.report_skipped(skipped);
        }
        let contained = matches!(error, EngineError::Plan(PlanError::ProtectedResource { .. }))
            || (self.deployment.config.continue_on_error && !error.is_fatal());
        if !contained && !self.scheduler.is_halted() {
            info!("Halting after failure: {}", error);
            self.scheduler.halt();
        }
    }

    fn report_skipped(&mut self, id: StepId) {
        if matches!(self.scheduler.payload(id), Some(Node::Gate(_))) {
            return;
        }
        let Some((urn, kind)) = self.describe(id) else {
            return;
        };
        let reason = match self.scheduler.blocked_by(id).and_then(|b| self.describe(b)) {
            Some((dependency, _)) => StepError::DependencyFailed {
                urn: urn.clone(),
                dependency,
            }
            .to_string(),
            None if self.cancelled => String::from("deployment was cancelled"),
            None => String::from("deployment stopped before this step ran"),
        };
        debug!("Skipping {} {}: {}", kind, urn, reason);
        self.report.skipped(urn, kind, reason);
    }

    /// The urn and reported kind of a node. Gates are reported through
    /// their resource's steps, so they only describe themselves as causes.
    fn describe(&self, id: StepId) -> Option<(Urn, StepKind)> {
        match self.scheduler.payload(id)? {
            Node::Analyze(idx) | Node::Gate(idx) => {
                let desired = &self.desired[*idx];
                let kind = desired.presumed_kind(self.working.base().find(desired.urn()));
                Some((desired.urn().clone(), kind))
            }
            Node::Step(step) => Some((step.urn.clone(), step.kind)),
            Node::Protected(old) => Some((old.urn.clone(), StepKind::Delete)),
        }
    }

    async fn checkpoint(&mut self) {
        if self.deployment.dry_run || self.fatal.is_some() {
            return;
        }
        let snapshot = self.working.snapshot(self.registry.plugins());
        if let Err(e) = self.writer.write(&snapshot).await {
            error!("Checkpoint failed: {}", e);
            self.scheduler.halt();
            self.fatal = Some(e);
        }
    }

    async fn finish(mut self) -> Result<DeploymentReport> {
        let stalled = !self.scheduler.is_halted() && self.scheduler.unfinished() > 0;
        for id in self.scheduler.finish() {
            self.report_skipped(id);
        }
        if stalled && self.fatal.is_none() {
            self.fatal = Some(
                PlanError::Stalled {
                    message: String::from("steps remained that could never become ready"),
                }
                .into(),
            );
        }

        if let Some(fatal) = self.fatal.take() {
            if !matches!(fatal, EngineError::State(_) | EngineError::Secrets(_)) {
                self.final_checkpoint().await?;
            }
            return Err(fatal);
        }

        self.final_checkpoint().await?;
        self.report.cancelled = self.cancelled;
        Ok(self.report)
    }

    async fn final_checkpoint(&mut self) -> Result<()> {
        if self.deployment.dry_run {
            return Ok(());
        }
        let snapshot: Snapshot = self.working.snapshot(self.registry.plugins());
        let revision = self.writer.write(&snapshot).await?;
        info!(
            "Deployment finished at revision {}: {} resources",
            revision,
            snapshot.resources.len()
        );
        self.report.revision = Some(revision);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        CheckResponse, CreateResponse, DiffResponse, MockProvider, ProviderInfo, StaticPluginLoader,
    };
    use crate::resource::{PropertyMap, PropertyValue, Registration, RegistrationEvent};
    use crate::deploy::StepStatus;
    use crate::secrets::NoSecretsCrypter;
    use crate::state::MemorySnapshotStore;

    fn urn(name: &str) -> Urn {
        Urn::new("dev", "web", None, "test:index:Thing", name)
    }

    fn inputs(size: &str) -> PropertyMap {
        let mut inputs = PropertyMap::new();
        inputs.insert("size".to_string(), PropertyValue::String(size.to_string()));
        inputs
    }

    fn mock() -> MockProvider {
        let mut mock = MockProvider::new();
        mock.expect_info().returning(|| ProviderInfo::new("test"));
        mock.expect_configure().returning(|_| Ok(()));
        mock.expect_shutdown().returning(|| ());
        mock.expect_check().returning(|req| {
            Ok(CheckResponse {
                inputs: req.news,
                failures: Vec::new(),
            })
        });
        mock
    }

    fn deployment(store: &Arc<MemorySnapshotStore>, mock: MockProvider) -> Deployment {
        let loader = StaticPluginLoader::new().with_provider(Arc::new(mock));
        Deployment::new(EngineConfig::default(), store.clone(), Arc::new(loader))
    }

    fn stream(registrations: Vec<Registration>) -> RegistrationStream {
        let mut events: Vec<RegistrationEvent> =
            registrations.into_iter().map(RegistrationEvent::Register).collect();
        events.push(RegistrationEvent::Complete);
        RegistrationStream::from_events(events)
    }

    #[tokio::test]
    async fn test_empty_program_on_empty_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        let report = deployment(&store, mock()).run(stream(Vec::new())).await.unwrap();

        assert!(report.is_success());
        assert!(report.steps.is_empty());
        assert_eq!(report.revision, Some(1));
        let snapshot = store.load(&NoSecretsCrypter).await.unwrap();
        assert!(snapshot.resources.is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_stream_runs_nothing() {
        let store = Arc::new(MemorySnapshotStore::new());
        let events = vec![RegistrationEvent::Register(Registration::new(urn("a"), inputs("s")))];
        let err = deployment(&store, mock())
            .run(RegistrationStream::from_events(events))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Plan(PlanError::IncompleteStream)));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_create_then_same() {
        let store = Arc::new(MemorySnapshotStore::new());

        let mut first = mock();
        first.expect_create().times(1).returning(|_| {
            Ok(CreateResponse {
                id: "a-1".to_string(),
                outputs: inputs("s"),
            })
        });
        let report = deployment(&store, first)
            .run(stream(vec![Registration::new(urn("a"), inputs("s"))]))
            .await
            .unwrap();
        assert_eq!(
            report.step(&urn("a"), StepKind::Create).unwrap().status,
            StepStatus::Succeeded
        );

        let mut second = mock();
        second.expect_diff().returning(|_| Ok(DiffResponse::unchanged()));
        let report = deployment(&store, second)
            .run(stream(vec![Registration::new(urn("a"), inputs("s"))]))
            .await
            .unwrap();
        assert!(report.changes().is_empty());
        assert!(report.steps.iter().all(|s| s.kind == StepKind::Same));

        let snapshot = store.load(&NoSecretsCrypter).await.unwrap();
        assert_eq!(snapshot.find(&urn("a")).unwrap().id.as_deref(), Some("a-1"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(MemorySnapshotStore::new());
        let report = deployment(&store, mock())
            .dry_run(true)
            .run(stream(vec![Registration::new(urn("a"), inputs("s"))]))
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.revision, None);
        assert!(report.step(&urn("a"), StepKind::Create).is_some());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_stream_completes() {
        let store = Arc::new(MemorySnapshotStore::new());
        let deployment = deployment(&store, mock());
        deployment.cancellation_token().cancel();

        let (_tx, stream) = RegistrationStream::channel(1);
        let err = deployment.run(stream).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(store.save_count(), 0);
    }
}
