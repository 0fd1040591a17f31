//! Provisioning engine — orchestration loop for apply and destroy.
//!
//! Walks the dependency graph dispatching ready resources to a bounded pool
//! of provider calls. The scheduler loop is the single owner of every
//! per-resource state transition; workers only talk to the provider. On the
//! first failure no new work is dispatched, in-flight work drains, and
//! resources created by the run are deleted in reverse creation order.
//! Outputs resolve last, once every resource is Created.

use super::error::EngineError;
use super::eval::{self, ResolutionContext};
use super::types::*;
use super::{graph, journal, plan, state};
use crate::provider::{Provider, ProviderError};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// What to do with in-flight provider calls when a run is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Let in-flight creations finish, then roll back.
    #[default]
    Drain,
    /// Abort in-flight creations immediately, then roll back.
    Immediate,
}

/// Fires cancellation for an in-flight apply run.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cooperative cancellation token observed by the scheduler loop.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without firing — never cancels
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Configuration for an apply run.
pub struct ApplyOptions<'a> {
    pub stack: &'a str,
    pub template: &'a StackTemplate,
    pub overrides: &'a IndexMap<String, String>,
    pub state_dir: &'a Path,

    /// Maximum provider calls in flight at once (clamped to at least 1)
    pub concurrency: usize,

    /// Per-provider-call timeout
    pub call_timeout: Duration,

    /// Plan only — no provider calls
    pub dry_run: bool,

    /// Re-apply resources that planned as NoOp
    pub force: bool,

    pub cancel: Option<CancelToken>,
    pub cancel_policy: CancelPolicy,
}

impl<'a> ApplyOptions<'a> {
    pub fn new(
        stack: &'a str,
        template: &'a StackTemplate,
        overrides: &'a IndexMap<String, String>,
        state_dir: &'a Path,
    ) -> Self {
        Self {
            stack,
            template,
            overrides,
            state_dir,
            concurrency: 4,
            call_timeout: Duration::from_secs(60),
            dry_run: false,
            force: false,
            cancel: None,
            cancel_policy: CancelPolicy::default(),
        }
    }
}

/// Configuration for a destroy run.
pub struct DestroyOptions<'a> {
    pub stack: &'a str,
    pub state_dir: &'a Path,
    pub call_timeout: Duration,
}

/// How a worker brought its resource to the Created state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishKind {
    /// A new physical resource exists. Rollback deletes it.
    Created,
    /// A pre-existing resource was updated in place. Rollback never deletes
    /// pre-existing infrastructure.
    Updated,
    /// Confirmed converged via describe; skipped.
    Unchanged,
}

/// Outcome of one provisioning worker.
enum WorkDone {
    Finished {
        physical_id: String,
        attributes: Attributes,
        kind: FinishKind,
    },
    Failed {
        error: String,
    },
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            seconds: limit.as_secs_f64(),
        }),
    }
}

/// Perform the provider calls for one resource. Dependencies are Created by
/// the time this runs, so properties arrive fully resolved.
async fn provision_one(
    provider: Arc<dyn Provider>,
    resource_type: String,
    action: PlanAction,
    prior_physical: Option<String>,
    properties: Attributes,
    call_timeout: Duration,
) -> WorkDone {
    if let Some(pid) = prior_physical {
        match action {
            PlanAction::NoOp => {
                // Idempotence: the plan already compared hashes; confirm the
                // resource still exists and skip. A vanished physical id
                // falls through to create.
                match with_timeout(call_timeout, provider.describe(&pid)).await {
                    Ok(attributes) => {
                        return WorkDone::Finished {
                            physical_id: pid,
                            attributes,
                            kind: FinishKind::Unchanged,
                        }
                    }
                    Err(ProviderError::NotFound(_)) => {}
                    Err(e) => return WorkDone::Failed { error: e.to_string() },
                }
            }
            PlanAction::Update => {
                match with_timeout(
                    call_timeout,
                    provider.update(&pid, &resource_type, &properties),
                )
                .await
                {
                    Ok(attributes) => {
                        return WorkDone::Finished {
                            physical_id: pid,
                            attributes,
                            kind: FinishKind::Updated,
                        }
                    }
                    Err(ProviderError::NotFound(_)) => {}
                    Err(e) => return WorkDone::Failed { error: e.to_string() },
                }
            }
            PlanAction::Create | PlanAction::Destroy => {}
        }
    }

    match with_timeout(call_timeout, provider.create(&resource_type, &properties)).await {
        Ok(created) => WorkDone::Finished {
            physical_id: created.physical_id,
            attributes: created.attributes,
            kind: FinishKind::Created,
        },
        Err(e) => WorkDone::Failed { error: e.to_string() },
    }
}

fn log_event(state_dir: &Path, stack: &str, event: StackEvent) {
    if let Err(e) = journal::append_event(state_dir, stack, event) {
        tracing::warn!(stack, error = %e, "journal append failed");
    }
}

fn record_created(
    stack_state: &mut StackState,
    id: &str,
    resource: &ResourceDecl,
    physical_id: &str,
    attributes: Attributes,
) {
    stack_state.resources.insert(
        id.to_string(),
        ResourceRecord {
            resource_type: resource.resource_type.clone(),
            status: ResourceState::Created,
            physical_id: Some(physical_id.to_string()),
            applied_at: Some(journal::now_iso8601()),
            properties_hash: plan::properties_hash(resource),
            attributes,
        },
    );
}

fn record_failed(stack_state: &mut StackState, id: &str, resource: &ResourceDecl) {
    // A failed update keeps pointing at its physical resource so the next
    // run retries in place instead of creating a duplicate
    let prior_physical = stack_state
        .resources
        .get(id)
        .and_then(|r| r.physical_id.clone());
    stack_state.resources.insert(
        id.to_string(),
        ResourceRecord {
            resource_type: resource.resource_type.clone(),
            status: ResourceState::Failed,
            physical_id: prior_physical,
            applied_at: Some(journal::now_iso8601()),
            properties_hash: String::new(),
            attributes: IndexMap::new(),
        },
    );
}

/// First Pending resource (in creation order) whose dependencies are all
/// Created. Declaration-order ties come from the order itself.
fn next_dispatchable(
    order: &[String],
    states: &HashMap<String, ResourceState>,
    deps: &HashMap<String, Vec<String>>,
) -> Option<String> {
    order
        .iter()
        .find(|id| {
            states[*id] == ResourceState::Pending
                && deps[*id]
                    .iter()
                    .all(|d| states[d] == ResourceState::Created)
        })
        .cloned()
}

/// Execute an apply run.
///
/// Returns `Err` only for pre-flight failures (resolution, cycle, state I/O)
/// detected before any provider call. Everything after pre-flight — provider
/// failures, rollback results, cancellation — is reported per-resource in
/// the `ApplyReport`.
pub async fn apply(
    opts: &ApplyOptions<'_>,
    provider: Arc<dyn Provider>,
) -> Result<ApplyReport, EngineError> {
    let start = Instant::now();
    let run_id = journal::generate_run_id();

    // Pre-flight: bind parameters (enum validation happens here)
    let mut ctx = ResolutionContext::new(opts.template, opts.overrides).map_err(|source| {
        EngineError::Resolution {
            id: "parameters".to_string(),
            source,
        }
    })?;

    // Pre-flight: every expression must be statically resolvable
    for (id, resource) in &opts.template.resources {
        for expr in resource.properties.values() {
            eval::preflight(expr, opts.template).map_err(|source| EngineError::Resolution {
                id: format!("resource '{id}'"),
                source,
            })?;
        }
    }
    for (name, output) in &opts.template.outputs {
        eval::preflight(&output.value, opts.template).map_err(|source| {
            EngineError::Resolution {
                id: format!("output '{name}'"),
                source,
            }
        })?;
    }

    // Cycle detection — still before any provider call
    let order = graph::creation_order(&opts.template.resources)?;

    let prior = state::load_state(opts.state_dir, opts.stack)?;
    let stack_plan = plan::plan(opts.stack, opts.template, &order, prior.as_ref());

    if opts.dry_run {
        return Ok(dry_run_report(opts, &run_id, &order, &stack_plan, prior.as_ref(), start));
    }

    let mut stack_state = prior.unwrap_or_else(|| state::new_state(opts.stack));

    tracing::info!(stack = opts.stack, %run_id, resources = order.len(), "apply started");
    log_event(
        opts.state_dir,
        opts.stack,
        StackEvent::ApplyStarted {
            stack: opts.stack.to_string(),
            run_id: run_id.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    let deps: HashMap<String, Vec<String>> = opts
        .template
        .resources
        .iter()
        .map(|(id, r)| (id.clone(), graph::dependencies(r)))
        .collect();

    let mut states: HashMap<String, ResourceState> = order
        .iter()
        .map(|id| (id.clone(), ResourceState::Pending))
        .collect();
    let mut physical: HashMap<String, String> = HashMap::new();
    let mut errors: HashMap<String, String> = HashMap::new();
    let mut rollback_errors: HashMap<String, String> = HashMap::new();
    let mut unchanged_set: HashSet<String> = HashSet::new();
    let mut created_this_run: Vec<String> = Vec::new();

    let concurrency = opts.concurrency.max(1);
    let mut join_set: JoinSet<(String, f64, WorkDone)> = JoinSet::new();
    let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();
    let mut cancel_token = opts.cancel.clone();
    let mut halted = false;
    let mut cancelled = false;

    loop {
        // Dispatch ready resources up to the concurrency limit
        while !halted && join_set.len() < concurrency {
            let Some(id) = next_dispatchable(&order, &states, &deps) else {
                break;
            };
            let resource = &opts.template.resources[&id];

            let mut action = stack_plan.action_for(&id);
            if opts.force && action == PlanAction::NoOp {
                action = PlanAction::Update;
            }

            // Dependencies are Created, so resolution can only fail on a
            // genuine ordering bug; treat that as a resource failure.
            let resolved = match eval::resolve_properties(&resource.properties, &ctx) {
                Ok(props) => props,
                Err(e) => {
                    states.insert(id.clone(), ResourceState::Failed);
                    errors.insert(id.clone(), e.to_string());
                    halted = true;
                    tracing::error!(resource = %id, error = %e, "resolution failed at dispatch");
                    log_event(
                        opts.state_dir,
                        opts.stack,
                        StackEvent::ResourceFailed {
                            stack: opts.stack.to_string(),
                            resource: id.clone(),
                            error: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            let prior_physical = stack_state
                .resources
                .get(&id)
                .and_then(|r| r.physical_id.clone());

            states.insert(id.clone(), ResourceState::Creating);
            log_event(
                opts.state_dir,
                opts.stack,
                StackEvent::ResourceStarted {
                    stack: opts.stack.to_string(),
                    resource: id.clone(),
                    action: action.to_string(),
                },
            );

            let worker_provider = Arc::clone(&provider);
            let resource_type = resource.resource_type.clone();
            let call_timeout = opts.call_timeout;
            let worker_id = id.clone();
            let handle = join_set.spawn(async move {
                let started = Instant::now();
                let done = provision_one(
                    worker_provider,
                    resource_type,
                    action,
                    prior_physical,
                    resolved,
                    call_timeout,
                )
                .await;
                (worker_id, started.elapsed().as_secs_f64(), done)
            });
            task_ids.insert(handle.id(), id);
        }

        if join_set.is_empty() {
            break;
        }

        // Wait for a completion, or for cancellation
        let joined = if cancelled || cancel_token.is_none() {
            join_set.join_next_with_id().await
        } else {
            let token = cancel_token.as_mut().expect("checked above");
            tokio::select! {
                joined = join_set.join_next_with_id() => joined,
                _ = token.cancelled() => {
                    cancelled = true;
                    halted = true;
                    tracing::warn!(stack = opts.stack, policy = ?opts.cancel_policy, "run cancelled");
                    if opts.cancel_policy == CancelPolicy::Immediate {
                        join_set.abort_all();
                    }
                    continue;
                }
            }
        };

        let Some(joined) = joined else { break };

        match joined {
            Ok((task_id, (id, duration, done))) => {
                task_ids.remove(&task_id);
                let resource = &opts.template.resources[&id];
                match done {
                    WorkDone::Finished {
                        physical_id,
                        attributes,
                        kind,
                    } => {
                        states.insert(id.clone(), ResourceState::Created);
                        match kind {
                            FinishKind::Unchanged => {
                                unchanged_set.insert(id.clone());
                                tracing::debug!(resource = %id, %physical_id, "unchanged");
                                log_event(
                                    opts.state_dir,
                                    opts.stack,
                                    StackEvent::ResourceUnchanged {
                                        stack: opts.stack.to_string(),
                                        resource: id.clone(),
                                    },
                                );
                            }
                            FinishKind::Created => {
                                created_this_run.push(id.clone());
                                record_created(
                                    &mut stack_state,
                                    &id,
                                    resource,
                                    &physical_id,
                                    attributes.clone(),
                                );
                                tracing::info!(resource = %id, %physical_id, duration, "created");
                                log_event(
                                    opts.state_dir,
                                    opts.stack,
                                    StackEvent::ResourceCreated {
                                        stack: opts.stack.to_string(),
                                        resource: id.clone(),
                                        physical_id: physical_id.clone(),
                                        duration_seconds: duration,
                                    },
                                );
                            }
                            FinishKind::Updated => {
                                record_created(
                                    &mut stack_state,
                                    &id,
                                    resource,
                                    &physical_id,
                                    attributes.clone(),
                                );
                                tracing::info!(resource = %id, %physical_id, duration, "updated");
                                log_event(
                                    opts.state_dir,
                                    opts.stack,
                                    StackEvent::ResourceUpdated {
                                        stack: opts.stack.to_string(),
                                        resource: id.clone(),
                                        physical_id: physical_id.clone(),
                                        duration_seconds: duration,
                                    },
                                );
                            }
                        }
                        physical.insert(id.clone(), physical_id);
                        // Attributes publish only after Created
                        ctx.publish(&id, attributes);
                    }
                    WorkDone::Failed { error } => {
                        states.insert(id.clone(), ResourceState::Failed);
                        record_failed(&mut stack_state, &id, resource);
                        tracing::error!(resource = %id, error = %error, "provisioning failed");
                        log_event(
                            opts.state_dir,
                            opts.stack,
                            StackEvent::ResourceFailed {
                                stack: opts.stack.to_string(),
                                resource: id.clone(),
                                error: error.clone(),
                            },
                        );
                        errors.insert(id, error);
                        halted = true;
                    }
                }
            }
            Err(join_err) => {
                // Aborted (Immediate cancel) or panicked worker
                if let Some(id) = task_ids.remove(&join_err.id()) {
                    let reason = if join_err.is_cancelled() {
                        "cancelled before completion".to_string()
                    } else {
                        format!("worker panicked: {join_err}")
                    };
                    states.insert(id.clone(), ResourceState::Failed);
                    if let Some(resource) = opts.template.resources.get(&id) {
                        record_failed(&mut stack_state, &id, resource);
                    }
                    errors.insert(id, reason);
                    halted = true;
                }
            }
        }
    }

    // Best-effort rollback: delete what this run created, newest first.
    // Pre-existing resources that were merely confirmed are never touched.
    if halted {
        for id in created_this_run.iter().rev() {
            let Some(pid) = physical.get(id) else { continue };
            match with_timeout(opts.call_timeout, provider.delete(pid)).await {
                Ok(()) => {
                    states.insert(id.clone(), ResourceState::RolledBack);
                    stack_state.resources.shift_remove(id);
                    tracing::info!(resource = %id, physical_id = %pid, "rolled back");
                    log_event(
                        opts.state_dir,
                        opts.stack,
                        StackEvent::ResourceRolledBack {
                            stack: opts.stack.to_string(),
                            resource: id.clone(),
                            physical_id: pid.clone(),
                        },
                    );
                }
                Err(e) => {
                    // Reported, never retried: the target's true state is
                    // now ambiguous and needs an operator.
                    rollback_errors.insert(id.clone(), e.to_string());
                    tracing::error!(resource = %id, error = %e, "rollback failed");
                    log_event(
                        opts.state_dir,
                        opts.stack,
                        StackEvent::RollbackFailed {
                            stack: opts.stack.to_string(),
                            resource: id.clone(),
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    // Record before resolving outputs so provisioned resources are never
    // lost to a late resolution error
    stack_state.generated_at = journal::now_iso8601();
    state::save_state(opts.state_dir, &stack_state)?;

    // Outputs resolve last, only once every resource is Created
    let mut outputs = IndexMap::new();
    if !halted && states.values().all(|s| *s == ResourceState::Created) {
        for (name, output) in &opts.template.outputs {
            let value = eval::resolve(&output.value, &ctx).map_err(|source| {
                EngineError::Resolution {
                    id: format!("output '{name}'"),
                    source,
                }
            })?;
            outputs.insert(name.clone(), value);
        }
    }

    let mut outcomes = IndexMap::new();
    for id in &order {
        let resource = &opts.template.resources[id];
        outcomes.insert(
            id.clone(),
            ResourceOutcome {
                resource_type: resource.resource_type.clone(),
                state: states[id],
                unchanged: unchanged_set.contains(id),
                physical_id: physical.get(id).cloned(),
                error: errors.get(id).cloned(),
                rollback_error: rollback_errors.get(id).cloned(),
            },
        );
    }

    let report = ApplyReport {
        stack: opts.stack.to_string(),
        run_id: run_id.clone(),
        outcomes,
        outputs,
        total_duration: start.elapsed(),
    };

    log_event(
        opts.state_dir,
        opts.stack,
        StackEvent::ApplyCompleted {
            stack: opts.stack.to_string(),
            run_id,
            created: report.created(),
            unchanged: report.unchanged(),
            failed: report.count(ResourceState::Failed),
            rolled_back: report.count(ResourceState::RolledBack),
            total_seconds: start.elapsed().as_secs_f64(),
        },
    );

    Ok(report)
}

fn dry_run_report(
    opts: &ApplyOptions<'_>,
    run_id: &str,
    order: &[String],
    stack_plan: &StackPlan,
    prior: Option<&StackState>,
    start: Instant,
) -> ApplyReport {
    let mut outcomes = IndexMap::new();
    for id in order {
        let resource = &opts.template.resources[id];
        outcomes.insert(
            id.clone(),
            ResourceOutcome {
                resource_type: resource.resource_type.clone(),
                state: ResourceState::Pending,
                unchanged: stack_plan.action_for(id) == PlanAction::NoOp,
                physical_id: prior
                    .and_then(|s| s.resources.get(id))
                    .and_then(|r| r.physical_id.clone()),
                error: None,
                rollback_error: None,
            },
        );
    }
    ApplyReport {
        stack: opts.stack.to_string(),
        run_id: run_id.to_string(),
        outcomes,
        outputs: IndexMap::new(),
        total_duration: start.elapsed(),
    }
}

/// Delete every recorded resource in reverse creation order. Records are
/// removed as deletes succeed; failures keep their record and surface in
/// the report.
pub async fn destroy(
    opts: &DestroyOptions<'_>,
    provider: Arc<dyn Provider>,
) -> Result<DestroyReport, EngineError> {
    let Some(mut stack_state) = state::load_state(opts.state_dir, opts.stack)? else {
        return Ok(DestroyReport {
            stack: opts.stack.to_string(),
            deleted: 0,
            failures: IndexMap::new(),
        });
    };

    let ids: Vec<String> = stack_state.resources.keys().cloned().collect();
    let mut deleted = 0u32;
    let mut failures = IndexMap::new();

    for id in ids.iter().rev() {
        let physical_id = stack_state
            .resources
            .get(id)
            .and_then(|r| r.physical_id.clone());
        let Some(pid) = physical_id else {
            // Failed record with nothing provisioned behind it
            stack_state.resources.shift_remove(id);
            continue;
        };

        match with_timeout(opts.call_timeout, provider.delete(&pid)).await {
            // Already gone counts as destroyed
            Ok(()) | Err(ProviderError::NotFound(_)) => {
                stack_state.resources.shift_remove(id);
                deleted += 1;
                tracing::info!(resource = %id, physical_id = %pid, "destroyed");
            }
            Err(e) => {
                tracing::error!(resource = %id, error = %e, "destroy failed");
                failures.insert(id.clone(), e.to_string());
            }
        }
    }

    stack_state.generated_at = journal::now_iso8601();
    state::save_state(opts.state_dir, &stack_state)?;
    log_event(
        opts.state_dir,
        opts.stack,
        StackEvent::DestroyCompleted {
            stack: opts.stack.to_string(),
            deleted,
            failed: failures.len() as u32,
        },
    );

    Ok(DestroyReport {
        stack: opts.stack.to_string(),
        deleted,
        failures,
    })
}
