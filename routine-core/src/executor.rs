use crate::context::ExecutionContext;
use crate::events::RuntimeEvent;
use crate::intermediate::handle_intermediate_event;
use crate::model::ProcessModel;
use crate::navigator::{navigator_for, Navigator};
use crate::store::ContextStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Collaborator interfaces ──────────────────────────────────

/// Runs a single unit of work. Failures may arrive as a rejected
/// future or as `success = false`; both channels are failure.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: StepRequest) -> Result<StepOutcome>;
}

/// Grants and revokes budget per step. `release_from_step` must be
/// idempotent on duplicate calls.
#[async_trait]
pub trait ResourceAllocator: Send + Sync {
    async fn allocate_for_step(
        &self,
        run_id: Uuid,
        requirements: &StepRequirements,
    ) -> Result<Allocation>;

    async fn release_from_step(&self, run_id: Uuid, step_id: &str, usage: StepUsage)
        -> Result<()>;
}

/// Observability hook. A `proceed = false` answer is logged and
/// ignored — the publisher can observe but not abort a run.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn emit(&self, event_type: &str, payload: Value) -> Result<PublishDecision>;
}

#[derive(Clone, Debug)]
pub struct PublishDecision {
    pub proceed: bool,
    pub reason: Option<String>,
}

impl PublishDecision {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            reason: None,
        }
    }
}

// ─── Configuration ────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Hard ceiling on executed steps per run. Guarantees termination
    /// on cyclic graphs with no exit condition.
    pub max_steps: u32,
    /// Role the run executes under; gates restricted step types.
    pub role: Role,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            role: Role::Agent,
        }
    }
}

// ─── Run result ───────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct RunResult {
    pub record: RunRecord,
    pub context: ExecutionContext,
    /// Locations the run is parked on when suspended.
    pub waiting_locations: Vec<Location>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.record.status == RunStatus::Completed
    }
}

enum StepDisposition {
    Advanced,
    Failed(StructuredError),
}

// ─── Executor ─────────────────────────────────────────────────

/// Drives the step-by-step loop over a process model: pulls next
/// locations from the navigator, routes intermediate event nodes
/// through the event handler, and runs actionable nodes through the
/// external step executor inside an allocate-execute-release envelope.
///
/// Parallel branches are interleaved round-robin over the active
/// location set; the loop is the single writer to the context, so
/// branch merges are serialized by construction.
pub struct RoutineExecutor {
    store: Arc<dyn ContextStore>,
    steps: Arc<dyn StepExecutor>,
    allocator: Arc<dyn ResourceAllocator>,
    publisher: Arc<dyn EventPublisher>,
    config: ExecutorConfig,
    stop_requested: AtomicBool,
    stop_reason: StdMutex<Option<String>>,
}

impl RoutineExecutor {
    pub fn new(
        store: Arc<dyn ContextStore>,
        steps: Arc<dyn StepExecutor>,
        allocator: Arc<dyn ResourceAllocator>,
        publisher: Arc<dyn EventPublisher>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            steps,
            allocator,
            publisher,
            config,
            stop_requested: AtomicBool::new(false),
            stop_reason: StdMutex::new(None),
        }
    }

    /// Request cancellation. The loop observes the flag at the next
    /// iteration boundary; in-flight step invocations finish on the
    /// step executor's own cancellation terms.
    pub fn stop(&self, reason: impl Into<String>) {
        *self
            .stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Start a fresh run of `model`.
    pub async fn run(
        &self,
        model: &ProcessModel,
        routine_id: &str,
        initial_variables: BTreeMap<String, Value>,
    ) -> Result<RunResult, EngineError> {
        let nav = navigator_for(model);
        let start = nav.start_location(model, routine_id)?;
        let record = RunRecord {
            run_id: Uuid::now_v7(),
            routine_id: routine_id.to_string(),
            status: RunStatus::Pending,
            steps_executed: 0,
            credits_used: 0.0,
            step_limit_reached: false,
            error: None,
            stop_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.save_run(&record).await?;
        self.store
            .append_event(
                record.run_id,
                &RuntimeEvent::RunStarted {
                    run_id: record.run_id,
                    routine_id: routine_id.to_string(),
                    model_id: model.id.clone(),
                },
            )
            .await?;
        self.publish(
            "run.started",
            json!({ "runId": record.run_id, "routineId": routine_id }),
        )
        .await;

        let context = ExecutionContext::new(initial_variables);
        self.drive(model, nav, record, context, VecDeque::from([start]))
            .await
    }

    /// Re-enter a suspended run after an external trigger resolved a
    /// wait (signal/message delivery, timer tick, or
    /// `complete_intermediate_event` on the stored context).
    pub async fn resume(
        &self,
        model: &ProcessModel,
        run_id: Uuid,
    ) -> Result<RunResult, EngineError> {
        let record = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::Store(anyhow::anyhow!("unknown run {run_id}")))?;
        let context = self.store.load_context(run_id).await?.unwrap_or_default();
        let locations = self.store.load_locations(run_id).await?;
        self.store
            .append_event(run_id, &RuntimeEvent::RunResumed { run_id })
            .await?;

        let nav = navigator_for(model);
        self.drive(model, nav, record, context, locations.into())
            .await
    }

    async fn drive(
        &self,
        model: &ProcessModel,
        nav: &dyn Navigator,
        mut record: RunRecord,
        mut context: ExecutionContext,
        mut active: VecDeque<Location>,
    ) -> Result<RunResult, EngineError> {
        record.status = RunStatus::Running;
        let run_id = record.run_id;
        let mut waiting: Vec<Location> = Vec::new();
        let mut failure: Option<StructuredError> = None;

        // Structural and event nodes never increment steps_executed, so
        // a cycle made only of gateways or pass-through events would
        // spin past the step ceiling. Raw iterations get their own
        // bound.
        let iteration_ceiling =
            u64::from(self.config.max_steps).saturating_mul(ITERATIONS_PER_STEP);
        let mut iterations: u64 = 0;

        while let Some(location) = active.pop_front() {
            iterations += 1;
            if iterations > iteration_ceiling {
                warn!(%run_id, iterations, "iteration ceiling reached, terminating");
                record.step_limit_reached = true;
                self.store
                    .append_event(
                        run_id,
                        &RuntimeEvent::StepLimitReached { limit: self.config.max_steps },
                    )
                    .await?;
                break;
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                let reason = self
                    .stop_reason
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| "stopped".to_string());
                info!(%run_id, %reason, "run stopped externally");
                self.store
                    .append_event(run_id, &RuntimeEvent::RunStopped { reason: reason.clone() })
                    .await?;
                record.stop_reason = Some(reason);
                record.status = RunStatus::Stopped;
                break;
            }

            if nav.is_end_location(model, &location) {
                debug!(%run_id, node = %location.id, "branch reached end");
                continue;
            }

            let info = nav.step_info(model, &location)?;

            // Event nodes go through the intermediate handler, never
            // the step executor.
            if info.is_event {
                let result =
                    handle_intermediate_event(model, &location.id, &location, context, Utc::now())?;
                context = result.context;
                self.record_instances(run_id, &result.thrown, &result.caught)
                    .await?;
                if result.should_wait {
                    for loc in &result.next_locations {
                        if loc.kind == LocationKind::TimerWaiting {
                            if let Some(expires_at) = loc
                                .metadata
                                .get("expiresAt")
                                .and_then(|v| serde_json::from_value(v.clone()).ok())
                            {
                                self.store
                                    .append_event(
                                        run_id,
                                        &RuntimeEvent::TimerRegistered {
                                            event_id: loc
                                                .event_id
                                                .clone()
                                                .unwrap_or_else(|| loc.id.clone()),
                                            expires_at,
                                        },
                                    )
                                    .await?;
                            }
                        }
                        self.store
                            .append_event(run_id, &RuntimeEvent::WaitEntered { location: loc.clone() })
                            .await?;
                    }
                    waiting.extend(result.next_locations);
                } else {
                    active.extend(result.next_locations);
                }
                self.persist(run_id, &context, &active, &waiting).await?;
                continue;
            }

            // Structural nodes (start, gateways) advance without
            // counting as executed steps.
            if !is_actionable(&info.step_type) {
                // Parallel joins are a barrier: each arriving branch
                // token is absorbed until every incoming flow has
                // delivered one, then the gateway fires exactly once.
                if info.step_type == "parallel_gateway" {
                    let expected = model.incoming_flows(&location.id).len() as u32;
                    if expected > 1 {
                        let arrived = context.join_arrive(&location.id);
                        if arrived < expected {
                            debug!(%run_id, gateway = %location.id, arrived, expected, "token held at join");
                            self.persist(run_id, &context, &active, &waiting).await?;
                            continue;
                        }
                        context.clear_join(&location.id);
                    }
                }
                active.extend(nav.next_locations(model, &location, &context)?);
                continue;
            }

            if record.steps_executed >= self.config.max_steps {
                warn!(%run_id, limit = self.config.max_steps, "step ceiling reached, terminating");
                record.step_limit_reached = true;
                self.store
                    .append_event(
                        run_id,
                        &RuntimeEvent::StepLimitReached { limit: self.config.max_steps },
                    )
                    .await?;
                break;
            }

            if !role_permits(self.config.role, &info.step_type) {
                let err = EngineError::PermissionDenied {
                    role: self.config.role,
                    step_type: info.step_type.clone(),
                };
                self.store
                    .append_event(
                        run_id,
                        &RuntimeEvent::PermissionDenied {
                            step_id: info.id.clone(),
                            step_type: info.step_type.clone(),
                            role: self.config.role,
                        },
                    )
                    .await?;
                failure = Some(StructuredError {
                    code: "PERMISSION_DENIED".to_string(),
                    message: err.to_string(),
                    tier: Some("tier3".to_string()),
                    strategy: None,
                    failure_point: Some(info.id),
                });
                break;
            }

            match self
                .execute_step(&mut record, &mut context, &info, &location)
                .await?
            {
                StepDisposition::Advanced => {
                    active.extend(nav.next_locations(model, &location, &context)?);
                    self.persist(run_id, &context, &active, &waiting).await?;
                }
                StepDisposition::Failed(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        // Terminal transition.
        if record.status == RunStatus::Stopped {
            record.finished_at = Some(Utc::now());
            self.publish("run.stopped", json!({ "runId": run_id })).await;
        } else if let Some(err) = failure {
            record.status = RunStatus::Failed;
            record.error = Some(err.clone());
            record.finished_at = Some(Utc::now());
            self.store
                .append_event(run_id, &RuntimeEvent::RunFailed { error: err })
                .await?;
            self.publish("run.failed", json!({ "runId": run_id })).await;
        } else if !waiting.is_empty() {
            record.status = RunStatus::Suspended;
            self.store
                .append_event(
                    run_id,
                    &RuntimeEvent::RunSuspended { waiting_locations: waiting.clone() },
                )
                .await?;
            self.publish("run.suspended", json!({ "runId": run_id })).await;
        } else {
            record.status = RunStatus::Completed;
            record.finished_at = Some(Utc::now());
            self.store
                .append_event(
                    run_id,
                    &RuntimeEvent::RunCompleted {
                        steps_executed: record.steps_executed,
                        credits_used: record.credits_used,
                    },
                )
                .await?;
            self.publish(
                "run.completed",
                json!({ "runId": run_id, "steps": record.steps_executed }),
            )
            .await;
        }

        self.store.save_run(&record).await?;
        self.persist(run_id, &context, &active, &waiting).await?;
        Ok(RunResult {
            record,
            context,
            waiting_locations: waiting,
        })
    }

    /// Allocate, execute, release — one logical transaction from the
    /// run's perspective.
    async fn execute_step(
        &self,
        record: &mut RunRecord,
        context: &mut ExecutionContext,
        info: &StepInfo,
        location: &Location,
    ) -> Result<StepDisposition, EngineError> {
        let run_id = record.run_id;
        let (tool, strategy) = infer_tool_and_strategy(info);
        let requirements = StepRequirements {
            step_id: info.id.clone(),
            step_type: info.step_type.clone(),
            estimated_credits: estimate_credits(info),
        };

        let allocation = match self.allocator.allocate_for_step(run_id, &requirements).await {
            Ok(allocation) => allocation,
            Err(e) => {
                return Ok(StepDisposition::Failed(self.structured(
                    "ALLOCATION_FAILED",
                    e.to_string(),
                    strategy,
                    &info.id,
                )));
            }
        };

        self.store
            .append_event(
                run_id,
                &RuntimeEvent::StepStarted {
                    step_id: info.id.clone(),
                    step_type: info.step_type.clone(),
                    tool: tool.clone(),
                    strategy,
                },
            )
            .await?;
        self.publish("step.started", json!({ "runId": run_id, "stepId": info.id }))
            .await;

        let request = StepRequest {
            run_id,
            routine_id: location.routine_id.clone(),
            step_id: info.id.clone(),
            tool,
            strategy,
            inputs: context.variables.clone(),
            config: info.config.clone(),
        };

        let timeout = std::time::Duration::from_millis(allocation.timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.steps.execute(request)).await;

        let (disposition, usage) = match outcome {
            Ok(Ok(out)) if out.success => {
                context.merge_outputs(out.outputs);
                record.steps_executed += 1;
                record.credits_used += out.metadata.credits_cost;
                self.store
                    .append_event(
                        run_id,
                        &RuntimeEvent::StepCompleted {
                            step_id: info.id.clone(),
                            credits_used: out.metadata.credits_cost,
                            duration_ms: out.metadata.duration_ms,
                        },
                    )
                    .await?;
                self.publish("step.completed", json!({ "runId": run_id, "stepId": info.id }))
                    .await;
                (
                    StepDisposition::Advanced,
                    StepUsage {
                        credits_used: out.metadata.credits_cost,
                        completed: true,
                    },
                )
            }
            Ok(Ok(out)) => (
                StepDisposition::Failed(self.structured(
                    "STEP_EXECUTION_FAILED",
                    format!("step '{}' reported failure", info.id),
                    strategy,
                    &info.id,
                )),
                StepUsage {
                    credits_used: out.metadata.credits_cost,
                    completed: false,
                },
            ),
            Ok(Err(e)) => (
                StepDisposition::Failed(self.structured(
                    "STEP_EXECUTION_FAILED",
                    e.to_string(),
                    strategy,
                    &info.id,
                )),
                StepUsage {
                    credits_used: 0.0,
                    completed: false,
                },
            ),
            Err(_) => (
                StepDisposition::Failed(self.structured(
                    "STEP_TIMEOUT",
                    format!("step '{}' exceeded {}ms", info.id, allocation.timeout_ms),
                    strategy,
                    &info.id,
                )),
                StepUsage {
                    credits_used: 0.0,
                    completed: false,
                },
            ),
        };

        if let StepDisposition::Failed(err) = &disposition {
            self.store
                .append_event(
                    run_id,
                    &RuntimeEvent::StepFailed {
                        step_id: info.id.clone(),
                        error: err.clone(),
                    },
                )
                .await?;
            self.publish("step.failed", json!({ "runId": run_id, "stepId": info.id }))
                .await;
        }

        if let Err(e) = self
            .allocator
            .release_from_step(run_id, &info.id, usage)
            .await
        {
            return Ok(StepDisposition::Failed(self.structured(
                "ALLOCATION_FAILED",
                format!("release failed: {e}"),
                strategy,
                &info.id,
            )));
        }

        Ok(disposition)
    }

    fn structured(
        &self,
        code: &str,
        message: String,
        strategy: Strategy,
        step_id: &str,
    ) -> StructuredError {
        StructuredError {
            code: code.to_string(),
            message,
            tier: Some("tier3".to_string()),
            strategy: Some(strategy),
            failure_point: Some(step_id.to_string()),
        }
    }

    async fn record_instances(
        &self,
        run_id: Uuid,
        thrown: &[EventInstance],
        caught: &[EventInstance],
    ) -> Result<(), EngineError> {
        for instance in thrown {
            self.store
                .append_event(
                    run_id,
                    &RuntimeEvent::EventThrown {
                        event_id: instance.event_id.clone(),
                        kind: instance.kind,
                        instance_id: instance.id.clone(),
                    },
                )
                .await?;
            match instance.kind {
                EventKind::Signal => {
                    self.store
                        .append_event(
                            run_id,
                            &RuntimeEvent::SignalPublished {
                                signal_ref: payload_str(instance, "signalRef"),
                                scope: payload_str(instance, "scope"),
                            },
                        )
                        .await?;
                }
                EventKind::Message => {
                    self.store
                        .append_event(
                            run_id,
                            &RuntimeEvent::MessagePublished {
                                message_ref: payload_str(instance, "messageRef"),
                            },
                        )
                        .await?;
                }
                EventKind::Link => {
                    self.store
                        .append_event(
                            run_id,
                            &RuntimeEvent::LinkJumped {
                                from: instance.event_id.clone(),
                                to: payload_str(instance, "target"),
                                link_name: payload_str(instance, "linkName"),
                            },
                        )
                        .await?;
                }
                _ => {}
            }
        }
        for instance in caught {
            self.store
                .append_event(
                    run_id,
                    &RuntimeEvent::EventCaught {
                        event_id: instance.event_id.clone(),
                        kind: instance.kind,
                        instance_id: instance.id.clone(),
                    },
                )
                .await?;
            match instance.kind {
                EventKind::Signal => {
                    self.store
                        .append_event(
                            run_id,
                            &RuntimeEvent::SignalConsumed {
                                signal_ref: payload_str(instance, "signalRef"),
                                signal_id: payload_str(instance, "signalId"),
                                by_event: instance.event_id.clone(),
                            },
                        )
                        .await?;
                }
                EventKind::Message => {
                    self.store
                        .append_event(
                            run_id,
                            &RuntimeEvent::MessageConsumed {
                                message_ref: payload_str(instance, "messageRef"),
                                message_id: payload_str(instance, "messageId"),
                                by_event: instance.event_id.clone(),
                            },
                        )
                        .await?;
                }
                EventKind::Timer => {
                    // The registration is already on the log; the
                    // catch itself is covered by EventCaught.
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn persist(
        &self,
        run_id: Uuid,
        context: &ExecutionContext,
        active: &VecDeque<Location>,
        waiting: &[Location],
    ) -> Result<(), EngineError> {
        self.store.save_context(run_id, context).await?;
        let all: Vec<Location> = active.iter().cloned().chain(waiting.iter().cloned()).collect();
        self.store.save_locations(run_id, &all).await?;
        Ok(())
    }

    async fn publish(&self, event_type: &str, payload: Value) {
        match self.publisher.emit(event_type, payload).await {
            Ok(decision) if !decision.proceed => {
                warn!(event_type, reason = ?decision.reason, "publisher vetoed, continuing");
            }
            Ok(_) => {}
            Err(e) => warn!(event_type, error = %e, "publisher failed, continuing"),
        }
    }
}

// ─── Loop helpers ─────────────────────────────────────────────

/// Raw loop iterations allowed per permitted step. Keeps gateway-only
/// and pass-through-event cycles bounded.
const ITERATIONS_PER_STEP: u64 = 16;

/// Structural nodes advance for free; everything else is a billable
/// step. Event nodes never reach this check.
fn is_actionable(step_type: &str) -> bool {
    !matches!(
        step_type,
        "start_event" | "end_event" | "exclusive_gateway" | "parallel_gateway"
    )
}

/// Restricted step types by role. Only subroutines are restricted in
/// this core: admin and agent may spawn them, user and guest may not.
fn role_permits(role: Role, step_type: &str) -> bool {
    if step_type != "subroutine" {
        return true;
    }
    matches!(role, Role::Admin | Role::Agent)
}

/// A configured tool means deterministic plumbing; absent one, the
/// step runs under the reasoning strategy.
fn infer_tool_and_strategy(info: &StepInfo) -> (String, Strategy) {
    if let Some(tool) = info.config.get("tool").and_then(|v| v.as_str()) {
        return (tool.to_string(), Strategy::Deterministic);
    }
    let tool = match info.step_type.as_str() {
        "subroutine" => "subroutine",
        _ => "generic",
    };
    (tool.to_string(), Strategy::Reasoning)
}

fn estimate_credits(info: &StepInfo) -> f64 {
    if let Some(estimate) = info.config.get("estimatedCredits").and_then(|v| v.as_f64()) {
        return estimate;
    }
    match info.step_type.as_str() {
        "subroutine" => 10.0,
        _ => 1.0,
    }
}

fn payload_str(instance: &EventInstance, key: &str) -> String {
    instance
        .payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SignalEvent;
    use crate::model::{Element, ElementKind, EventDefinition, Flow, ModelDialect};
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicU32;

    // ── Mocks ──

    struct RecordingSteps {
        calls: AtomicU32,
        seen: StdMutex<Vec<String>>,
        mode: StepMode,
    }

    enum StepMode {
        Succeed,
        Reject,
        ReportFailure,
        Hang,
    }

    impl RecordingSteps {
        fn new(mode: StepMode) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                seen: StdMutex::new(Vec::new()),
                mode,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Step ids in execution order.
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for RecordingSteps {
        async fn execute(&self, request: StepRequest) -> Result<StepOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.step_id.clone());
            match self.mode {
                StepMode::Succeed => Ok(StepOutcome {
                    success: true,
                    outputs: BTreeMap::from([(
                        format!("{}_done", request.step_id),
                        Value::from(true),
                    )]),
                    metadata: StepMetadata {
                        tokens_used: 10,
                        credits_cost: 1.0,
                        duration_ms: 5,
                    },
                }),
                StepMode::Reject => Err(anyhow::anyhow!("tool backend unavailable")),
                StepMode::ReportFailure => Ok(StepOutcome {
                    success: false,
                    outputs: BTreeMap::new(),
                    metadata: StepMetadata {
                        credits_cost: 0.4,
                        ..Default::default()
                    },
                }),
                StepMode::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    unreachable!("hung step should have timed out")
                }
            }
        }
    }

    struct RecordingAllocator {
        allocations: AtomicU32,
        releases: StdMutex<Vec<StepUsage>>,
        timeout_ms: u64,
    }

    impl RecordingAllocator {
        fn new(timeout_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                allocations: AtomicU32::new(0),
                releases: StdMutex::new(Vec::new()),
                timeout_ms,
            })
        }

        fn releases(&self) -> Vec<StepUsage> {
            self.releases.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceAllocator for RecordingAllocator {
        async fn allocate_for_step(
            &self,
            _run_id: Uuid,
            requirements: &StepRequirements,
        ) -> Result<Allocation> {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            Ok(Allocation {
                allocation_id: Uuid::now_v7(),
                credits_granted: requirements.estimated_credits,
                timeout_ms: self.timeout_ms,
            })
        }

        async fn release_from_step(
            &self,
            _run_id: Uuid,
            _step_id: &str,
            usage: StepUsage,
        ) -> Result<()> {
            self.releases.lock().unwrap().push(usage);
            Ok(())
        }
    }

    struct StaticPublisher {
        proceed: bool,
    }

    #[async_trait]
    impl EventPublisher for StaticPublisher {
        async fn emit(&self, _event_type: &str, _payload: Value) -> Result<PublishDecision> {
            Ok(PublishDecision {
                proceed: self.proceed,
                reason: (!self.proceed).then(|| "vetoed by policy".to_string()),
            })
        }
    }

    fn executor(
        steps: Arc<RecordingSteps>,
        allocator: Arc<RecordingAllocator>,
        config: ExecutorConfig,
    ) -> (Arc<MemoryStore>, RoutineExecutor) {
        let store = Arc::new(MemoryStore::new());
        let exec = RoutineExecutor::new(
            store.clone(),
            steps,
            allocator,
            Arc::new(StaticPublisher { proceed: true }),
            config,
        );
        (store, exec)
    }

    // ── Models ──

    fn sequential_two_steps() -> ProcessModel {
        ProcessModel::new(
            "seq",
            ModelDialect::Sequential,
            vec![
                Element::new("s1", ElementKind::SequentialStep),
                Element::new("s2", ElementKind::SequentialStep),
            ],
            vec![],
        )
        .unwrap()
    }

    fn cyclic_model() -> ProcessModel {
        ProcessModel::new(
            "cycle",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("again", ElementKind::Task),
            ],
            vec![
                Flow::new("f1", "start", "again"),
                Flow::new("f2", "again", "again"),
            ],
        )
        .unwrap()
    }

    fn signal_catch_model() -> ProcessModel {
        ProcessModel::new(
            "sig",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("catch", ElementKind::IntermediateCatchEvent).with_definition(
                    EventDefinition::Signal {
                        signal_ref: "approved".to_string(),
                        scope: "global".to_string(),
                    },
                ),
                Element::new("after", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "catch"),
                Flow::new("f2", "catch", "after"),
                Flow::new("f3", "after", "end"),
            ],
        )
        .unwrap()
    }

    // ── Scenarios ──

    #[tokio::test]
    async fn sequential_two_steps_complete() {
        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (store, exec) = executor(steps.clone(), allocator.clone(), ExecutorConfig::default());

        let result = exec
            .run(&sequential_two_steps(), "r1", BTreeMap::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.record.status, RunStatus::Completed);
        assert_eq!(result.record.steps_executed, 2);
        assert_eq!(result.record.credits_used, 2.0);
        assert_eq!(steps.calls(), 2);
        assert_eq!(allocator.allocations.load(Ordering::SeqCst), 2);
        let releases = allocator.releases();
        assert_eq!(releases.len(), 2);
        assert!(releases.iter().all(|u| u.completed));
        // Step outputs merged into variables.
        assert_eq!(result.context.variables["s1_done"], Value::from(true));
        assert_eq!(result.context.variables["s2_done"], Value::from(true));

        let events = store.read_events(result.record.run_id, 1).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::RunCompleted { steps_executed: 2, .. })));
    }

    #[tokio::test]
    async fn parallel_branches_all_execute_before_completion() {
        let model = ProcessModel::new(
            "par",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("fork", ElementKind::ParallelGateway),
                Element::new("a", ElementKind::Task),
                Element::new("b", ElementKind::Task),
                Element::new("join", ElementKind::ParallelGateway),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "fork"),
                Flow::new("f2", "fork", "a"),
                Flow::new("f3", "fork", "b"),
                Flow::new("f4", "a", "join"),
                Flow::new("f5", "b", "join"),
                Flow::new("f6", "join", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (_, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(steps.calls(), 2, "both branches executed");
        assert!(result.context.variables.contains_key("a_done"));
        assert!(result.context.variables.contains_key("b_done"));
    }

    #[tokio::test]
    async fn unbalanced_join_releases_once_after_all_branches() {
        // fork → (a1 → a2 → a3 → join) ∥ (b1 → join) → after → end.
        // The short branch reaches the join two steps early; the join
        // must hold its token until a3 arrives, then fire once.
        let model = ProcessModel::new(
            "unbalanced",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("fork", ElementKind::ParallelGateway),
                Element::new("a1", ElementKind::Task),
                Element::new("a2", ElementKind::Task),
                Element::new("a3", ElementKind::Task),
                Element::new("b1", ElementKind::Task),
                Element::new("join", ElementKind::ParallelGateway),
                Element::new("after", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "fork"),
                Flow::new("f2", "fork", "a1"),
                Flow::new("f3", "fork", "b1"),
                Flow::new("f4", "a1", "a2"),
                Flow::new("f5", "a2", "a3"),
                Flow::new("f6", "a3", "join"),
                Flow::new("f7", "b1", "join"),
                Flow::new("f8", "join", "after"),
                Flow::new("f9", "after", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (_, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(result.record.steps_executed, 5);

        let mut seen = steps.seen();
        seen.sort();
        assert_eq!(seen, vec!["a1", "a2", "a3", "after", "b1"], "every step exactly once");
        assert!(
            result.context.join_arrivals.is_empty(),
            "barrier cleared after release"
        );
    }

    #[tokio::test]
    async fn gateway_only_cycle_terminates() {
        // gw1 → gw2 → gw1 never executes a step, so the raw iteration
        // bound is the only thing standing between this and a hang.
        let model = ProcessModel::new(
            "spin",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("gw1", ElementKind::ExclusiveGateway),
                Element::new("gw2", ElementKind::ExclusiveGateway),
            ],
            vec![
                Flow::new("f1", "start", "gw1"),
                Flow::new("f2", "gw1", "gw2"),
                Flow::new("f3", "gw2", "gw1"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let config = ExecutorConfig {
            max_steps: 4,
            ..Default::default()
        };
        let (store, exec) = executor(steps.clone(), allocator, config);

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();

        assert_eq!(result.record.status, RunStatus::Completed);
        assert!(result.record.step_limit_reached);
        assert_eq!(steps.calls(), 0);

        let events = store.read_events(result.record.run_id, 1).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::StepLimitReached { .. })));
    }

    #[tokio::test]
    async fn step_ceiling_terminates_cyclic_graph() {
        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let config = ExecutorConfig {
            max_steps: 7,
            ..Default::default()
        };
        let (store, exec) = executor(steps.clone(), allocator, config);

        let result = exec.run(&cyclic_model(), "r1", BTreeMap::new()).await.unwrap();

        assert_eq!(steps.calls(), 7, "exactly the ceiling");
        assert_eq!(result.record.status, RunStatus::Completed);
        assert!(result.record.step_limit_reached);

        let events = store.read_events(result.record.run_id, 1).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::StepLimitReached { limit: 7 })));
    }

    #[tokio::test]
    async fn suspends_on_signal_catch_and_resumes_after_delivery() {
        let model = signal_catch_model();
        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (store, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let suspended = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert_eq!(suspended.record.status, RunStatus::Suspended);
        assert_eq!(suspended.waiting_locations.len(), 1);
        assert_eq!(suspended.waiting_locations[0].kind, LocationKind::SignalWaiting);
        assert_eq!(steps.calls(), 0, "no step ran before the wait");

        // External delivery: inject the signal into the stored context.
        let run_id = suspended.record.run_id;
        let mut ctx = store.load_context(run_id).await.unwrap().unwrap();
        ctx.push_signal(SignalEvent {
            id: "sig-1".to_string(),
            signal_ref: "approved".to_string(),
            scope: "global".to_string(),
            payload: Value::Null,
            propagated_at: Utc::now(),
        });
        store.save_context(run_id, &ctx).await.unwrap();

        let finished = exec.resume(&model, run_id).await.unwrap();
        assert!(finished.success());
        assert_eq!(steps.calls(), 1, "the task after the catch ran");
        assert!(finished.waiting_locations.is_empty());

        let events = store.read_events(run_id, 1).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::SignalConsumed { .. })));
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::RunResumed { .. })));
    }

    #[tokio::test]
    async fn permission_denied_for_guest_subroutine() {
        let model = ProcessModel::new(
            "sub",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("spawn", ElementKind::Subroutine),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "spawn"),
                Flow::new("f2", "spawn", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let config = ExecutorConfig {
            role: Role::Guest,
            ..Default::default()
        };
        let (_, exec) = executor(steps.clone(), allocator.clone(), config);

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert_eq!(result.record.status, RunStatus::Failed);
        let error = result.record.error.unwrap();
        assert_eq!(error.code, "PERMISSION_DENIED");
        assert!(error.message.contains("Permission denied"));
        assert_eq!(steps.calls(), 0, "denied step never executed");
        assert_eq!(allocator.allocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn agent_may_run_subroutines() {
        let model = ProcessModel::new(
            "sub",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("spawn", ElementKind::Subroutine),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "spawn"),
                Flow::new("f2", "spawn", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (_, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(steps.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_step_fails_run_with_partial_release() {
        let steps = RecordingSteps::new(StepMode::Reject);
        let allocator = RecordingAllocator::new(30_000);
        let (_, exec) = executor(steps, allocator.clone(), ExecutorConfig::default());

        let result = exec
            .run(&sequential_two_steps(), "r1", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.record.status, RunStatus::Failed);
        let error = result.record.error.unwrap();
        assert_eq!(error.code, "STEP_EXECUTION_FAILED");
        assert_eq!(error.failure_point.as_deref(), Some("s1"));
        assert_eq!(error.tier.as_deref(), Some("tier3"));

        let releases = allocator.releases();
        assert_eq!(releases.len(), 1);
        assert!(!releases[0].completed, "partial usage reported");
    }

    #[tokio::test]
    async fn success_false_outcome_is_also_failure() {
        let steps = RecordingSteps::new(StepMode::ReportFailure);
        let allocator = RecordingAllocator::new(30_000);
        let (_, exec) = executor(steps, allocator.clone(), ExecutorConfig::default());

        let result = exec
            .run(&sequential_two_steps(), "r1", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.record.status, RunStatus::Failed);
        let releases = allocator.releases();
        assert_eq!(releases[0].credits_used, 0.4, "partial cost reported");
        assert!(!releases[0].completed);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_feeds_failure_path() {
        let steps = RecordingSteps::new(StepMode::Hang);
        let allocator = RecordingAllocator::new(50);
        let (_, exec) = executor(steps, allocator, ExecutorConfig::default());

        let result = exec
            .run(&sequential_two_steps(), "r1", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.record.status, RunStatus::Failed);
        assert_eq!(result.record.error.unwrap().code, "STEP_TIMEOUT");
    }

    #[tokio::test]
    async fn publisher_veto_is_non_fatal() {
        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let store = Arc::new(MemoryStore::new());
        let exec = RoutineExecutor::new(
            store,
            steps.clone(),
            allocator,
            Arc::new(StaticPublisher { proceed: false }),
            ExecutorConfig::default(),
        );

        let result = exec
            .run(&sequential_two_steps(), "r1", BTreeMap::new())
            .await
            .unwrap();
        assert!(result.success(), "veto logs but never aborts");
        assert_eq!(steps.calls(), 2);
    }

    #[tokio::test]
    async fn stop_requests_are_observed() {
        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (_, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        exec.stop("operator abort");
        let result = exec
            .run(&sequential_two_steps(), "r1", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(result.record.status, RunStatus::Stopped);
        assert_eq!(result.record.stop_reason.as_deref(), Some("operator abort"));
        assert_eq!(steps.calls(), 0);
    }

    #[tokio::test]
    async fn error_throw_ends_branch_without_failing_run() {
        let model = ProcessModel::new(
            "err",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("boom", ElementKind::IntermediateThrowEvent).with_definition(
                    EventDefinition::Error {
                        error_code: "E_FATAL".to_string(),
                        error_message: None,
                    },
                ),
                Element::new("after", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "boom"),
                Flow::new("f2", "boom", "after"),
                Flow::new("f3", "after", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (store, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();

        // The branch stops at the throw; boundary propagation is the
        // supervising layer's job.
        assert_eq!(result.record.status, RunStatus::Completed);
        assert_eq!(steps.calls(), 0, "node after the error throw never ran");
        assert_eq!(result.context.errors().len(), 1);
        assert_eq!(result.context.errors()[0]["errorCode"], "E_FATAL");

        let events = store.read_events(result.record.run_id, 1).await.unwrap();
        assert!(events.iter().any(|(_, e)| matches!(
            e,
            RuntimeEvent::EventThrown { kind: EventKind::Error, .. }
        )));
    }

    #[tokio::test]
    async fn link_jump_skips_to_catch_target() {
        let model = ProcessModel::new(
            "link",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("throw", ElementKind::IntermediateThrowEvent)
                    .with_definition(EventDefinition::Link { name: "hop".to_string() }),
                Element::new("skipped", ElementKind::Task),
                Element::new("catch", ElementKind::IntermediateCatchEvent)
                    .with_definition(EventDefinition::Link { name: "hop".to_string() }),
                Element::new("landed", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "throw"),
                Flow::new("f2", "throw", "skipped"),
                Flow::new("f3", "skipped", "end"),
                Flow::new("f4", "catch", "landed"),
                Flow::new("f5", "landed", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (store, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let result = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(steps.calls(), 1);
        assert!(result.context.variables.contains_key("landed_done"));
        assert!(!result.context.variables.contains_key("skipped_done"));

        let events = store.read_events(result.record.run_id, 1).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::LinkJumped { .. })));
    }

    #[tokio::test]
    async fn timer_catch_suspends_then_resumes_after_expiry() {
        let model = ProcessModel::new(
            "tm",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("wait", ElementKind::IntermediateCatchEvent).with_definition(
                    EventDefinition::Timer {
                        duration: Some("PT0H0M0S".to_string()),
                        due_date: None,
                    },
                ),
                Element::new("after", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "wait"),
                Flow::new("f2", "wait", "after"),
                Flow::new("f3", "after", "end"),
            ],
        )
        .unwrap();

        let steps = RecordingSteps::new(StepMode::Succeed);
        let allocator = RecordingAllocator::new(30_000);
        let (store, exec) = executor(steps.clone(), allocator, ExecutorConfig::default());

        let suspended = exec.run(&model, "r1", BTreeMap::new()).await.unwrap();
        assert_eq!(suspended.record.status, RunStatus::Suspended);
        assert_eq!(suspended.waiting_locations[0].kind, LocationKind::TimerWaiting);

        let events = store.read_events(suspended.record.run_id, 1).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::TimerRegistered { .. })));

        // Zero-duration timer is already due on the next visit.
        let finished = exec.resume(&model, suspended.record.run_id).await.unwrap();
        assert!(finished.success());
        assert_eq!(steps.calls(), 1);
    }
}
