use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::EventBus;
use conclave_core::traits::{AgentKey, AgentProvider, OutputSource};
use conclave_core::types::{Decisions, RunId, WorkflowEvent};

use super::prompt::render_prompt;
use super::result::{WorkflowContext, WorkflowResult};
use super::spec::{StateDef, Target, WorkflowSpec};
use super::state::RunState;
use crate::condition::{ConditionEvaluator, ConditionExtension};
use crate::response::{parse_strict, preview};

/// Default hard step ceiling multiplier.
pub const DEFAULT_CEILING_MULTIPLIER: usize = 3;

/// Why the run stopped before entering a state.
#[derive(Debug, Clone, PartialEq)]
enum ExitReason {
    TurnBudget,
    Condition(String),
}

/// Drives one workflow: executes states one at a time, routes on each reply's
/// decisions, and stops at the terminal state, an exit condition, the turn
/// budget, the step ceiling, cancellation, or the first step error.
pub struct WorkflowEngine {
    spec: Arc<WorkflowSpec>,
    agents: Arc<dyn AgentProvider>,
    evaluator: ConditionEvaluator,
    agent_timeout: Option<Duration>,
    ceiling_multiplier: usize,
    step_limit: Option<usize>,
    cancel: CancellationToken,
    event_bus: Option<Arc<EventBus>>,
    output: Option<Arc<dyn OutputSource>>,
}

impl WorkflowEngine {
    /// Build an engine. Fails on an invalid spec, before anything runs.
    pub fn new(spec: WorkflowSpec, agents: Arc<dyn AgentProvider>) -> Result<Self> {
        spec.validate()?;
        let evaluator = ConditionEvaluator::new(spec.max_turns);
        Ok(Self {
            spec: Arc::new(spec),
            agents,
            evaluator,
            agent_timeout: None,
            ceiling_multiplier: DEFAULT_CEILING_MULTIPLIER,
            step_limit: None,
            cancel: CancellationToken::new(),
            event_bus: None,
            output: None,
        })
    }

    pub fn with_agent_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_ceiling_multiplier(mut self, multiplier: usize) -> Self {
        self.ceiling_multiplier = multiplier.max(1);
        self
    }

    /// Fixed step limit, replacing `max_turns × multiplier`. A limit below
    /// `max_turns` stops the run with `RecursionBound` before the turn budget.
    pub fn with_step_ceiling(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit.max(1));
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_output_source(mut self, output: Arc<dyn OutputSource>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_extension(mut self, extension: Arc<dyn ConditionExtension>) -> Self {
        self.evaluator = self.evaluator.with_extension(extension);
        self
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    /// Token that stops the run before its next state begins.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Absolute step limit for one run.
    ///
    /// Every step spends a turn, so a multiplier-derived ceiling is never below
    /// the turn budget and the budget ends the run first. Only an explicit
    /// `with_step_ceiling` under `max_turns` is reported as `RecursionBound`.
    pub fn step_ceiling(&self) -> usize {
        self.step_limit.unwrap_or_else(|| {
            self.spec.max_turns.saturating_mul(self.ceiling_multiplier).max(1)
        })
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Execute the workflow to completion. Step failures are reported in the
    /// result, never returned as errors.
    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowResult {
        let run_id = RunId::new();
        let initial_message = if ctx.initial_message.trim().is_empty() {
            self.spec.default_initial_message()
        } else {
            ctx.initial_message.clone()
        };
        let mut state = RunState::new(
            run_id.clone(),
            &self.spec,
            initial_message,
            ctx.variables.clone(),
        );
        let ceiling = self.step_ceiling();

        info!(
            run_id = %run_id,
            workflow = %self.spec.name,
            max_turns = self.spec.max_turns,
            ceiling,
            "Workflow run started"
        );
        self.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            workflow: self.spec.name.clone(),
        });

        let mut current = Some(self.spec.start_state().name.clone());
        let mut steps = 0usize;

        while let Some(state_name) = current.take() {
            if self.cancel.is_cancelled() {
                warn!(run_id = %run_id, state = %state_name, "Workflow run cancelled");
                state.fail(ConclaveError::Cancelled.to_string(), Some(&state_name));
                break;
            }

            if let Some(reason) = self.exit_reason(&state) {
                self.finish_on_exit(&mut state, reason);
                break;
            }

            if steps >= ceiling {
                let e = ConclaveError::RecursionBound { limit: ceiling };
                error!(run_id = %run_id, state = %state_name, limit = ceiling, "Step ceiling reached");
                state.fail(e.to_string(), Some(&state_name));
                break;
            }
            steps += 1;

            let Some(def) = self.spec.state(&state_name) else {
                let e = ConclaveError::Config(format!("state '{}' not found", state_name));
                state.fail(e.to_string(), Some(&state_name));
                break;
            };

            match self.step(def, &mut state, ctx).await {
                Ok(next) => current = next,
                Err(e) => {
                    error!(
                        run_id = %run_id,
                        state = %def.name,
                        agent = %def.agent,
                        error = %e,
                        "Workflow step failed"
                    );
                    state.fail(e.to_string(), Some(&def.name));
                    break;
                }
            }
        }

        let final_output = self.final_output(&state, ctx).await;
        let result = WorkflowResult::from_state(state, final_output);

        info!(
            run_id = %run_id,
            workflow = %result.workflow_name,
            success = result.success,
            total_turns = result.total_turns,
            elapsed_ms = result.elapsed_ms,
            "Workflow run finished"
        );
        self.publish(WorkflowEvent::RunCompleted {
            run_id,
            success: result.success,
            total_turns: result.total_turns,
            error: result.error_message.clone(),
        });

        result
    }

    /// Global exit checks, before a state runs: turn budget, then declared
    /// exit conditions against run state only.
    fn exit_reason(&self, state: &RunState) -> Option<ExitReason> {
        if state.total_turns >= state.max_turns {
            return Some(ExitReason::TurnBudget);
        }
        let no_decisions = Decisions::new();
        self.spec
            .exit_conditions
            .iter()
            .find(|e| self.evaluator.evaluate(&e.condition, &no_decisions, state))
            .map(|e| ExitReason::Condition(e.condition.clone()))
    }

    fn finish_on_exit(&self, state: &mut RunState, reason: ExitReason) {
        let reason_text = match &reason {
            ExitReason::TurnBudget => {
                let e = ConclaveError::TurnBudgetExhausted {
                    max_turns: state.max_turns,
                };
                warn!(
                    run_id = %state.run_id,
                    total_turns = state.total_turns,
                    "Turn budget exhausted"
                );
                state.fail(e.to_string(), None);
                "max_turns".to_string()
            }
            ExitReason::Condition(expr) => {
                info!(run_id = %state.run_id, condition = %expr, "Exit condition met");
                expr.clone()
            }
        };
        self.publish(WorkflowEvent::ExitTriggered {
            run_id: state.run_id.clone(),
            reason: reason_text,
        });
    }

    /// Execute one state and return the next state name (`None` = terminal).
    async fn step(
        &self,
        def: &StateDef,
        state: &mut RunState,
        ctx: &WorkflowContext,
    ) -> Result<Option<String>> {
        let turn = state.total_turns + 1;
        info!(
            run_id = %state.run_id,
            state = %def.name,
            agent = %def.agent,
            turn,
            "Entering state"
        );
        self.publish(WorkflowEvent::StateEntered {
            run_id: state.run_id.clone(),
            state: def.name.clone(),
            agent: def.agent.clone(),
            turn,
        });

        let prompt = render_prompt(&def.prompt, state);
        let kind = self
            .spec
            .agent(&def.agent)
            .map(|slot| slot.kind)
            .unwrap_or_default();
        let key = AgentKey::new(&self.spec.name, &def.agent, kind, &ctx.workspace);

        let started = Instant::now();
        let raw = self.invoke(&key, prompt).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let parsed = parse_strict(&raw).map_err(|e| {
            debug!(reply = %preview(&raw, 200), "Unparseable agent reply");
            ConclaveError::ResponseContract {
                agent: def.agent.clone(),
                state: def.name.clone(),
                message: e.to_string(),
            }
        })?;

        debug!(
            state = %def.name,
            agent = %def.agent,
            elapsed_ms,
            decisions = ?parsed.decisions,
            "Agent replied"
        );
        self.publish(WorkflowEvent::AgentReplied {
            run_id: state.run_id.clone(),
            state: def.name.clone(),
            agent: def.agent.clone(),
            decisions: parsed.decisions.clone(),
            elapsed_ms,
        });

        state.record_step(&def.name, &def.agent, parsed);

        Ok(self.route(def, state))
    }

    /// Acquire the agent and call it, racing cancellation and the timeout.
    /// Every failure surfaces as an agent invocation error.
    async fn invoke(&self, key: &AgentKey, prompt: String) -> Result<String> {
        let agent_name = key.agent.clone();
        let call = async {
            let agent = self.agents.acquire(key).await?;
            match self.agent_timeout {
                Some(limit) => tokio::time::timeout(limit, agent.run(prompt))
                    .await
                    .map_err(|_| {
                        ConclaveError::agent(
                            &agent_name,
                            format!("timed out after {}s", limit.as_secs_f64()),
                        )
                    })?,
                None => agent.run(prompt).await,
            }
        };

        let outcome = tokio::select! {
            outcome = call => outcome,
            _ = self.cancel.cancelled() => return Err(ConclaveError::Cancelled),
        };

        outcome.map_err(|e| match e {
            e @ (ConclaveError::AgentInvocation { .. } | ConclaveError::Cancelled) => e,
            other => ConclaveError::agent(&agent_name, other.to_string()),
        })
    }

    /// First satisfied transition wins; none means terminal.
    fn route(&self, def: &StateDef, state: &mut RunState) -> Option<String> {
        let chosen = def
            .transitions
            .iter()
            .find(|t| self.evaluator.evaluate(&t.condition, &state.decisions, &*state));

        let (target, condition) = match chosen {
            Some(t) => (t.target.clone(), Some(t.condition.clone())),
            None => {
                debug!(state = %def.name, "No transition matched, ending run");
                (Target::Terminal, None)
            }
        };

        if let Target::State(next) = &target {
            let count = state.record_edge(&def.agent, next);
            debug!(
                from = %def.name,
                to = %next,
                edge_count = count,
                "Transition"
            );
        } else {
            debug!(from = %def.name, "Transition to terminal");
        }

        self.publish(WorkflowEvent::Transition {
            run_id: state.run_id.clone(),
            from: def.name.clone(),
            to: target.state().map(str::to_string),
            condition,
        });

        match target {
            Target::State(next) => Some(next),
            Target::Terminal => None,
        }
    }

    async fn final_output(&self, state: &RunState, ctx: &WorkflowContext) -> String {
        let Some(output) = &self.output else {
            return state.last_content.clone();
        };
        match output.snapshot(&self.spec.name, &ctx.workspace).await {
            Ok(text) => text,
            Err(e) => {
                warn!(workflow = %self.spec.name, error = %e, "Failed to collect final output");
                String::new()
            }
        }
    }
}
