use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use common::error::AppError;
use state_machines::{core::GuardError, state_machine};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    blocks::ui_payload,
    bus::{AgentHandler, BusMessage, MessageBus, MessageContext, TOPIC_PLAN, TOPIC_SOLVE, TOPIC_TRACE},
};

state_machine! {
    name: ReflectionMachine,
    state: ReflectionState,
    initial: Planning,
    states: [Planning, Solving, Verifying, Done, Failed],
    events {
        solve { transition: { from: Planning, to: Solving } }
        verify { transition: { from: Solving, to: Verifying } }
        revise { transition: { from: Verifying, to: Solving } }
        accept { transition: { from: Verifying, to: Done } }
        abort {
            transition: { from: Planning, to: Failed }
            transition: { from: Solving, to: Failed }
            transition: { from: Verifying, to: Failed }
        }
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid reflection transition during {event}: {guard:?}"
    ))
}

/// Result of a reflective refinement run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionOutcome {
    pub rounds: usize,
    pub accepted: bool,
    pub decision: String,
    /// UI-safe payload: last FINAL_ANSWER, else last DECISION, else empty.
    pub ui_payload: String,
}

#[derive(Default)]
struct CollectedState {
    latest_plan: String,
    verifier_blocks: Option<BTreeMap<String, String>>,
    all_blocks: Vec<BTreeMap<String, String>>,
}

/// Temporary trace-topic subscriber collecting planner plans and verifier
/// verdicts for the driving sequencer.
struct ReflectionCollector {
    state: Arc<Mutex<CollectedState>>,
    verifier_seen: watch::Sender<u64>,
}

#[async_trait]
impl AgentHandler for ReflectionCollector {
    async fn on_message(&self, message: BusMessage, _ctx: &MessageContext) -> Result<(), AppError> {
        let BusMessage::Trace { agent, blocks } = message else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        state.all_blocks.push(blocks.clone());
        match agent.as_str() {
            "planner" => {
                if let Some(plan) = blocks.get("PLAN") {
                    state.latest_plan.clone_from(plan);
                }
            }
            "verifier" => {
                state.verifier_blocks = Some(blocks);
                drop(state);
                self.verifier_seen.send_modify(|count| *count = count.saturating_add(1));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Drives the Planner -> Solver -> Verifier loop over the bus as a typed
/// state machine, re-invoking the solver with the verifier critique until
/// PASS/ACCEPT, an empty critique, round exhaustion or a round timeout.
pub struct Sequencer {
    bus: Arc<MessageBus>,
    max_rounds: usize,
    round_timeout: Duration,
}

impl Sequencer {
    pub fn new(bus: Arc<MessageBus>, max_rounds: usize, round_timeout: Duration) -> Self {
        Self {
            bus,
            max_rounds: max_rounds.max(1),
            round_timeout,
        }
    }

    /// Single non-reflective pass: dispatch the planner and let the agent
    /// chain run to completion. Returns the correlation id.
    pub async fn run_once(
        &self,
        task: &str,
        req_id: Option<String>,
        session_id: Option<String>,
    ) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        let ctx = MessageContext::new(correlation_id.clone())
            .with_req_id(req_id.clone())
            .with_session_id(session_id);
        self.bus
            .publish(
                TOPIC_PLAN,
                BusMessage::Plan {
                    task: task.to_string(),
                    req_id,
                },
                &ctx,
            )
            .await;
        correlation_id
    }

    pub async fn run_with_reflection(
        &self,
        task: &str,
        req_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<ReflectionOutcome, AppError> {
        let correlation_id = Uuid::new_v4().to_string();
        let collector_type = format!("sequencer_reflect_{correlation_id}");

        let state = Arc::new(Mutex::new(CollectedState::default()));
        let (verifier_tx, verifier_rx) = watch::channel(0_u64);
        self.bus
            .subscribe(
                TOPIC_TRACE,
                &collector_type,
                Arc::new(ReflectionCollector {
                    state: Arc::clone(&state),
                    verifier_seen: verifier_tx,
                }),
            )
            .await;

        let outcome = self
            .reflect(task, req_id, session_id, &correlation_id, &state, verifier_rx)
            .await;

        self.bus.unsubscribe(TOPIC_TRACE, &collector_type).await;
        outcome
    }

    async fn reflect(
        &self,
        task: &str,
        req_id: Option<String>,
        session_id: Option<String>,
        correlation_id: &str,
        state: &Arc<Mutex<CollectedState>>,
        mut verifier_rx: watch::Receiver<u64>,
    ) -> Result<ReflectionOutcome, AppError> {
        let ctx = MessageContext::new(correlation_id.to_string())
            .with_req_id(req_id.clone())
            .with_session_id(session_id);

        let machine = ReflectionMachine::new(());
        let mut seen = *verifier_rx.borrow();

        info!(correlation_id, req_id = ?req_id, "reflection: dispatching planner");
        self.bus
            .publish(
                TOPIC_PLAN,
                BusMessage::Plan {
                    task: task.to_string(),
                    req_id: req_id.clone(),
                },
                &ctx,
            )
            .await;
        let machine = machine
            .solve()
            .map_err(|(_, guard)| map_guard_error("solve", &guard))?;

        if !self.await_verifier(&mut verifier_rx, &mut seen).await {
            warn!(correlation_id, "reflection round 1 timed out without verifier verdict");
            let _failed = machine
                .abort()
                .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
            return Err(AppError::Timeout(self.round_timeout.as_secs()));
        }

        let mut machine = machine;
        let mut rounds = 1_usize;

        loop {
            let verifying = machine
                .verify()
                .map_err(|(_, guard)| map_guard_error("verify", &guard))?;

            let (decision, critique) = {
                let state = state.lock().await;
                let blocks = state.verifier_blocks.clone().unwrap_or_default();
                (
                    blocks.get("DECISION").cloned().unwrap_or_default(),
                    blocks.get("CRITIQUE").cloned().unwrap_or_default(),
                )
            };
            let accepted = decision.to_uppercase().contains("PASS")
                || decision.to_uppercase().contains("ACCEPT");

            if accepted || critique.trim().is_empty() || rounds >= self.max_rounds {
                info!(
                    correlation_id,
                    rounds,
                    accepted,
                    decision = %decision.chars().take(40).collect::<String>(),
                    "reflection finished"
                );
                let _done = verifying
                    .accept()
                    .map_err(|(_, guard)| map_guard_error("accept", &guard))?;

                let state = state.lock().await;
                return Ok(ReflectionOutcome {
                    rounds,
                    accepted,
                    decision,
                    ui_payload: ui_payload(&state.all_blocks),
                });
            }

            info!(correlation_id, round = rounds + 1, "reflection: re-dispatching solver with critique");
            let plan = state.lock().await.latest_plan.clone();
            self.bus
                .publish(
                    TOPIC_SOLVE,
                    BusMessage::Solve {
                        task: task.to_string(),
                        req_id: req_id.clone(),
                        plan,
                        critique: Some(critique),
                    },
                    &ctx,
                )
                .await;
            machine = verifying
                .revise()
                .map_err(|(_, guard)| map_guard_error("revise", &guard))?;

            if !self.await_verifier(&mut verifier_rx, &mut seen).await {
                warn!(correlation_id, round = rounds + 1, "reflection round timed out");
                let state = state.lock().await;
                let _failed = machine
                    .abort()
                    .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
                return Ok(ReflectionOutcome {
                    rounds,
                    accepted: false,
                    decision: String::new(),
                    ui_payload: ui_payload(&state.all_blocks),
                });
            }
            rounds = rounds.saturating_add(1);
        }
    }

    /// Waits until the verifier published a fresh verdict or the round
    /// timeout elapses.
    async fn await_verifier(
        &self,
        verifier_rx: &mut watch::Receiver<u64>,
        seen: &mut u64,
    ) -> bool {
        let wait = async {
            loop {
                let current = *verifier_rx.borrow_and_update();
                if current > *seen {
                    *seen = current;
                    return true;
                }
                if verifier_rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(self.round_timeout, wait)
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TOPIC_VERIFY;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted stand-ins for the whole planner/solver/verifier chain: each
    /// solve round publishes a verifier trace from a script.
    struct ScriptedChain {
        bus: Arc<MessageBus>,
        script: Vec<(String, String)>,
        round: AtomicUsize,
    }

    #[async_trait]
    impl AgentHandler for ScriptedChain {
        async fn on_message(
            &self,
            message: BusMessage,
            ctx: &MessageContext,
        ) -> Result<(), AppError> {
            let round = match message {
                BusMessage::Plan { .. } => 0,
                BusMessage::Solve { .. } => self.round.load(Ordering::SeqCst),
                _ => return Ok(()),
            };
            let (decision, critique) = self
                .script
                .get(round)
                .cloned()
                .unwrap_or(("PASS".to_string(), String::new()));
            self.round.store(round + 1, Ordering::SeqCst);

            let mut solver_blocks = BTreeMap::new();
            solver_blocks.insert(
                "FINAL_ANSWER".to_string(),
                format!("answer after round {}", round + 1),
            );
            self.bus
                .publish(
                    TOPIC_TRACE,
                    BusMessage::Trace {
                        agent: "solver".to_string(),
                        blocks: solver_blocks,
                    },
                    ctx,
                )
                .await;

            let mut verifier_blocks = BTreeMap::new();
            verifier_blocks.insert("DECISION".to_string(), decision);
            verifier_blocks.insert("CRITIQUE".to_string(), critique);
            self.bus
                .publish(
                    TOPIC_TRACE,
                    BusMessage::Trace {
                        agent: "verifier".to_string(),
                        blocks: verifier_blocks,
                    },
                    ctx,
                )
                .await;
            Ok(())
        }
    }

    async fn wire(script: Vec<(String, String)>) -> (Arc<MessageBus>, Sequencer) {
        let bus = Arc::new(MessageBus::new());
        let chain = Arc::new(ScriptedChain {
            bus: Arc::clone(&bus),
            script,
            round: AtomicUsize::new(0),
        });
        bus.subscribe(TOPIC_PLAN, "chain", Arc::clone(&chain) as Arc<dyn AgentHandler>)
            .await;
        bus.subscribe(TOPIC_SOLVE, "chain", Arc::clone(&chain) as Arc<dyn AgentHandler>)
            .await;
        bus.subscribe(TOPIC_VERIFY, "chain", chain as Arc<dyn AgentHandler>)
            .await;
        let sequencer = Sequencer::new(Arc::clone(&bus), 3, Duration::from_secs(2));
        (bus, sequencer)
    }

    #[tokio::test]
    async fn test_reflection_stops_on_pass() {
        let (_bus, sequencer) = wire(vec![("PASS - looks good".to_string(), String::new())]).await;
        let outcome = sequencer
            .run_with_reflection("refine REQ-001", Some("REQ-001".to_string()), None)
            .await
            .expect("reflection");

        assert!(outcome.accepted);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.ui_payload, "answer after round 1");
    }

    #[tokio::test]
    async fn test_reflection_loops_on_critique_then_passes() {
        let (_bus, sequencer) = wire(vec![
            ("REJECT".to_string(), "missing metrics".to_string()),
            ("PASS".to_string(), String::new()),
        ])
        .await;
        let outcome = sequencer
            .run_with_reflection("refine REQ-002", Some("REQ-002".to_string()), None)
            .await
            .expect("reflection");

        assert!(outcome.accepted);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.ui_payload, "answer after round 2");
    }

    #[tokio::test]
    async fn test_reflection_exhausts_rounds() {
        let (_bus, sequencer) = wire(vec![
            ("REJECT".to_string(), "still vague".to_string()),
            ("REJECT".to_string(), "still vague".to_string()),
            ("REJECT".to_string(), "still vague".to_string()),
        ])
        .await;
        let outcome = sequencer
            .run_with_reflection("refine REQ-003", Some("REQ-003".to_string()), None)
            .await
            .expect("reflection");

        assert!(!outcome.accepted);
        assert_eq!(outcome.rounds, 3);
    }

    #[tokio::test]
    async fn test_reflection_times_out_without_verifier() {
        let bus = Arc::new(MessageBus::new());
        let sequencer = Sequencer::new(Arc::clone(&bus), 3, Duration::from_millis(50));
        let result = sequencer.run_with_reflection("task", None, None).await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }
}
