//! Autonomous continuation agent
//!
//! After each worker turn the agent decides whether to keep the worker going on its
//! own, hand the conversation back to the human, or escalate. Per session it runs a
//! small state machine:
//!
//! ```text
//! Active ──continue──▶ Active
//! Active ──iteration cap──▶ Paused ──resume()──▶ Active
//! Active ──showstopper──▶ Escalated ──reset()──▶ Active
//! ```
//!
//! Evaluation order for `analyze`: disabled, escalated, paused, iteration cap,
//! showstoppers, heuristics, optional model, confidence threshold. The model is only
//! consulted when the heuristics are unsure and can never override a showstopper.

pub mod analyzer;
pub mod repetition;

use crate::config::AgentConfig;
use crate::core_types::SessionId;
use crate::errors::RelayError;
use analyzer::Heuristics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use repetition::{RepetitionConfig, RepetitionDetector, RepetitionPattern};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Active,
    Paused,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    AskingPermission,
    ReportingDone,
    StuckInLoop,
    CriticalError,
    InProgress,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Enqueue `follow_up` as an agent prompt.
    Continue,
    ForwardToHuman,
    PausedForReview,
    Escalate,
    /// Escalated earlier; nothing happens until a reset.
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Disabled,
    State,
    IterationCap,
    Showstopper,
    Heuristic,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub should_continue: bool,
    pub action: DecisionAction,
    pub intent: Intent,
    pub confidence: f64,
    pub follow_up: Option<String>,
    pub reason: String,
    pub source: DecisionSource,
}

impl Decision {
    fn stop(action: DecisionAction, source: DecisionSource, reason: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            action,
            intent: Intent::Unknown,
            confidence: 1.0,
            follow_up: None,
            reason: reason.into(),
            source,
        }
    }

    /// One-line annotation for the result notification.
    pub fn summary(&self) -> String {
        match self.action {
            DecisionAction::Continue => "Continuing automatically".to_string(),
            DecisionAction::ForwardToHuman => "Waiting for your reply".to_string(),
            DecisionAction::PausedForReview => "Paused for review".to_string(),
            DecisionAction::Escalate => format!("Needs your attention: {}", self.reason),
            DecisionAction::Suppressed => "Auto-continue is off until reset".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Verdict from an optional learned classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelVerdict {
    pub intent: Intent,
    pub confidence: f64,
    pub follow_up: Option<String>,
}

#[async_trait]
pub trait DecisionModel: Send + Sync {
    async fn classify(
        &self,
        output: &str,
        context: &AgentContext,
        history: &[String],
    ) -> Result<ModelVerdict, RelayError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub session_id: SessionId,
    pub output_excerpt: String,
    pub iteration: u32,
    pub decision: Decision,
    pub recorded_at: DateTime<Utc>,
}

/// Best-effort sink for decision data. Failures are logged and otherwise ignored.
#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn record(&self, record: &DecisionRecord) -> Result<(), RelayError>;
}

#[derive(Debug)]
struct AgentSession {
    iteration_count: u32,
    message_history: VecDeque<String>,
    state: AgentState,
    context: AgentContext,
    repetition: RepetitionDetector,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub iteration_count: u32,
    pub state: AgentState,
    pub history_len: usize,
    pub context: AgentContext,
}

pub struct ContinuationAgent {
    config: AgentConfig,
    heuristics: Heuristics,
    sessions: DashMap<SessionId, AgentSession>,
    model: Option<Arc<dyn DecisionModel>>,
    sink: Option<Arc<dyn LearningSink>>,
}

enum Precheck {
    Decided(Decision),
    Classified {
        intent: Intent,
        confidence: f64,
        context: AgentContext,
        history: Vec<String>,
        iteration: u32,
    },
}

impl ContinuationAgent {
    pub fn new(config: AgentConfig) -> Result<Self, RelayError> {
        let heuristics = Heuristics::new(&config.destructive_patterns)?;
        Ok(Self {
            config,
            heuristics,
            sessions: DashMap::new(),
            model: None,
            sink: None,
        })
    }

    pub fn with_model(mut self, model: Arc<dyn DecisionModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_learning_sink(mut self, sink: Arc<dyn LearningSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn new_session(&self) -> AgentSession {
        AgentSession {
            iteration_count: 0,
            message_history: VecDeque::new(),
            state: AgentState::Active,
            context: AgentContext {
                rules: self.config.rules.clone(),
                ..AgentContext::default()
            },
            repetition: RepetitionDetector::new(RepetitionConfig {
                window_size: self.config.history_window,
                failure_threshold: self.config.repeated_failure_threshold,
                ..RepetitionConfig::default()
            }),
        }
    }

    /// Decide what happens after a turn that produced `output`. `failed` marks turns
    /// the worker itself reported as failed.
    pub async fn analyze(&self, session_id: &str, output: &str, failed: bool) -> Decision {
        if !self.config.enabled {
            return Decision::stop(
                DecisionAction::ForwardToHuman,
                DecisionSource::Disabled,
                "autonomous continuation is disabled",
            );
        }

        let decision = match self.precheck(session_id, output, failed) {
            Precheck::Decided(decision) => decision,
            Precheck::Classified {
                intent,
                confidence,
                context,
                history,
                iteration,
            } => {
                let (intent, confidence, follow_up, source) = self
                    .consult_model(session_id, output, intent, confidence, &context, &history)
                    .await;
                let decision = self.decide(intent, confidence, follow_up, source);
                self.commit(session_id, &decision, iteration)
            }
        };

        log::info!(
            "Agent decision for session '{}': {:?} ({:?}, confidence {:.2}, {})",
            session_id,
            decision.action,
            decision.intent,
            decision.confidence,
            decision.reason
        );
        self.record(session_id, output, &decision).await;
        decision
    }

    /// Everything that can be decided without awaiting, under the session's entry lock.
    fn precheck(&self, session_id: &str, output: &str, failed: bool) -> Precheck {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.new_session());
        let session = entry.value_mut();

        session.message_history.push_back(output.to_string());
        while session.message_history.len() > self.config.history_window {
            session.message_history.pop_front();
        }
        let repetition = session.repetition.record(output, failed);

        match session.state {
            AgentState::Escalated => {
                return Precheck::Decided(Decision::stop(
                    DecisionAction::Suppressed,
                    DecisionSource::State,
                    "session was escalated to a human",
                ))
            }
            AgentState::Paused => {
                return Precheck::Decided(Decision::stop(
                    DecisionAction::ForwardToHuman,
                    DecisionSource::State,
                    "auto-continue is paused",
                ))
            }
            AgentState::Active => {}
        }

        if session.iteration_count >= self.config.max_iterations {
            session.state = AgentState::Paused;
            return Precheck::Decided(Decision::stop(
                DecisionAction::PausedForReview,
                DecisionSource::IterationCap,
                format!(
                    "reached {} automatic continuations",
                    self.config.max_iterations
                ),
            ));
        }

        let showstopper = match (&repetition, self.heuristics.destructive_confirmation(output)) {
            (_, Some(action)) => Some((
                Intent::AskingPermission,
                format!("destructive action needs confirmation: {}", action),
            )),
            (RepetitionPattern::RepeatedFailure { count }, None) => Some((
                Intent::CriticalError,
                format!("the same failure repeated {} times", count),
            )),
            _ => None,
        };
        if let Some((intent, reason)) = showstopper {
            session.state = AgentState::Escalated;
            let mut decision =
                Decision::stop(DecisionAction::Escalate, DecisionSource::Showstopper, reason);
            decision.intent = intent;
            return Precheck::Decided(decision);
        }

        let (mut intent, mut confidence) = self.heuristics.classify(output);
        if repetition.is_loop() && intent != Intent::CriticalError {
            intent = Intent::StuckInLoop;
            confidence = confidence.max(0.8);
        }

        Precheck::Classified {
            intent,
            confidence,
            context: session.context.clone(),
            history: session.message_history.iter().cloned().collect(),
            iteration: session.iteration_count,
        }
    }

    async fn consult_model(
        &self,
        session_id: &str,
        output: &str,
        intent: Intent,
        confidence: f64,
        context: &AgentContext,
        history: &[String],
    ) -> (Intent, f64, Option<String>, DecisionSource) {
        let model = match &self.model {
            Some(model) if confidence < self.config.confidence_threshold => model,
            _ => return (intent, confidence, None, DecisionSource::Heuristic),
        };

        match model.classify(output, context, history).await {
            Ok(verdict) if verdict.confidence > confidence => (
                verdict.intent,
                verdict.confidence.clamp(0.0, 1.0),
                verdict.follow_up,
                DecisionSource::Model,
            ),
            Ok(_) => (intent, confidence, None, DecisionSource::Heuristic),
            Err(e) => {
                log::warn!("Decision model failed for session '{}': {}", session_id, e);
                (intent, confidence, None, DecisionSource::Heuristic)
            }
        }
    }

    fn decide(
        &self,
        intent: Intent,
        confidence: f64,
        follow_up: Option<String>,
        source: DecisionSource,
    ) -> Decision {
        let mut decision = Decision {
            should_continue: false,
            action: DecisionAction::ForwardToHuman,
            intent,
            confidence,
            follow_up: None,
            reason: String::new(),
            source,
        };

        if confidence < self.config.confidence_threshold {
            decision.reason = format!(
                "confidence {:.2} below threshold {:.2}",
                confidence, self.config.confidence_threshold
            );
            return decision;
        }

        let prompt = match intent {
            Intent::InProgress => Some(self.config.continue_prompt.clone()),
            Intent::AskingPermission => Some(self.config.approve_prompt.clone()),
            Intent::ReportingDone => {
                decision.reason = "the worker reports the task is done".to_string();
                None
            }
            Intent::StuckInLoop => {
                decision.reason = "the worker appears to be going in circles".to_string();
                None
            }
            Intent::CriticalError => {
                decision.reason = "the worker hit an error it cannot recover from".to_string();
                None
            }
            Intent::Unknown => {
                decision.reason = "no clear next step".to_string();
                None
            }
        };

        if let Some(prompt) = prompt {
            decision.should_continue = true;
            decision.action = DecisionAction::Continue;
            decision.follow_up = Some(follow_up.unwrap_or(prompt));
            decision.reason = format!("{:?}", intent);
        }
        decision
    }

    /// Apply a continue decision to the session. If the session changed state while
    /// the model was consulted, the state wins.
    fn commit(&self, session_id: &str, decision: &Decision, seen_iteration: u32) -> Decision {
        if !decision.should_continue {
            return decision.clone();
        }
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return Decision::stop(
                DecisionAction::ForwardToHuman,
                DecisionSource::State,
                "agent session was reset",
            );
        };
        if session.state != AgentState::Active || session.iteration_count != seen_iteration {
            return Decision::stop(
                DecisionAction::ForwardToHuman,
                DecisionSource::State,
                "agent session changed during analysis",
            );
        }
        session.iteration_count += 1;
        decision.clone()
    }

    async fn record(&self, session_id: &str, output: &str, decision: &Decision) {
        let Some(sink) = &self.sink else {
            return;
        };
        let record = DecisionRecord {
            session_id: session_id.to_string(),
            output_excerpt: output.chars().take(2000).collect(),
            iteration: self
                .sessions
                .get(session_id)
                .map(|s| s.iteration_count)
                .unwrap_or(0),
            decision: decision.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = sink.record(&record).await {
            log::warn!("Learning sink rejected decision record: {}", e);
        }
    }

    /// A human took a turn: the iteration budget starts over.
    pub fn note_human_prompt(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if session.state == AgentState::Active {
                session.iteration_count = 0;
            }
        }
    }

    /// Leave `Paused` with a clean repetition window. Escalated sessions need `reset`.
    pub fn resume(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) if session.state == AgentState::Paused => {
                session.state = AgentState::Active;
                session.iteration_count = 0;
                session.repetition.reset();
                true
            }
            _ => false,
        }
    }

    /// Back to a fresh `Active` state, keeping the context.
    pub fn reset(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            let context = std::mem::take(&mut session.context);
            *session = self.new_session();
            session.context = context;
        }
    }

    pub fn set_context(&self, session_id: &str, context: AgentContext) {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.new_session());
        entry.context = context;
    }

    pub fn snapshot(&self, session_id: &str) -> Option<AgentSnapshot> {
        self.sessions.get(session_id).map(|s| AgentSnapshot {
            iteration_count: s.iteration_count,
            state: s.state,
            history_len: s.message_history.len(),
            context: s.context.clone(),
        })
    }

    /// Forget a session entirely, e.g. when it terminates.
    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}
