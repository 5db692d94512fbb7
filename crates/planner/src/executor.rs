//! Ordered execution of planned actions.
//!
//! Reply actions run inline (the caller holds the stream's write lock);
//! parallel-capable non-reply actions are grouped and joined concurrently.
//! Any handler failure aborts the cycle with an error so the caller can
//! downgrade to `no_action`.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info};

use crate::action::{ActionContext, ActionOutcome, ActionRegistry};
use crate::plan::PlannedAction;
use crate::{ACTION_REPLY, PlanError};

/// Plugin hook sink (AFTER_SEND and friends). The event bus lives outside
/// the core.
pub trait EventSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: serde_json::Value);
}

/// A decision together with what actually happened when it ran.
#[derive(Debug, Clone)]
pub struct ExecutedAction {
    pub action: PlannedAction,
    pub outcome: ActionOutcome,
}

pub struct Executor {
    registry: Arc<ActionRegistry>,
    events: Option<Arc<dyn EventSink>>,
}

impl Executor {
    pub fn new(registry: Arc<ActionRegistry>, events: Option<Arc<dyn EventSink>>) -> Self {
        Self { registry, events }
    }

    /// Run `decisions` in order. Returns every outcome so the caller can
    /// send replies, update message action lists, and persist records.
    pub async fn execute(
        &self,
        ctx: &ActionContext,
        decisions: &[PlannedAction],
    ) -> Result<Vec<ExecutedAction>, PlanError> {
        let mut executed = Vec::with_capacity(decisions.len());
        let mut parallel_batch: Vec<&PlannedAction> = Vec::new();

        for decision in decisions {
            let handler = self
                .registry
                .get(&decision.action_type)
                .ok_or_else(|| PlanError::UnknownAction(decision.action_type.clone()))?;

            let spec = handler.spec();
            if spec.is_parallel && spec.name != ACTION_REPLY {
                parallel_batch.push(decision);
                continue;
            }

            // Flush any pending parallel batch before an ordered action so
            // overall ordering stays comprehensible.
            executed.extend(self.run_parallel(ctx, &mut parallel_batch).await?);

            debug!(action = %decision.action_type, "executing action");
            let outcome = handler
                .run(ctx, decision.action_data.clone())
                .await
                .map_err(|source| PlanError::Execution {
                    name: decision.action_type.clone(),
                    source,
                })?;
            self.after_action(decision, &outcome);
            executed.push(ExecutedAction {
                action: decision.clone(),
                outcome,
            });
        }

        executed.extend(self.run_parallel(ctx, &mut parallel_batch).await?);
        info!(count = executed.len(), stream_id = %ctx.stream_id, "actions executed");
        Ok(executed)
    }

    async fn run_parallel(
        &self,
        ctx: &ActionContext,
        batch: &mut Vec<&PlannedAction>,
    ) -> Result<Vec<ExecutedAction>, PlanError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let decisions = std::mem::take(batch);

        let futures = decisions.iter().map(|decision| {
            let handler = self.registry.get(&decision.action_type);
            async move {
                match handler {
                    Some(handler) => handler
                        .run(ctx, decision.action_data.clone())
                        .await
                        .map_err(|source| PlanError::Execution {
                            name: decision.action_type.clone(),
                            source,
                        }),
                    None => Err(PlanError::UnknownAction(decision.action_type.clone())),
                }
            }
        });

        let outcomes = join_all(futures).await;
        let mut executed = Vec::with_capacity(decisions.len());
        for (decision, outcome) in decisions.into_iter().zip(outcomes) {
            let outcome = outcome?;
            self.after_action(decision, &outcome);
            executed.push(ExecutedAction {
                action: decision.clone(),
                outcome,
            });
        }
        Ok(executed)
    }

    fn after_action(&self, decision: &PlannedAction, outcome: &ActionOutcome) {
        if let Some(events) = &self.events {
            events.emit(
                "AFTER_SEND",
                json!({
                    "action_type": decision.action_type,
                    "success": outcome.success,
                    "has_reply": outcome.reply_text.is_some(),
                    "target_message": decision.action_message,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fennec_llm::testutil::StubLlm;
    use fennec_types::Message;
    use serde_json::Value;

    use super::*;
    use crate::{ACTION_EMOJI, ACTION_NO_REPLY};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event_type: &str, payload: Value) {
            self.events
                .lock()
                .unwrap()
                .push((event_type.to_string(), payload));
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            stream_id: "s1".to_string(),
            messages: vec![Message::new("m1", "qq", "u1", "你好")],
            target_message_id: Some("m1".to_string()),
            bot_nickname: "麦麦".to_string(),
            prompt_additions: Vec::new(),
        }
    }

    fn decision(action_type: &str) -> PlannedAction {
        PlannedAction {
            action_type: action_type.to_string(),
            action_data: json!({}),
            reasoning: String::new(),
            action_message: Some("m1".to_string()),
        }
    }

    #[tokio::test]
    async fn executes_in_order_and_emits_events() {
        let registry = Arc::new(ActionRegistry::with_builtins(Arc::new(StubLlm::new("嗨！"))));
        let sink = Arc::new(RecordingSink::default());
        let executor = Executor::new(registry, Some(sink.clone()));

        let decisions = vec![decision(ACTION_REPLY), decision(ACTION_EMOJI)];
        let executed = executor.execute(&ctx(), &decisions).await.unwrap();

        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].action.action_type, ACTION_REPLY);
        assert_eq!(executed[0].outcome.reply_text.as_deref(), Some("嗨！"));
        assert!(executed[1].outcome.command.is_some());

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(t, _)| t == "AFTER_SEND"));
    }

    #[tokio::test]
    async fn unknown_action_fails_the_cycle() {
        let registry = Arc::new(ActionRegistry::with_builtins(Arc::new(StubLlm::new(""))));
        let executor = Executor::new(registry, None);

        let result = executor.execute(&ctx(), &[decision("teleport")]).await;
        assert!(matches!(result, Err(PlanError::UnknownAction(_))));
    }

    #[tokio::test]
    async fn no_reply_is_a_clean_noop() {
        let registry = Arc::new(ActionRegistry::with_builtins(Arc::new(StubLlm::new(""))));
        let executor = Executor::new(registry, None);

        let executed = executor.execute(&ctx(), &[decision(ACTION_NO_REPLY)]).await.unwrap();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].outcome.success);
        assert!(executed[0].outcome.reply_text.is_none());
    }
}
