//! Plan generation: interest gate plus the LLM action filter.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use fennec_affinity::{InterestScore, InterestScorer, ReplyDecision};
use fennec_config::AffinityConfig;
use fennec_llm::{GenParams, LlmClient, ModelSelector, extract_json_payload};
use fennec_types::Message;

use crate::action::{ActionRegistry, ActionSpec};
use crate::{ACTION_NO_ACTION, ACTION_REPLY, PlanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Focus,
    Normal,
    Proactive,
}

/// Everything the planner needs about one stream for one cycle.
#[derive(Debug, Clone)]
pub struct PlannerInput {
    pub stream_id: String,
    pub mode: PlanMode,
    pub unread: Vec<Message>,
    pub bot_nickname: String,
    pub bot_aliases: Vec<String>,
    /// Whether the channel can carry formatted replies.
    pub supports_reply: bool,
    /// Actions already executed this conversation turn; the filter must not
    /// repeat them.
    pub executed_actions: Vec<String>,
}

/// One decision out of the filter.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action_type: String,
    pub action_data: Value,
    pub reasoning: String,
    /// The message this action responds to, when applicable.
    pub action_message: Option<String>,
}

impl PlannedAction {
    pub fn no_action(reasoning: impl Into<String>) -> Self {
        Self {
            action_type: ACTION_NO_ACTION.to_string(),
            action_data: Value::Null,
            reasoning: reasoning.into(),
            action_message: None,
        }
    }
}

#[derive(Debug)]
pub struct PlanResult {
    pub decisions: Vec<PlannedAction>,
    /// Interest scores computed for the gate, keyed by message id.
    pub scores: HashMap<String, InterestScore>,
    /// Reply decision for the highest-interest message, when the gate passed.
    pub reply_decision: Option<ReplyDecision>,
}

impl PlanResult {
    fn short_circuit(reasoning: &str, scores: HashMap<String, InterestScore>) -> Self {
        Self {
            decisions: vec![PlannedAction::no_action(reasoning)],
            scores,
            reply_decision: None,
        }
    }

    pub fn is_no_action(&self) -> bool {
        self.decisions.len() == 1 && self.decisions[0].action_type == ACTION_NO_ACTION
    }
}

pub struct Planner {
    config: AffinityConfig,
    llm: Arc<dyn LlmClient>,
    scorer: Arc<InterestScorer>,
    registry: Arc<ActionRegistry>,
}

impl Planner {
    pub fn new(
        config: AffinityConfig,
        llm: Arc<dyn LlmClient>,
        scorer: Arc<InterestScorer>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            config,
            llm,
            scorer,
            registry,
        }
    }

    pub fn scorer(&self) -> &Arc<InterestScorer> {
        &self.scorer
    }

    /// Generate and filter. Execution is the executor's job so the caller
    /// can hold the stream lock only where it must.
    pub async fn plan(&self, input: &PlannerInput) -> Result<PlanResult, PlanError> {
        // Generate: what could we do at all.
        let available = self.registry.available(input.supports_reply);
        if input.unread.is_empty() {
            return Ok(PlanResult::short_circuit("no unread messages", HashMap::new()));
        }

        // Gate: best interest across unread must clear the action threshold.
        let mut scores = HashMap::new();
        for message in &input.unread {
            let score = self
                .scorer
                .score_message(message, &input.bot_nickname, &input.bot_aliases)
                .await;
            scores.insert(message.message_id.clone(), score);
        }

        let best = scores
            .values()
            .max_by(|a, b| a.total_score.total_cmp(&b.total_score))
            .cloned()
            .expect("unread is non-empty");

        if best.total_score < self.config.non_reply_action_interest_threshold {
            info!(
                stream_id = %input.stream_id,
                best = best.total_score,
                threshold = self.config.non_reply_action_interest_threshold,
                "interest gate closed"
            );
            return Ok(PlanResult::short_circuit("interest below action threshold", scores));
        }

        let reply_decision = self.scorer.decide_reply(&input.stream_id, &best);

        // Reply is only offered to the filter when the channel supports it
        // and the decision came out positive.
        let offered: Vec<&ActionSpec> = available
            .iter()
            .filter(|spec| spec.name != ACTION_REPLY || reply_decision.should_reply)
            .collect();

        let decisions = self
            .filter_actions(input, &offered, &best)
            .await?
            .into_iter()
            .filter(|decision| {
                let known = offered.iter().any(|spec| spec.name == decision.action_type);
                if !known {
                    warn!(action = %decision.action_type, "filter chose unavailable action, dropping");
                }
                known
            })
            .collect::<Vec<_>>();

        let decisions = if decisions.is_empty() {
            vec![PlannedAction::no_action("filter selected nothing")]
        } else {
            decisions
        };

        Ok(PlanResult {
            decisions,
            scores,
            reply_decision: Some(reply_decision),
        })
    }

    async fn filter_actions(
        &self,
        input: &PlannerInput,
        offered: &[&ActionSpec],
        best: &InterestScore,
    ) -> Result<Vec<PlannedAction>, PlanError> {
        let action_list = offered
            .iter()
            .map(|spec| format!("- {}: {}", spec.name, spec.description))
            .collect::<Vec<_>>()
            .join("\n");

        let recent = input
            .unread
            .iter()
            .rev()
            .take(8)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|m| {
                let name = if m.user_nickname.is_empty() { &m.user_id } else { &m.user_nickname };
                format!("[{}] {name}: {}", m.message_id, m.processed_plain_text)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let executed = if input.executed_actions.is_empty() {
            "无".to_string()
        } else {
            input.executed_actions.join(", ")
        };

        let prompt = format!(
            "你是{bot}的行动决策模块。根据下面的未读消息选择要执行的动作（可以是0个或多个）。\n\n\
             可用动作：\n{action_list}\n\n\
             未读消息（共{count}条）：\n{recent}\n\n\
             本轮已执行过、不要重复的动作：{executed}\n\
             当前最高兴趣度：{interest:.3}\n\n\
             请以JSON数组输出决策：\n\
             [{{\"action_type\": \"动作名\", \"action_data\": {{}}, \"reasoning\": \"原因\", \"action_message\": \"目标消息ID\"}}]\n\
             没有值得执行的动作时输出 []。",
            bot = input.bot_nickname,
            count = input.unread.len(),
            interest = best.total_score,
        );

        let params = GenParams::for_request("planner.filter")
            .temperature(0.4)
            .max_tokens(500);
        let (response, _) = self
            .llm
            .generate(&prompt, ModelSelector::Utils, params)
            .await
            .map_err(|err| PlanError::Filter(err.to_string()))?;

        parse_filter_reply(&response, &best.message_id)
            .ok_or_else(|| PlanError::Filter(format!("unparseable filter reply: {response}")))
    }
}

fn parse_filter_reply(response: &str, default_target: &str) -> Option<Vec<PlannedAction>> {
    #[derive(Deserialize)]
    struct RawDecision {
        action_type: String,
        #[serde(default)]
        action_data: Value,
        #[serde(default)]
        reasoning: String,
        #[serde(default)]
        action_message: Option<String>,
    }

    let payload = extract_json_payload(response)?;
    let raw: Vec<RawDecision> = serde_json::from_str(payload).ok()?;

    let decisions = raw
        .into_iter()
        .map(|d| PlannedAction {
            action_type: d.action_type,
            action_data: d.action_data,
            reasoning: d.reasoning,
            action_message: d
                .action_message
                .or_else(|| Some(default_target.to_string())),
        })
        .collect::<Vec<_>>();
    debug!(count = decisions.len(), "filter decisions parsed");
    Some(decisions)
}

#[cfg(test)]
mod tests {
    use fennec_affinity::RelationshipStore;
    use fennec_llm::testutil::{FailingLlm, StubLlm};
    use fennec_store::KvStore;

    use super::*;
    use crate::action::ActionRegistry;

    fn planner_with(llm: Arc<dyn LlmClient>, config: AffinityConfig) -> (tempfile::TempDir, Planner) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        let relationships = RelationshipStore::new(kv, config.base_relationship_score);
        let scorer = Arc::new(InterestScorer::new(config.clone(), relationships));
        let registry = Arc::new(ActionRegistry::with_builtins(Arc::clone(&llm)));
        (dir, Planner::new(config, llm, scorer, registry))
    }

    fn input(messages: Vec<Message>) -> PlannerInput {
        PlannerInput {
            stream_id: "s1".to_string(),
            mode: PlanMode::Normal,
            unread: messages,
            bot_nickname: "麦麦".to_string(),
            bot_aliases: Vec::new(),
            supports_reply: true,
            executed_actions: Vec::new(),
        }
    }

    fn mentioned_message() -> Message {
        Message::new("m1", "qq", "u1", "你好麦麦，今天天气真好")
            .in_group("g1")
            .mentioned()
    }

    #[tokio::test]
    async fn gate_closes_on_low_interest() {
        let config = AffinityConfig {
            non_reply_action_interest_threshold: 0.9,
            ..Default::default()
        };
        let llm: Arc<dyn LlmClient> = Arc::new(StubLlm::new("[]"));
        let (_dir, planner) = planner_with(llm, config);

        let plain = Message::new("m1", "qq", "u1", "随便说说").in_group("g1");
        let result = planner.plan(&input(vec![plain])).await.unwrap();
        assert!(result.is_no_action());
        assert!(result.reply_decision.is_none());
    }

    #[tokio::test]
    async fn mentioned_message_plans_a_reply() {
        let stub = Arc::new(StubLlm::new(
            r#"[{"action_type": "reply", "action_data": {}, "reasoning": "被直接问候", "action_message": "m1"}]"#,
        ));
        let llm: Arc<dyn LlmClient> = stub;
        let (_dir, planner) = planner_with(llm, AffinityConfig::default());

        let result = planner.plan(&input(vec![mentioned_message()])).await.unwrap();
        assert_eq!(result.decisions.len(), 1);
        assert_eq!(result.decisions[0].action_type, ACTION_REPLY);
        assert_eq!(result.decisions[0].action_message.as_deref(), Some("m1"));
        assert!(result.reply_decision.unwrap().should_reply);
        assert!(result.scores.contains_key("m1"));
    }

    #[tokio::test]
    async fn unknown_actions_from_filter_are_dropped() {
        let stub = Arc::new(StubLlm::new(
            r#"[{"action_type": "fire_missiles", "action_data": {}, "reasoning": "!"}]"#,
        ));
        let llm: Arc<dyn LlmClient> = stub;
        let (_dir, planner) = planner_with(llm, AffinityConfig::default());

        let result = planner.plan(&input(vec![mentioned_message()])).await.unwrap();
        assert!(result.is_no_action());
    }

    #[tokio::test]
    async fn filter_failure_propagates_as_error() {
        let llm: Arc<dyn LlmClient> = Arc::new(FailingLlm);
        let (_dir, planner) = planner_with(llm, AffinityConfig::default());

        let result = planner.plan(&input(vec![mentioned_message()])).await;
        assert!(matches!(result, Err(PlanError::Filter(_))));
    }

    #[tokio::test]
    async fn reply_not_offered_without_capability() {
        let stub = Arc::new(StubLlm::new(
            r#"[{"action_type": "reply", "action_data": {}, "reasoning": "想回复"}]"#,
        ));
        let llm: Arc<dyn LlmClient> = stub;
        let (_dir, planner) = planner_with(llm, AffinityConfig::default());

        let mut no_reply_input = input(vec![mentioned_message()]);
        no_reply_input.supports_reply = false;

        // The filter picked reply anyway; it is unavailable, so the plan
        // collapses to no_action.
        let result = planner.plan(&no_reply_input).await.unwrap();
        assert!(result.is_no_action());
    }
}
