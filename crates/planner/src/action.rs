//! Action registry: named handlers with JSON input schemas, filtered by the
//! stream's declared capabilities.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use fennec_llm::{GenParams, LlmClient, ModelSelector};
use fennec_types::Message;

use crate::{ACTION_EMOJI, ACTION_NO_ACTION, ACTION_NO_REPLY, ACTION_REPLY};

/// Static description of one action, shown to the filter LLM.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    /// Non-reply actions with this set may run concurrently.
    pub is_parallel: bool,
    /// Requires the channel to support sending formatted replies.
    pub needs_reply_capability: bool,
}

/// Snapshot handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub stream_id: String,
    /// Recent history plus unread, oldest first.
    pub messages: Vec<Message>,
    /// The message this cycle is reacting to.
    pub target_message_id: Option<String>,
    pub bot_nickname: String,
    /// Extra prompt material (angry prompt, persona notes).
    pub prompt_additions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub success: bool,
    /// Text to send when the action produces a reply.
    pub reply_text: Option<String>,
    /// Adapter-level command (e.g. send an emoji) for non-text actions.
    pub command: Option<Value>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn spec(&self) -> ActionSpec;

    async fn run(&self, ctx: &ActionContext, args: Value) -> Result<ActionOutcome>;
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard set every stream gets.
    pub fn with_builtins(llm: Arc<dyn LlmClient>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReplyAction::new(llm)));
        registry.register(Arc::new(NoReplyAction));
        registry.register(Arc::new(NoActionAction));
        registry.register(Arc::new(EmojiAction));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        let name = handler.spec().name;
        debug!(name, "action registered");
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Actions available to a stream: capability-gated ones drop out when
    /// the channel cannot use them.
    pub fn available(&self, supports_reply: bool) -> Vec<ActionSpec> {
        let mut specs: Vec<ActionSpec> = self
            .handlers
            .values()
            .map(|h| h.spec())
            .filter(|spec| supports_reply || !spec.needs_reply_capability)
            .collect();
        specs.sort_by_key(|spec| spec.name);
        specs
    }
}

// ── Built-in actions ──────────────────────────────────────────────────────────

/// Generate and send a chat reply.
pub struct ReplyAction {
    llm: Arc<dyn LlmClient>,
}

impl ReplyAction {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_prompt(&self, ctx: &ActionContext) -> String {
        let mut history = String::new();
        for message in ctx.messages.iter().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
            let name = if message.user_nickname.is_empty() {
                &message.user_id
            } else {
                &message.user_nickname
            };
            history.push_str(&format!("{name}: {}\n", message.processed_plain_text));
        }

        let additions = if ctx.prompt_additions.is_empty() {
            String::new()
        } else {
            format!("\n注意：{}\n", ctx.prompt_additions.join("；"))
        };

        format!(
            "你是{bot}，正在参与下面的聊天。请自然地接话，保持你的人格，\
             回复要简短口语化，不要自称AI。{additions}\n\
             最近的聊天记录：\n{history}\n\
             请直接输出你要发送的消息内容。",
            bot = ctx.bot_nickname,
        )
    }
}

#[async_trait]
impl ActionHandler for ReplyAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: ACTION_REPLY,
            description: "回复消息，参与当前对话",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "target_message_id": {"type": "string", "description": "要回复的消息ID"}
                }
            }),
            is_parallel: false,
            needs_reply_capability: true,
        }
    }

    async fn run(&self, ctx: &ActionContext, _args: Value) -> Result<ActionOutcome> {
        let prompt = self.build_prompt(ctx);
        let params = GenParams::for_request("chatter.reply").max_tokens(300);
        let (text, _) = self
            .llm
            .generate(&prompt, ModelSelector::Default, params)
            .await?;

        let text = text.trim().to_string();
        Ok(ActionOutcome {
            success: !text.is_empty(),
            reply_text: (!text.is_empty()).then_some(text),
            command: None,
        })
    }
}

/// Deliberately stay silent while still recording the decision.
pub struct NoReplyAction;

#[async_trait]
impl ActionHandler for NoReplyAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: ACTION_NO_REPLY,
            description: "暂不回复，继续观察对话",
            input_schema: json!({"type": "object", "properties": {}}),
            is_parallel: false,
            needs_reply_capability: false,
        }
    }

    async fn run(&self, _ctx: &ActionContext, _args: Value) -> Result<ActionOutcome> {
        Ok(ActionOutcome {
            success: true,
            ..Default::default()
        })
    }
}

/// Terminal no-op used when a cycle is gated or fails.
pub struct NoActionAction;

#[async_trait]
impl ActionHandler for NoActionAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: ACTION_NO_ACTION,
            description: "本轮不执行任何动作",
            input_schema: json!({"type": "object", "properties": {}}),
            is_parallel: false,
            needs_reply_capability: false,
        }
    }

    async fn run(&self, _ctx: &ActionContext, _args: Value) -> Result<ActionOutcome> {
        Ok(ActionOutcome {
            success: true,
            ..Default::default()
        })
    }
}

/// Send a reaction emoji; resolved by the adapter, so this only emits a
/// command.
pub struct EmojiAction;

#[async_trait]
impl ActionHandler for EmojiAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: ACTION_EMOJI,
            description: "发送一个表情回应当前气氛",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "mood": {"type": "string", "description": "表情想表达的情绪"}
                }
            }),
            is_parallel: true,
            needs_reply_capability: true,
        }
    }

    async fn run(&self, _ctx: &ActionContext, args: Value) -> Result<ActionOutcome> {
        let mood = args
            .get("mood")
            .and_then(|v| v.as_str())
            .unwrap_or("开心")
            .to_string();
        Ok(ActionOutcome {
            success: true,
            reply_text: None,
            command: Some(json!({"type": "send_emoji", "mood": mood})),
        })
    }
}

#[cfg(test)]
mod tests {
    use fennec_llm::testutil::StubLlm;

    use super::*;

    #[test]
    fn capability_filter_drops_reply_actions() {
        let registry = ActionRegistry::with_builtins(Arc::new(StubLlm::new("好呀")));

        let full = registry.available(true);
        assert!(full.iter().any(|s| s.name == ACTION_REPLY));
        assert!(full.iter().any(|s| s.name == ACTION_EMOJI));

        let limited = registry.available(false);
        assert!(!limited.iter().any(|s| s.name == ACTION_REPLY));
        assert!(!limited.iter().any(|s| s.name == ACTION_EMOJI));
        assert!(limited.iter().any(|s| s.name == ACTION_NO_REPLY));
    }

    #[tokio::test]
    async fn reply_action_produces_text() {
        let registry = ActionRegistry::with_builtins(Arc::new(StubLlm::new("今天天气确实不错！")));
        let handler = registry.get(ACTION_REPLY).unwrap();

        let ctx = ActionContext {
            stream_id: "s1".to_string(),
            messages: vec![Message::new("m1", "qq", "u1", "今天天气真好")],
            target_message_id: Some("m1".to_string()),
            bot_nickname: "麦麦".to_string(),
            prompt_additions: Vec::new(),
        };
        let outcome = handler.run(&ctx, json!({})).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.reply_text.as_deref(), Some("今天天气确实不错！"));
    }
}
