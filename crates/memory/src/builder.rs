//! Memory extraction: turn a conversation excerpt into candidate chunks.
//!
//! Strategy is picked per input: short or command/system text goes through
//! cheap rules, structured payloads get the hybrid path, everything else is
//! handed to the LLM with a fixed JSON schema.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use fennec_config::MemoryConfig;
use fennec_llm::{GenParams, LlmClient, ModelSelector, extract_json_payload};

use crate::chunk::{Confidence, Importance, MemoryChunk, MemoryType};

/// Inputs below this many chars never warrant an LLM call.
const RULE_ONLY_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    RuleBased,
    LlmBased,
    Hybrid,
}

/// Normalized build context handed down from the engine.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub user_id: String,
    pub chat_id: Option<String>,
    pub stream_id: Option<String>,
    pub message_type: Option<String>,
    pub structured_data: Option<serde_json::Value>,
    pub keywords: Vec<String>,
    /// Formatted recent history supplied by the stream layer; when present
    /// it replaces the raw excerpt for extraction.
    pub history_text: Option<String>,
}

pub struct MemoryBuilder {
    config: MemoryConfig,
    llm: Arc<dyn LlmClient>,
}

impl MemoryBuilder {
    pub fn new(config: MemoryConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self { config, llm }
    }

    pub fn determine_strategy(&self, text: &str, context: &BuildContext) -> ExtractionStrategy {
        if text.chars().count() < RULE_ONLY_MAX_CHARS {
            return ExtractionStrategy::RuleBased;
        }
        if matches!(
            context.message_type.as_deref(),
            Some("command") | Some("system")
        ) {
            return ExtractionStrategy::RuleBased;
        }
        if context.structured_data.is_some() {
            return ExtractionStrategy::Hybrid;
        }
        ExtractionStrategy::LlmBased
    }

    pub async fn build_memories(
        &self,
        text: &str,
        context: &BuildContext,
        timestamp: DateTime<Utc>,
    ) -> Vec<MemoryChunk> {
        let strategy = self.determine_strategy(text, context);
        debug!(?strategy, chars = text.chars().count(), "extraction strategy");

        let mut chunks = match strategy {
            ExtractionStrategy::RuleBased => self.extract_with_rules(text, context, timestamp),
            ExtractionStrategy::LlmBased => {
                self.extract_with_llm(text, context, timestamp).await
            }
            ExtractionStrategy::Hybrid => {
                let rule_chunks = self.extract_with_rules(text, context, timestamp);
                let llm_chunks = self.extract_with_llm(text, context, timestamp).await;
                merge_hybrid(rule_chunks, llm_chunks)
            }
        };

        for chunk in &mut chunks {
            normalize_relative_dates(chunk, timestamp);
            auto_tag(chunk);
            if chunk.source_context.is_none() {
                chunk.source_context = Some(text.chars().take(200).collect());
            }
        }

        chunks.retain(|chunk| {
            let keep = chunk.is_valid(self.config.min_memory_length, self.config.max_memory_length);
            if !keep {
                debug!(memory_id = %chunk.memory_id, "dropping invalid chunk");
            }
            keep
        });
        chunks
    }

    async fn extract_with_llm(
        &self,
        text: &str,
        context: &BuildContext,
        timestamp: DateTime<Utc>,
    ) -> Vec<MemoryChunk> {
        let prompt = build_extraction_prompt(text, timestamp);
        let params = GenParams::for_request("memory.extract")
            .temperature(0.3)
            .max_tokens(1200);

        let response = match self.llm.generate(&prompt, ModelSelector::Utils, params).await {
            Ok((response, _)) => response,
            Err(err) => {
                warn!(%err, "llm extraction failed, no memories");
                return Vec::new();
            }
        };

        let Some(payload) = extract_json_payload(&response) else {
            warn!("llm extraction reply had no JSON payload");
            return Vec::new();
        };

        #[derive(Deserialize)]
        struct RawMemory {
            #[serde(rename = "type")]
            memory_type: Option<String>,
            subject: Option<String>,
            predicate: Option<String>,
            object: Option<serde_json::Value>,
            #[serde(default)]
            keywords: Vec<String>,
            importance: Option<serde_json::Value>,
            confidence: Option<serde_json::Value>,
        }

        #[derive(Deserialize)]
        struct RawReply {
            #[serde(default)]
            memories: Vec<RawMemory>,
        }

        let parsed: RawReply = match serde_json::from_str(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "llm extraction JSON did not match schema");
                return Vec::new();
            }
        };

        parsed
            .memories
            .into_iter()
            .filter_map(|raw| {
                let memory_type = raw
                    .memory_type
                    .as_deref()
                    .and_then(MemoryType::parse)
                    .unwrap_or(MemoryType::Contextual);
                let subject = raw.subject.unwrap_or_else(|| context.user_id.clone());
                let predicate = raw.predicate?;
                let object = match raw.object? {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };

                Some(
                    MemoryChunk::new(&context.user_id, subject, predicate, object, memory_type, timestamp)
                        .with_chat_id(context.chat_id.clone())
                        .with_keywords(raw.keywords)
                        .with_importance(parse_level(&raw.importance).and_then(Importance::from_value).unwrap_or(Importance::General))
                        .with_confidence(parse_level(&raw.confidence).and_then(Confidence::from_value).unwrap_or(Confidence::Medium)),
                )
            })
            .collect()
    }

    fn extract_with_rules(
        &self,
        text: &str,
        context: &BuildContext,
        timestamp: DateTime<Utc>,
    ) -> Vec<MemoryChunk> {
        let mut chunks = Vec::new();
        chunks.extend(extract_personal_facts(text, context, timestamp));
        chunks.extend(extract_preferences(text, context, timestamp));
        chunks.extend(extract_events(text, context, timestamp));
        chunks
    }
}

fn parse_level(value: &Option<serde_json::Value>) -> Option<u8> {
    match value.as_ref()? {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v as u8),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_extraction_prompt(text: &str, timestamp: DateTime<Utc>) -> String {
    let current_date = timestamp.format("%Y-%m-%d");
    format!(
        "请从以下对话中提取值得长期记忆的信息，使用主谓宾结构。\n\n\
         对话内容：\n{text}\n\n\
         当前时间：{current_date}。涉及时间的记忆必须换算为绝对日期（YYYY-MM-DD），\
         例如\"明天\"要换算为具体日期。\n\n\
         重要性等级: 1=低, 2=一般, 3=高, 4=关键；置信度: 1=低, 2=中等, 3=高, 4=已验证。\n\n\
         请以JSON格式输出：\n\
         {{\n\
           \"memories\": [\n\
             {{\n\
               \"type\": \"personal_fact|event|preference|opinion|relationship|emotion|knowledge|skill|goal|experience|contextual\",\n\
               \"subject\": \"主语(通常是用户)\",\n\
               \"predicate\": \"谓语(动作/状态)\",\n\
               \"object\": \"宾语(对象/属性)\",\n\
               \"keywords\": [\"关键词\"],\n\
               \"importance\": 1,\n\
               \"confidence\": 2,\n\
               \"reasoning\": \"提取理由\"\n\
             }}\n\
           ]\n\
         }}\n\n\
         只提取确实值得记忆的信息；没有可提取内容时返回空的 memories 数组。"
    )
}

// ── Rule-based extraction ─────────────────────────────────────────────────────

static PERSONAL_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"我叫([\w一-龥]+)", "is_named"),
        (r"我今年(\d+)岁", "is_age"),
        (r"我住在([\w一-龥]+)", "lives_in"),
        (r"我的电话是(\d+)", "has_phone"),
        (r"我的邮箱是([\w.]+@[\w.]+)", "has_email"),
        (r"我(?:的)?生日是([\d一-龥月日号]+)", "has_birthday"),
    ]
    .into_iter()
    .filter_map(|(pattern, predicate)| Regex::new(pattern).ok().map(|re| (re, predicate)))
    .collect()
});

static PREFERENCE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"我喜欢(.+)", "likes"),
        (r"我不喜欢(.+)", "dislikes"),
        (r"我爱吃(.+)", "likes_food"),
        (r"我讨厌(.+)", "hates"),
        (r"我最喜欢的(.+)", "favorite_is"),
    ]
    .into_iter()
    .filter_map(|(pattern, predicate)| Regex::new(pattern).ok().map(|re| (re, predicate)))
    .collect()
});

const EVENT_KEYWORDS: &[&str] = &[
    "明天", "今天", "昨天", "上周", "下周", "约会", "会议", "活动", "旅行", "生日",
];

fn extract_personal_facts(
    text: &str,
    context: &BuildContext,
    timestamp: DateTime<Utc>,
) -> Vec<MemoryChunk> {
    PERSONAL_PATTERNS
        .iter()
        .filter_map(|(re, predicate)| {
            let capture = re.captures(text)?.get(1)?.as_str().trim().to_string();
            Some(
                MemoryChunk::new(
                    &context.user_id,
                    &context.user_id,
                    *predicate,
                    capture,
                    MemoryType::PersonalFact,
                    timestamp,
                )
                .with_chat_id(context.chat_id.clone())
                .with_importance(Importance::High)
                .with_confidence(Confidence::High),
            )
        })
        .collect()
}

fn extract_preferences(
    text: &str,
    context: &BuildContext,
    timestamp: DateTime<Utc>,
) -> Vec<MemoryChunk> {
    PREFERENCE_PATTERNS
        .iter()
        .filter_map(|(re, predicate)| {
            let capture = re.captures(text)?.get(1)?.as_str().trim().to_string();
            Some(
                MemoryChunk::new(
                    &context.user_id,
                    &context.user_id,
                    *predicate,
                    capture,
                    MemoryType::Preference,
                    timestamp,
                )
                .with_chat_id(context.chat_id.clone())
                .with_importance(Importance::General)
                .with_confidence(Confidence::Medium),
            )
        })
        .collect()
}

fn extract_events(
    text: &str,
    context: &BuildContext,
    timestamp: DateTime<Utc>,
) -> Vec<MemoryChunk> {
    if !EVENT_KEYWORDS.iter().any(|k| text.contains(k)) {
        return Vec::new();
    }
    vec![
        MemoryChunk::new(
            &context.user_id,
            &context.user_id,
            "mentioned_event",
            text.chars().take(200).collect::<String>(),
            MemoryType::Event,
            timestamp,
        )
        .with_chat_id(context.chat_id.clone())
        .with_importance(Importance::General)
        .with_confidence(Confidence::Medium),
    ]
}

/// Hybrid merge: rules win, LLM chunks that duplicate a rule triple are
/// dropped.
fn merge_hybrid(rule_chunks: Vec<MemoryChunk>, llm_chunks: Vec<MemoryChunk>) -> Vec<MemoryChunk> {
    let mut merged = rule_chunks;
    for llm_chunk in llm_chunks {
        let duplicate = merged.iter().any(|existing| {
            existing.semantic_hash == llm_chunk.semantic_hash
                || (existing.predicate == llm_chunk.predicate
                    && existing.object == llm_chunk.object)
        });
        if !duplicate {
            merged.push(llm_chunk);
        }
    }
    merged
}

// ── Time normalization ────────────────────────────────────────────────────────

/// Replace relative date words in the display text and object with absolute
/// dates computed against the chunk's creation time.
fn normalize_relative_dates(chunk: &mut MemoryChunk, now: DateTime<Utc>) {
    let replacements = relative_date_replacements(now);
    let mut display = chunk.display.clone();
    let mut object = chunk.object.clone();
    for (re, replacement) in &replacements {
        display = re.replace_all(&display, replacement.as_str()).into_owned();
        object = re.replace_all(&object, replacement.as_str()).into_owned();
    }
    chunk.display = display;
    chunk.object = object;
}

fn relative_date_replacements(now: DateTime<Utc>) -> Vec<(Regex, String)> {
    let day = |offset: i64| (now + Duration::days(offset)).format("%Y-%m-%d").to_string();
    let week = |offset: i64| (now + Duration::weeks(offset)).format("%Y-%m-%d").to_string();

    let next_month = {
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        format!("{year}-{month:02}-01")
    };
    let prev_month = {
        let (year, month) = if now.month() == 1 {
            (now.year() - 1, 12)
        } else {
            (now.year(), now.month() - 1)
        };
        format!("{year}-{month:02}-01")
    };

    [
        ("大后天", day(3)),
        ("大前天", day(-3)),
        ("后天", day(2)),
        ("前天", day(-2)),
        ("明天|明日", day(1)),
        ("昨天|昨日", day(-1)),
        ("今天|今日", day(0)),
        ("下周|下星期", week(1)),
        ("上周|上星期", week(-1)),
        ("本周|这周|这星期", day(0)),
        ("下月|下个月", next_month),
        ("上月|上个月", prev_month),
        ("本月|这个月", now.format("%Y-%m-01").to_string()),
        ("明年|下一年", (now.year() + 1).to_string()),
        ("去年|上一年", (now.year() - 1).to_string()),
        ("今年", now.format("%Y").to_string()),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
}

fn auto_tag(chunk: &mut MemoryChunk) {
    for tag in chunk.memory_type.auto_tags() {
        chunk.add_tag(*tag);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fennec_llm::testutil::StubLlm;

    use super::*;

    fn builder_with(stub: Arc<StubLlm>) -> MemoryBuilder {
        MemoryBuilder::new(MemoryConfig::default(), stub)
    }

    fn context() -> BuildContext {
        BuildContext {
            user_id: "u3".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn short_text_uses_rules_only() {
        let stub = Arc::new(StubLlm::new("{}"));
        let builder = builder_with(Arc::clone(&stub));

        let chunks = builder
            .build_memories("我生日是11月23日", &context(), Utc::now())
            .await;

        assert_eq!(stub.call_count(), 0);
        assert!(
            chunks
                .iter()
                .any(|c| c.memory_type == MemoryType::PersonalFact
                    && c.object.contains("11月23日"))
        );
    }

    #[tokio::test]
    async fn command_messages_never_reach_the_llm() {
        let stub = Arc::new(StubLlm::new("{}"));
        let builder = builder_with(Arc::clone(&stub));
        let ctx = BuildContext {
            message_type: Some("command".to_string()),
            ..context()
        };

        let long_command = "/config set 一个很长很长的配置值 ".repeat(5);
        builder.build_memories(&long_command, &ctx, Utc::now()).await;
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn llm_extraction_parses_the_schema() {
        let stub = Arc::new(StubLlm::new(
            r#"{"memories": [{"type": "preference", "subject": "u3", "predicate": "likes",
                "object": "火锅", "keywords": ["火锅"], "importance": 3, "confidence": "3",
                "reasoning": "明确表达"}]}"#,
        ));
        let builder = builder_with(stub);

        let text = "说起来我真的超级喜欢吃火锅，麻辣的清汤的都可以，每个星期都要和朋友去吃一次，这个习惯已经坚持了整整三年，大概是我生活里最重要的仪式感了。";
        let chunks = builder.build_memories(text, &context(), Utc::now()).await;

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.memory_type, MemoryType::Preference);
        assert_eq!(chunk.importance, Importance::High);
        assert_eq!(chunk.confidence, Confidence::High);
        assert!(chunk.tags.contains(&"偏好".to_string()));
    }

    #[tokio::test]
    async fn malformed_llm_reply_yields_no_memories() {
        let stub = Arc::new(StubLlm::new("抱歉，我不知道该怎么回答。"));
        let builder = builder_with(stub);

        let text = "和同事聊了很多关于项目架构的想法，从模块划分到接口设计都讨论了一遍，感觉收获很大，后面想找时间深入学习一下相关的设计模式。";
        let chunks = builder.build_memories(text, &context(), Utc::now()).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn relative_dates_become_absolute() {
        let stub = Arc::new(StubLlm::new("{}"));
        let builder = builder_with(stub);
        let now = DateTime::parse_from_rfc3339("2024-09-29T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let chunks = builder.build_memories("我们明天去旅行", &context(), now).await;
        let event = chunks
            .iter()
            .find(|c| c.memory_type == MemoryType::Event)
            .unwrap();
        assert!(event.object.contains("2024-09-30"));
        assert!(!event.object.contains("明天"));
    }

    #[tokio::test]
    async fn low_confidence_chunks_are_dropped() {
        let stub = Arc::new(StubLlm::new(
            r#"{"memories": [{"type": "opinion", "subject": "u3", "predicate": "thinks",
                "object": "可能吧说不清楚", "keywords": [], "importance": 1, "confidence": 1}]}"#,
        ));
        let builder = builder_with(stub);

        let text = "嗯……怎么说呢，我觉得这件事情也许是这样，但是具体的细节我也说不太清楚，可能要再想一想才能给出一个确定的答案，先不管了吧。";
        let chunks = builder.build_memories(text, &context(), Utc::now()).await;
        assert!(chunks.is_empty());
    }

    #[test]
    fn strategy_selection() {
        let stub = Arc::new(StubLlm::new("{}"));
        let builder = builder_with(stub);

        assert_eq!(
            builder.determine_strategy("短", &context()),
            ExtractionStrategy::RuleBased
        );

        let long = "这是一段足够长的普通对话内容，应该交给大模型来提取其中的记忆信息才对。".repeat(2);
        assert_eq!(
            builder.determine_strategy(&long, &context()),
            ExtractionStrategy::LlmBased
        );

        let structured = BuildContext {
            structured_data: Some(serde_json::json!({"kind": "profile"})),
            ..context()
        };
        assert_eq!(
            builder.determine_strategy(&long, &structured),
            ExtractionStrategy::Hybrid
        );
    }
}
