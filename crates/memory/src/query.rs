//! LLM-assisted retrieval planning.
//!
//! The planner turns a raw query into a structured plan for the coarse
//! filter. Any failure falls back to the identity plan so retrieval never
//! depends on the model being up.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use fennec_llm::{GenParams, LlmClient, ModelSelector, extract_json_payload};

/// Recency preference returned by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recency {
    Recent,
    #[default]
    Any,
    Historical,
}

impl Recency {
    fn parse(value: &str) -> Self {
        match value {
            "recent" => Self::Recent,
            "historical" => Self::Historical,
            _ => Self::Any,
        }
    }

    /// Time window bounds implied by the preference.
    pub fn window(&self, now: DateTime<Utc>) -> (Option<i64>, Option<i64>) {
        match self {
            Self::Recent => (Some((now - Duration::days(7)).timestamp()), None),
            Self::Any => (None, None),
            Self::Historical => (None, Some((now - Duration::days(30)).timestamp())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub semantic_query: String,
    pub memory_types: Vec<String>,
    pub subject_includes: Vec<String>,
    pub object_includes: Vec<String>,
    pub required_keywords: Vec<String>,
    pub recency: Recency,
    pub limit: usize,
    pub emphasis: String,
}

impl QueryPlan {
    /// The identity plan: vector search on the raw query, no metadata
    /// constraints.
    pub fn identity(query_text: &str, default_limit: usize) -> Self {
        Self {
            semantic_query: query_text.to_string(),
            memory_types: Vec::new(),
            subject_includes: Vec::new(),
            object_includes: Vec::new(),
            required_keywords: Vec::new(),
            recency: Recency::Any,
            limit: default_limit,
            emphasis: "balanced".to_string(),
        }
    }
}

pub struct MemoryQueryPlanner {
    llm: Arc<dyn LlmClient>,
    default_limit: usize,
}

impl MemoryQueryPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, default_limit: usize) -> Self {
        Self { llm, default_limit }
    }

    pub async fn plan_query(&self, query_text: &str) -> QueryPlan {
        let prompt = build_planner_prompt(query_text);
        let params = GenParams::for_request("memory.query_plan")
            .temperature(0.2)
            .max_tokens(400);

        let response = match self.llm.generate(&prompt, ModelSelector::Utils, params).await {
            Ok((response, _)) => response,
            Err(err) => {
                warn!(%err, "query planner failed, using identity plan");
                return QueryPlan::identity(query_text, self.default_limit);
            }
        };

        match parse_plan(&response, query_text, self.default_limit) {
            Some(plan) => {
                debug!(
                    semantic_query = %plan.semantic_query,
                    types = plan.memory_types.len(),
                    "query plan ready"
                );
                plan
            }
            None => {
                warn!("query planner reply unparseable, using identity plan");
                QueryPlan::identity(query_text, self.default_limit)
            }
        }
    }
}

fn build_planner_prompt(query_text: &str) -> String {
    format!(
        "你是一名记忆检索规划助手，请基于输入生成一个简洁的 JSON 检索计划。\n\n\
         仅需提供以下字段：\n\
         - semantic_query: 用于向量召回的自然语言描述；\n\
         - memory_types: 建议检索的记忆类型列表 (personal_fact,event,preference,opinion,relationship,emotion,knowledge,skill,goal,experience,contextual)；\n\
         - subject_includes: 建议出现在记忆主语中的人物或角色；\n\
         - object_includes: 建议关注的对象、主题或关键信息；\n\
         - required_keywords: 建议必须包含的关键词；\n\
         - recency: 时间偏好，可选 recent/any/historical；\n\
         - limit: 推荐的最大返回数量 (1-15)；\n\
         - emphasis: 检索重点，可选 balanced/contextual/recent/comprehensive。\n\n\
         ## 当前查询:\n\"{query_text}\"\n\n\
         请直接输出符合要求的 JSON 对象，禁止添加额外文本或 Markdown 代码块。"
    )
}

fn parse_plan(response: &str, fallback_query: &str, default_limit: usize) -> Option<QueryPlan> {
    #[derive(Deserialize)]
    struct RawPlan {
        semantic_query: Option<String>,
        #[serde(default)]
        memory_types: Vec<String>,
        #[serde(default)]
        subject_includes: Vec<String>,
        #[serde(default)]
        object_includes: Vec<String>,
        #[serde(default)]
        required_keywords: Vec<String>,
        recency: Option<String>,
        limit: Option<usize>,
        emphasis: Option<String>,
    }

    let payload = extract_json_payload(response)?;
    let raw: RawPlan = serde_json::from_str(payload).ok()?;

    let semantic_query = raw
        .semantic_query
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| fallback_query.to_string());

    Some(QueryPlan {
        semantic_query,
        memory_types: raw.memory_types,
        subject_includes: raw.subject_includes,
        object_includes: raw.object_includes,
        required_keywords: raw.required_keywords,
        recency: raw
            .recency
            .as_deref()
            .map(Recency::parse)
            .unwrap_or_default(),
        limit: raw.limit.unwrap_or(default_limit).clamp(1, 15),
        emphasis: raw.emphasis.unwrap_or_else(|| "balanced".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use fennec_llm::testutil::{FailingLlm, StubLlm};

    use super::*;

    #[tokio::test]
    async fn parses_a_full_plan() {
        let stub = Arc::new(StubLlm::new(
            r#"{"semantic_query": "用户的生日日期", "memory_types": ["personal_fact"],
                "subject_includes": ["u3"], "object_includes": ["生日"],
                "required_keywords": ["生日"], "recency": "any", "limit": 3,
                "emphasis": "balanced"}"#,
        ));
        let planner = MemoryQueryPlanner::new(stub, 10);

        let plan = planner.plan_query("我什么时候生日").await;
        assert_eq!(plan.semantic_query, "用户的生日日期");
        assert_eq!(plan.memory_types, vec!["personal_fact".to_string()]);
        assert_eq!(plan.limit, 3);
        assert_eq!(plan.recency, Recency::Any);
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_identity() {
        let planner = MemoryQueryPlanner::new(Arc::new(FailingLlm), 10);
        let plan = planner.plan_query("我什么时候生日").await;
        assert_eq!(plan.semantic_query, "我什么时候生日");
        assert!(plan.memory_types.is_empty());
        assert_eq!(plan.limit, 10);
    }

    #[tokio::test]
    async fn garbage_reply_falls_back_to_identity() {
        let stub = Arc::new(StubLlm::new("我不明白你的意思"));
        let planner = MemoryQueryPlanner::new(stub, 5);
        let plan = planner.plan_query("查询").await;
        assert_eq!(plan.semantic_query, "查询");
    }

    #[test]
    fn recency_windows() {
        let now = Utc::now();
        let (after, before) = Recency::Recent.window(now);
        assert!(after.is_some() && before.is_none());
        assert_eq!(Recency::Any.window(now), (None, None));
        let (after, before) = Recency::Historical.window(now);
        assert!(after.is_none() && before.is_some());
    }
}
