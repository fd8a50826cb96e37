//! Task Analyzer
//!
//! Classification contract consumed by intake and the executor's quality step:
//! - `classify`: content → `{intent, category, complexity, requiredCapabilities, estimatedDuration, confidence}`
//! - `assess_quality`: raw result + original task → quality in [0, 1]
//!
//! Two implementations:
//! - `KeywordAnalyzer`: deterministic keyword sets, no network
//! - `OllamaAnalyzer`: local LLM over the Ollama `/api/generate` endpoint
//!
//! Callers never propagate `AnalyzerError`; each call site has a documented default.

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::error::AnalyzerError;
use crate::task::{Complexity, TaskAnalysis, TaskCategory, TaskKind};

/// Input of a classification call
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub content: String,
    pub kind: TaskKind,
    pub language: String,
    pub user_hint: Option<String>,
}

/// Input of a quality estimate
#[derive(Debug, Clone)]
pub struct QualityRequest {
    pub raw_result: String,
    pub original_task: String,
}

/// External analysis collaborator
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, request: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError>;

    async fn assess_quality(&self, request: &QualityRequest) -> Result<f64, AnalyzerError>;
}

/// Capability tag each category requires
pub fn capabilities_for(category: TaskCategory) -> BTreeSet<String> {
    let tag = match category {
        TaskCategory::DataAnalysis => "data-analysis",
        TaskCategory::WebSearch => "web-fetch",
        TaskCategory::DataTransform => "data-transform",
        TaskCategory::Automation => "automation",
        TaskCategory::FileManagement => "file-ops",
        TaskCategory::Voice => "voice",
        TaskCategory::Image => "image",
        TaskCategory::General => TaskAnalysis::DEFAULT_CAPABILITY,
    };
    BTreeSet::from([tag.to_string()])
}

// Keyword sets
static DATA_ANALYSIS_KEYWORDS: &[&str] = &[
    "analyze", "analyse", "analysis", "statistics", "stats", "report",
    "trend", "sales", "revenue", "data", "average", "summarize",
    "분석", "통계", "매출", "요약",
];

static WEB_SEARCH_KEYWORDS: &[&str] = &[
    "http://", "https://", "www.", "search", "website", "fetch",
    "browse", "news", "look up", "검색", "사이트", "뉴스",
];

static DATA_TRANSFORM_KEYWORDS: &[&str] = &[
    "convert", "transform", "csv", "json", "xml", "parse",
    "reformat", "to table", "변환",
];

static AUTOMATION_KEYWORDS: &[&str] = &[
    "automate", "automation", "schedule", "every day", "every week",
    "workflow", "remind", "step by step", "자동", "예약",
];

static FILE_KEYWORDS: &[&str] = &[
    "file", "folder", "directory", "list files", "read file", "pdf",
    "document", "파일", "폴더", "문서",
];

static VOICE_KEYWORDS: &[&str] = &[
    "voice", "audio", "speech", "transcribe", "dictate", "음성",
];

static IMAGE_KEYWORDS: &[&str] = &[
    "image", "photo", "picture", "screenshot", "ocr", "이미지", "사진",
];

static CONJUNCTIONS: &[&str] = &[" and ", " then ", " also ", ", ", "; ", " 그리고 "];

/// Category order doubles as the tie-break order
static CATEGORY_KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (TaskCategory::DataAnalysis, DATA_ANALYSIS_KEYWORDS),
    (TaskCategory::WebSearch, WEB_SEARCH_KEYWORDS),
    (TaskCategory::DataTransform, DATA_TRANSFORM_KEYWORDS),
    (TaskCategory::Automation, AUTOMATION_KEYWORDS),
    (TaskCategory::FileManagement, FILE_KEYWORDS),
    (TaskCategory::Voice, VOICE_KEYWORDS),
    (TaskCategory::Image, IMAGE_KEYWORDS),
];

/// Deterministic keyword classifier
#[derive(Debug, Default, Clone)]
pub struct KeywordAnalyzer;

impl KeywordAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous classification (never fails)
    pub fn classify_text(&self, request: &ClassificationRequest) -> TaskAnalysis {
        let mut text = request.content.to_lowercase();
        if let Some(hint) = &request.user_hint {
            text.push(' ');
            text.push_str(&hint.to_lowercase());
        }

        let (category, hits) = match request.kind {
            TaskKind::Voice => (TaskCategory::Voice, 1),
            TaskKind::Image => (TaskCategory::Image, 1),
            TaskKind::Document => (TaskCategory::FileManagement, 1),
            TaskKind::Text | TaskKind::Command => Self::best_category(&text),
        };

        let complexity = Self::complexity(&text);
        let confidence = if category == TaskCategory::General {
            0.4
        } else {
            (0.5 + 0.15 * hits as f64).min(0.95)
        };
        let estimated_duration_secs = match complexity {
            Complexity::Low => 10,
            Complexity::Medium => 30,
            Complexity::High => 120,
        };

        let snippet: String = request.content.trim().chars().take(80).collect();
        TaskAnalysis {
            intent: format!("{}: {}", category.as_str(), snippet),
            category,
            complexity,
            required_capabilities: capabilities_for(category),
            estimated_duration_secs,
            confidence,
            degraded: false,
        }
    }

    fn best_category(text: &str) -> (TaskCategory, usize) {
        let mut best = (TaskCategory::General, 0);
        for (category, keywords) in CATEGORY_KEYWORDS {
            let hits = keywords.iter().filter(|kw| text.contains(*kw)).count();
            if hits > best.1 {
                best = (*category, hits);
            }
        }
        best
    }

    fn complexity(text: &str) -> Complexity {
        let words = text.split_whitespace().count();
        let joins: usize = CONJUNCTIONS.iter().map(|c| text.matches(c).count()).sum();
        if words > 60 || joins >= 3 {
            Complexity::High
        } else if words < 8 && joins == 0 {
            Complexity::Low
        } else {
            Complexity::Medium
        }
    }

    /// Heuristic quality: length plus word overlap with the request
    pub fn estimate_quality(&self, request: &QualityRequest) -> f64 {
        let result = request.raw_result.trim();
        if result.is_empty() {
            return 0.2;
        }
        if result.chars().count() < 40 {
            return 0.5;
        }
        let result_lower = result.to_lowercase();
        let task_words: BTreeSet<String> = request
            .original_task
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 3)
            .map(String::from)
            .collect();
        if task_words.is_empty() {
            return 0.7;
        }
        let overlap = task_words
            .iter()
            .filter(|w| result_lower.contains(w.as_str()))
            .count();
        0.6 + 0.35 * (overlap as f64 / task_words.len() as f64)
    }
}

#[async_trait]
impl Analyzer for KeywordAnalyzer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError> {
        Ok(self.classify_text(request))
    }

    async fn assess_quality(&self, request: &QualityRequest) -> Result<f64, AnalyzerError> {
        Ok(self.estimate_quality(request))
    }
}

/// Raw classification as returned by an LLM
#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    intent: String,
    category: String,
    complexity: String,
    #[serde(alias = "requiredCapabilities")]
    required_capabilities: Vec<String>,
    #[serde(default, alias = "estimatedDuration")]
    estimated_duration: Option<serde_json::Value>,
    confidence: f64,
}

static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex")
});

/// Parse an analyzer reply into a validated `TaskAnalysis`.
///
/// Accepts a bare JSON object or one embedded in surrounding prose.
pub fn parse_classification(reply: &str) -> Result<TaskAnalysis, AnalyzerError> {
    let json = extract_json_object(reply)
        .ok_or_else(|| AnalyzerError::Malformed("no JSON object in reply".into()))?;
    let raw: RawClassification =
        serde_json::from_str(json).map_err(|e| AnalyzerError::Malformed(e.to_string()))?;

    let category = TaskCategory::parse(&raw.category)
        .ok_or_else(|| AnalyzerError::Malformed(format!("unknown category '{}'", raw.category)))?;
    let complexity = Complexity::parse(&raw.complexity).ok_or_else(|| {
        AnalyzerError::Malformed(format!("unknown complexity '{}'", raw.complexity))
    })?;
    let estimated_duration_secs = match raw.estimated_duration {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(30.0).max(0.0) as u64,
        Some(serde_json::Value::String(s)) => FIRST_NUMBER
            .find(&s)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|v| v.max(0.0) as u64)
            .unwrap_or(30),
        _ => 30,
    };

    let analysis = TaskAnalysis {
        intent: raw.intent.trim().to_string(),
        category,
        complexity,
        required_capabilities: raw
            .required_capabilities
            .iter()
            .map(|c| c.trim().to_lowercase())
            .collect(),
        estimated_duration_secs,
        confidence: raw.confidence,
        degraded: false,
    };
    analysis.validate().map_err(AnalyzerError::Malformed)?;
    Ok(analysis)
}

/// Parse a quality estimate in [0, 1] from an analyzer reply
pub fn parse_quality(reply: &str) -> Result<f64, AnalyzerError> {
    let value = match extract_json_object(reply)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
    {
        Some(obj) => ["quality", "qualityScore", "quality_score", "score"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(|v| v.as_f64())),
        None => FIRST_NUMBER
            .find(reply)
            .and_then(|m| m.as_str().parse::<f64>().ok()),
    };
    match value {
        Some(q) if (0.0..=1.0).contains(&q) => Ok(q),
        Some(q) => Err(AnalyzerError::Malformed(format!("quality {} outside [0, 1]", q))),
        None => Err(AnalyzerError::Malformed("no quality value in reply".into())),
    }
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Ollama generate response
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// LLM-backed analyzer (Ollama)
pub struct OllamaAnalyzer {
    url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaAnalyzer {
    pub fn new(url: &str, config: &AnalyzerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.request_timeout,
            client,
        })
    }

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, AnalyzerError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "format": "json",
                "options": {
                    "temperature": 0.1,
                    "num_predict": max_tokens,
                }
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyzerError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    AnalyzerError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AnalyzerError::Unavailable(format!(
                "Ollama returned {}",
                response.status()
            )));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Malformed(e.to_string()))?;
        Ok(result.response.trim().to_string())
    }
}

#[async_trait]
impl Analyzer for OllamaAnalyzer {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError> {
        let prompt = format!(
            r#"Classify this user request. Reply with ONLY a JSON object:
{{"intent": "...", "category": "...", "complexity": "...", "required_capabilities": ["..."], "estimated_duration": <seconds>, "confidence": <0-1>}}

category: one of data-analysis, web-search, data-transform, automation, file-management, voice, image, general
complexity: one of low, medium, high
required_capabilities: tags such as data-analysis, web-fetch, data-transform, automation, file-ops, voice, image, general-analysis

Kind: {}
Language: {}
Hint: {}
Request: {}

JSON:"#,
            request.kind.as_str(),
            request.language,
            request.user_hint.as_deref().unwrap_or("none"),
            request.content
        );

        let reply = self.generate(&prompt, 256).await?;
        debug!("Ollama classification reply: {}", reply);
        parse_classification(&reply)
    }

    async fn assess_quality(&self, request: &QualityRequest) -> Result<f64, AnalyzerError> {
        let prompt = format!(
            r#"Rate how well the result answers the task. Reply with ONLY {{"quality": <0-1>}}.

Task: {}

Result: {}

JSON:"#,
            request.original_task,
            request.raw_result.chars().take(4000).collect::<String>()
        );

        let reply = self.generate(&prompt, 32).await?;
        parse_quality(&reply)
    }
}
