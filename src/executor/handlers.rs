//! Capability Handlers
//!
//! One handler per capability class, looked up by class at execution time.
//! Adding a capability means registering one more `CapabilityHandler`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::ProgressReporter;
use crate::config::ExecutorConfig;
use crate::error::HandlerError;
use crate::registry::CapabilityClass;
use crate::task::{Task, TaskOutput};

/// Input of a handler invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub task: Task,
    pub progress: ProgressReporter,
}

impl HandlerContext {
    /// Context with a detached progress reporter
    pub fn detached(task: Task) -> Self {
        Self {
            task,
            progress: ProgressReporter::detached(),
        }
    }
}

/// Executes tasks for one capability class
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    fn class(&self) -> CapabilityClass;

    /// Free-form output goes through the analyzer quality step
    fn produces_free_form(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError>;
}

/// Lookup table keyed by capability class
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CapabilityClass, Arc<dyn CapabilityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One built-in handler per class
    pub fn with_defaults(config: &ExecutorConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AnalysisHandler));
        registry.register(Arc::new(WebFetchHandler::new(
            config.timeouts.web_fetch,
            config.max_fetch_bytes,
        )));
        registry.register(Arc::new(DataTransformHandler));
        registry.register(Arc::new(AutomationHandler));
        registry.register(Arc::new(FileOpsHandler::new(config.workspace_root.clone())));
        registry.register(Arc::new(VoiceHandler));
        registry.register(Arc::new(ImageHandler));
        registry
    }

    /// Register a handler, replacing any previous one for its class
    pub fn register(&mut self, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(handler.class(), handler);
    }

    pub fn get(&self, class: CapabilityClass) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&class).cloned()
    }

    pub fn classes(&self) -> BTreeSet<CapabilityClass> {
        self.handlers.keys().copied().collect()
    }
}

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).expect("valid regex"));

static NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));

static TITLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

static STEP_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:,?\s*\band then\b|,?\s*\bthen\b|;|\n|그리고)\s*").expect("valid regex")
});

static STEP_NUMBERING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s*").expect("valid regex"));

static STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "into", "please", "about",
    "what", "have", "are", "was", "you", "your", "our", "can", "could", "would",
];

/// Extract unique URLs in order of appearance
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Lowercased file extension of a path or URL, ignoring query and fragment
fn extension_of(reference: &str) -> Option<String> {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = name.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_lowercase())
}

// ---- analysis ----

/// Text statistics: words, sentences, numbers, top keywords
pub struct AnalysisHandler;

#[async_trait]
impl CapabilityHandler for AnalysisHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Analysis
    }

    fn produces_free_form(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        let text = ctx.task.content.trim();
        if text.is_empty() {
            return Err(HandlerError::InvalidInput("nothing to analyze".into()));
        }

        let words = text.split_whitespace().count();
        let sentences = text
            .split(['.', '!', '?', '\n'])
            .filter(|s| !s.trim().is_empty())
            .count()
            .max(1);
        ctx.progress.report(30);

        let numbers: Vec<f64> = NUMBER_PATTERN
            .find_iter(text)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        ctx.progress.report(55);

        let mut frequency: HashMap<String, usize> = HashMap::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 3 && !STOPWORDS.contains(t))
            .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        {
            *frequency.entry(token.to_string()).or_default() += 1;
        }
        let mut keywords: Vec<(String, usize)> = frequency.into_iter().collect();
        keywords.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        keywords.truncate(5);
        ctx.progress.report(80);

        let mut message = format!("Analyzed {} words in {} sentence(s).", words, sentences);
        let numeric = if numbers.is_empty() {
            serde_json::Value::Null
        } else {
            let min = numbers.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            message.push_str(&format!(
                " Found {} numeric value(s): min {}, max {}, mean {:.2}.",
                numbers.len(),
                min,
                max,
                mean
            ));
            serde_json::json!({"count": numbers.len(), "min": min, "max": max, "mean": mean})
        };
        if !keywords.is_empty() {
            let names: Vec<&str> = keywords.iter().map(|(k, _)| k.as_str()).collect();
            message.push_str(&format!(" Top keywords: {}.", names.join(", ")));
        }

        Ok(TaskOutput::success(
            message,
            serde_json::json!({
                "words": words,
                "sentences": sentences,
                "numbers": numeric,
                "keywords": keywords
                    .iter()
                    .map(|(k, n)| serde_json::json!({"word": k, "count": n}))
                    .collect::<Vec<_>>(),
            }),
        ))
    }
}

// ---- web-fetch ----

/// Fetches up to three URLs found in the request
pub struct WebFetchHandler {
    client: reqwest::Client,
    max_bytes: usize,
}

impl WebFetchHandler {
    const MAX_URLS: usize = 3;

    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("autopilot-engine/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, max_bytes }
    }

    async fn fetch(&self, url: &str) -> Result<serde_json::Value, HandlerError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() >= self.max_bytes {
                body.truncate(self.max_bytes);
                truncated = true;
                break;
            }
        }

        let text = String::from_utf8_lossy(&body);
        let title = TITLE_PATTERN
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "));

        Ok(serde_json::json!({
            "url": url,
            "status": status.as_u16(),
            "content_type": content_type,
            "title": title,
            "bytes": body.len(),
            "truncated": truncated,
        }))
    }
}

#[async_trait]
impl CapabilityHandler for WebFetchHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::WebFetch
    }

    fn produces_free_form(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        let mut urls = extract_urls(&ctx.task.content);
        if let Some(media) = ctx.task.media_url.as_deref() {
            urls.extend(extract_urls(media));
        }
        urls.truncate(Self::MAX_URLS);
        if urls.is_empty() {
            return Err(HandlerError::InvalidInput("no URL in request".into()));
        }
        ctx.progress.report(10);

        let total = urls.len();
        let mut pages = Vec::new();
        let mut failures = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            match self.fetch(url).await {
                Ok(page) => pages.push(page),
                Err(e) => {
                    debug!("Fetch of {} failed: {}", url, e);
                    failures.push(format!("{}: {}", url, e));
                }
            }
            ctx.progress.report((10 + 80 * (i + 1) / total) as u8);
        }

        if pages.is_empty() {
            return Err(HandlerError::Failed(format!(
                "all {} fetches failed: {}",
                total,
                failures.join("; ")
            )));
        }

        let mut message = format!("Fetched {} of {} page(s).", pages.len(), total);
        for page in &pages {
            message.push_str(&format!(
                "\n{} {} | {} ({} bytes)",
                page["status"],
                page["url"].as_str().unwrap_or(""),
                page["title"].as_str().unwrap_or("untitled"),
                page["bytes"]
            ));
        }

        Ok(TaskOutput::success(
            message,
            serde_json::json!({"pages": pages, "failures": failures}),
        ))
    }
}

// ---- data-transform ----

/// CSV-like text to JSON records, or a JSON document summary
pub struct DataTransformHandler;

impl DataTransformHandler {
    fn find_json(text: &str) -> Option<serde_json::Value> {
        let start = text.find(['{', '['])?;
        serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<serde_json::Value>()
            .next()?
            .ok()
            .filter(|v| v.is_object() || v.is_array())
    }

    fn parse_csv(text: &str) -> Option<(Vec<String>, Vec<serde_json::Value>)> {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| l.contains(','))
            .collect();
        let (header, rows) = lines.split_first()?;
        let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();
        if columns.len() < 2 || columns.iter().any(|c| c.is_empty()) {
            return None;
        }

        let records: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| row.split(',').map(str::trim).collect::<Vec<_>>())
            .filter(|fields| fields.len() == columns.len())
            .map(|fields| {
                let record: serde_json::Map<String, serde_json::Value> = columns
                    .iter()
                    .zip(fields)
                    .map(|(column, field)| (column.clone(), Self::typed(field)))
                    .collect();
                serde_json::Value::Object(record)
            })
            .collect();
        (!records.is_empty()).then_some((columns, records))
    }

    fn typed(field: &str) -> serde_json::Value {
        if let Ok(n) = field.parse::<i64>() {
            return n.into();
        }
        if let Some(n) = field.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return serde_json::Value::Number(n);
        }
        match field {
            "true" => true.into(),
            "false" => false.into(),
            "" => serde_json::Value::Null,
            _ => field.into(),
        }
    }

    fn depth(value: &serde_json::Value) -> usize {
        match value {
            serde_json::Value::Object(map) => 1 + map.values().map(Self::depth).max().unwrap_or(0),
            serde_json::Value::Array(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            _ => 0,
        }
    }
}

#[async_trait]
impl CapabilityHandler for DataTransformHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::DataTransform
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        let text = &ctx.task.content;
        ctx.progress.report(20);

        if let Some(document) = Self::find_json(text) {
            ctx.progress.report(70);
            let (kind, size) = match &document {
                serde_json::Value::Object(map) => ("object", map.len()),
                serde_json::Value::Array(items) => ("array", items.len()),
                _ => ("scalar", 0),
            };
            let keys: Vec<String> = document
                .as_object()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            let depth = Self::depth(&document);
            let mut output = TaskOutput::success(
                format!("JSON {} with {} entries, depth {}.", kind, size, depth),
                serde_json::json!({"type": kind, "size": size, "depth": depth, "keys": keys}),
            );
            output.quality_score = 0.9;
            return Ok(output);
        }

        let Some((columns, records)) = Self::parse_csv(text) else {
            return Err(HandlerError::InvalidInput(
                "could not parse CSV or JSON from the request".into(),
            ));
        };
        ctx.progress.report(70);

        let mut output = TaskOutput::success(
            format!(
                "Converted {} CSV row(s) with columns {} to JSON.",
                records.len(),
                columns.join(", ")
            ),
            serde_json::json!({"columns": columns, "records": records}),
        );
        output.quality_score = 0.9;
        Ok(output)
    }
}

// ---- automation ----

/// Splits a request into an ordered step plan. Nothing is executed.
pub struct AutomationHandler;

impl AutomationHandler {
    pub fn steps(text: &str) -> Vec<String> {
        STEP_SEPARATOR
            .split(text)
            .map(|s| STEP_NUMBERING.replace(s, "").to_string())
            .map(|s| s.trim().trim_end_matches(['.', ',']).trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn suggested_class(step: &str) -> &'static str {
        let lower = step.to_lowercase();
        if lower.contains("http") || lower.contains("fetch") || lower.contains("search") {
            CapabilityClass::WebFetch.as_str()
        } else if lower.contains("convert") || lower.contains("csv") || lower.contains("json") {
            CapabilityClass::DataTransform.as_str()
        } else if lower.contains("file") || lower.contains("folder") || lower.contains("save") {
            CapabilityClass::FileOps.as_str()
        } else if lower.contains("analy") || lower.contains("report") || lower.contains("summar") {
            CapabilityClass::Analysis.as_str()
        } else {
            "manual"
        }
    }
}

#[async_trait]
impl CapabilityHandler for AutomationHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Automation
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        let steps = Self::steps(&ctx.task.content);
        if steps.is_empty() {
            return Err(HandlerError::InvalidInput("no steps found in request".into()));
        }
        ctx.progress.report(50);

        let plan: Vec<serde_json::Value> = steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                serde_json::json!({
                    "order": i + 1,
                    "description": step,
                    "suggested_class": Self::suggested_class(step),
                })
            })
            .collect();

        let mut message = format!("Planned {} step(s):", steps.len());
        for (i, step) in steps.iter().enumerate() {
            message.push_str(&format!("\n{}. {}", i + 1, step));
        }

        let mut output = TaskOutput::success(
            message,
            serde_json::json!({"steps": plan, "executed": false}),
        );
        output.quality_score = 0.8;
        Ok(output)
    }
}

// ---- file-ops ----

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileCommand {
    List(String),
    Read(String),
    Stat(String),
}

/// `list` / `read` / `stat` confined to a workspace root
pub struct FileOpsHandler {
    root: PathBuf,
}

impl FileOpsHandler {
    const MAX_READ_BYTES: u64 = 64 * 1024;
    const MAX_ENTRIES: usize = 200;

    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn parse(task: &Task) -> Result<FileCommand, HandlerError> {
        let tokens: Vec<&str> = task.content.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            let word = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            let path = tokens.get(i + 1).map(|p| p.trim_matches(['"', '\'', '`']).to_string());
            match word.as_str() {
                "list" | "ls" | "dir" => {
                    return Ok(FileCommand::List(path.unwrap_or_else(|| ".".to_string())))
                }
                "read" | "cat" | "show" | "open" => {
                    return path
                        .map(FileCommand::Read)
                        .ok_or_else(|| HandlerError::InvalidInput("missing path to read".into()))
                }
                "stat" | "info" | "size" => {
                    return path
                        .map(FileCommand::Stat)
                        .ok_or_else(|| HandlerError::InvalidInput("missing path to stat".into()))
                }
                _ => {}
            }
        }
        match task.media_url.as_deref() {
            Some(media) if !media.is_empty() => Ok(FileCommand::Stat(media.to_string())),
            _ => Err(HandlerError::InvalidInput(
                "expected a list, read or stat command".into(),
            )),
        }
    }

    /// Resolve `raw` inside the workspace; traversal and symlink escapes are rejected
    async fn resolve(&self, raw: &str) -> Result<(PathBuf, PathBuf), HandlerError> {
        let root = tokio::fs::canonicalize(&self.root).await?;
        let requested = Path::new(raw);
        if requested.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(HandlerError::InvalidInput(format!(
                "'{}' is outside the workspace",
                raw
            )));
        }
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            root.join(requested)
        };
        let resolved = tokio::fs::canonicalize(&joined).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HandlerError::Failed(format!("'{}' not found", raw))
            } else {
                HandlerError::from(e)
            }
        })?;
        if !resolved.starts_with(&root) {
            return Err(HandlerError::InvalidInput(format!(
                "'{}' is outside the workspace",
                raw
            )));
        }
        Ok((root, resolved))
    }

    fn display(root: &Path, path: &Path) -> String {
        match path.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

#[async_trait]
impl CapabilityHandler for FileOpsHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::FileOps
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        let command = Self::parse(&ctx.task)?;
        ctx.progress.report(20);

        let mut output = match command {
            FileCommand::List(raw) => {
                let (root, dir) = self.resolve(&raw).await?;
                let mut entries = Vec::new();
                let mut reader = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = reader.next_entry().await? {
                    let mut name = entry.file_name().to_string_lossy().to_string();
                    if entry.file_type().await?.is_dir() {
                        name.push('/');
                    }
                    entries.push(name);
                }
                entries.sort();
                let total = entries.len();
                entries.truncate(Self::MAX_ENTRIES);
                ctx.progress.report(80);
                TaskOutput::success(
                    format!("{} entries in {}", total, Self::display(&root, &dir)),
                    serde_json::json!({"path": Self::display(&root, &dir), "entries": entries, "total": total}),
                )
            }
            FileCommand::Read(raw) => {
                let (root, path) = self.resolve(&raw).await?;
                if !tokio::fs::metadata(&path).await?.is_file() {
                    return Err(HandlerError::InvalidInput(format!("'{}' is not a file", raw)));
                }
                let file = tokio::fs::File::open(&path).await?;
                let mut buffer = Vec::new();
                file.take(Self::MAX_READ_BYTES).read_to_end(&mut buffer).await?;
                ctx.progress.report(80);
                let content = String::from_utf8_lossy(&buffer).to_string();
                TaskOutput::success(
                    format!("Read {} bytes from {}", buffer.len(), Self::display(&root, &path)),
                    serde_json::json!({"path": Self::display(&root, &path), "content": content}),
                )
            }
            FileCommand::Stat(raw) => {
                let (root, path) = self.resolve(&raw).await?;
                let metadata = tokio::fs::metadata(&path).await?;
                let modified = metadata
                    .modified()
                    .ok()
                    .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
                ctx.progress.report(80);
                TaskOutput::success(
                    format!(
                        "{}: {} ({} bytes)",
                        Self::display(&root, &path),
                        if metadata.is_dir() { "directory" } else { "file" },
                        metadata.len()
                    ),
                    serde_json::json!({
                        "path": Self::display(&root, &path),
                        "is_dir": metadata.is_dir(),
                        "size": metadata.len(),
                        "modified": modified,
                    }),
                )
            }
        };
        output.quality_score = 0.9;
        Ok(output)
    }
}

// ---- voice ----

static AUDIO_EXTENSIONS: &[&str] = &["ogg", "oga", "opus", "mp3", "wav", "m4a", "webm", "flac"];

/// Validates a voice attachment or estimates the length of a text script
pub struct VoiceHandler;

impl VoiceHandler {
    const WORDS_PER_MINUTE: f64 = 150.0;
}

#[async_trait]
impl CapabilityHandler for VoiceHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Voice
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        ctx.progress.report(20);
        let media = ctx.task.media_url.as_deref().filter(|m| !m.trim().is_empty());

        let mut output = if let Some(media) = media {
            let format = match extension_of(media) {
                Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => ext,
                Some(ext) => {
                    return Err(HandlerError::InvalidInput(format!(
                        "unsupported audio format '.{}'",
                        ext
                    )))
                }
                None => "unknown".to_string(),
            };
            TaskOutput::success(
                format!("Voice attachment accepted ({})", format),
                serde_json::json!({"media": media, "format": format}),
            )
        } else {
            let words = ctx.task.content.split_whitespace().count();
            if words == 0 {
                return Err(HandlerError::InvalidInput(
                    "no audio attachment or script".into(),
                ));
            }
            let seconds = (words as f64 / Self::WORDS_PER_MINUTE * 60.0).ceil() as u64;
            TaskOutput::success(
                format!("Script of {} words, about {}s of speech", words, seconds),
                serde_json::json!({"words": words, "estimated_seconds": seconds}),
            )
        };
        ctx.progress.report(90);
        output.quality_score = 0.8;
        Ok(output)
    }
}

// ---- image ----

static IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"];

/// Validates an image reference and infers its format
pub struct ImageHandler;

#[async_trait]
impl CapabilityHandler for ImageHandler {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Image
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        let reference = ctx
            .task
            .media_url
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| extract_urls(&ctx.task.content).into_iter().next())
            .ok_or_else(|| HandlerError::InvalidInput("no image reference".into()))?;
        ctx.progress.report(40);

        let format = match extension_of(&reference) {
            Some(ext) if ext == "jpg" => "jpeg".to_string(),
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => ext,
            Some(ext) => {
                return Err(HandlerError::InvalidInput(format!(
                    "unsupported image format '.{}'",
                    ext
                )))
            }
            None => "unknown".to_string(),
        };
        ctx.progress.report(90);

        let mut output = TaskOutput::success(
            format!("Image accepted ({})", format),
            serde_json::json!({"reference": reference, "format": format}),
        );
        output.quality_score = 0.8;
        Ok(output)
    }
}
