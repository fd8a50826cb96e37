//! Message Formatting
//!
//! HTML renderings of acknowledgments, outcomes, suggestions, summaries and
//! status tables sent through the notification channel.

use std::time::Duration;

use crate::engine::EngineSnapshot;
use crate::feedback::{ErrorPattern, PerformanceSummary};
use crate::registry::AgentStatus;
use crate::task::{Task, TaskStatus};

/// Acknowledgment sent right after intake
pub fn format_ack(task: &Task) -> String {
    let mut msg = format!(
        "<b>Task received</b>\nID: <code>{}</code>\nPriority: {}\n",
        html_escape(&task.id),
        task.priority.as_str()
    );
    if let Some(analysis) = &task.analysis {
        msg.push_str(&format!(
            "Category: {} ({:.0}% confidence)\nComplexity: {}",
            analysis.category.as_str(),
            analysis.confidence * 100.0,
            analysis.complexity.as_str()
        ));
        if analysis.degraded {
            msg.push_str("\n<i>Classifier unavailable, using default routing</i>");
        }
    }
    msg
}

/// Final result of a task
pub fn format_outcome(task: &Task) -> String {
    let mut msg = String::new();
    match task.status {
        TaskStatus::Completed => msg.push_str("<b>Task completed</b>\n\n"),
        TaskStatus::Timeout => msg.push_str("<b>Task timed out</b>\n\n"),
        _ => msg.push_str("<b>Task failed</b>\n\n"),
    }

    if let Some(result) = &task.result {
        msg.push_str(&html_escape(&truncate(&result.message, 800)));
        msg.push_str("\n\n");
    }
    if let Some(error) = &task.error {
        msg.push_str(&format!("<b>Error:</b> {}\n\n", html_escape(&truncate(error, 300))));
    }

    if let Some(agent) = task.executing_agent.as_deref().or(task.assigned_agent.as_deref()) {
        msg.push_str(&format!("Agent: <code>{}</code>\n", html_escape(agent)));
    }
    if let Some(ms) = task.duration_ms {
        msg.push_str(&format!("Duration: {}\n", format_duration(Duration::from_millis(ms))));
    }
    if let Some(result) = &task.result {
        msg.push_str(&format!("Quality: {:.0}%", result.quality_score * 100.0));
    }
    msg.trim_end().to_string()
}

/// Suggestion sent when satisfaction is low
pub fn format_improvement_suggestion(task: &Task, satisfaction: f64) -> String {
    let mut msg = format!(
        "<b>Improvement suggestion</b>\nTask <code>{}</code> scored {:.1}/10.\n",
        html_escape(&task.id),
        satisfaction
    );
    let hint = task
        .error
        .as_deref()
        .and_then(error_hint)
        .unwrap_or("Try rephrasing the request with more specific details.");
    msg.push_str(&format!("\n<b>Hint:</b> {}", html_escape(hint)));
    msg
}

/// Supplementary note for high-complexity tasks
pub fn format_complex_analysis(task: &Task, satisfaction: f64) -> String {
    let (intent, caps) = task
        .analysis
        .as_ref()
        .map(|a| {
            (
                a.intent.clone(),
                a.required_capabilities
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        })
        .unwrap_or_default();
    format!(
        "<b>Complex task analysis</b>\nIntent: {}\nCapabilities: {}\nOutcome: {} (satisfaction {:.1}/10)\n\nConsider splitting similar requests into smaller steps.",
        html_escape(&intent),
        html_escape(&caps),
        task.status.as_str(),
        satisfaction
    )
}

/// Operator-facing notice for a recurring error signature
pub fn format_recurring_error(pattern: &ErrorPattern) -> String {
    let agents: Vec<&str> = pattern.affected_agents.iter().map(String::as_str).collect();
    format!(
        "<b>Recurring error</b> ({} occurrences)\n<code>{}</code>\nAgents: {}\n\n<b>Suggestion:</b> {}",
        pattern.count,
        html_escape(&truncate(&pattern.signature, 200)),
        html_escape(&agents.join(", ")),
        html_escape(error_hint(&pattern.signature).unwrap_or("Investigate the affected agents.")),
    )
}

/// Periodic performance summary
pub fn format_summary(summary: &PerformanceSummary) -> String {
    format!(
        "<b>Performance summary</b>\nTasks: {} ({} succeeded)\nSuccess rate: {:.1}%\nAvg response: {}\nAvg satisfaction: {:.1}/10\nTop agent: {}",
        summary.total_tasks,
        summary.successful_tasks,
        summary.success_rate * 100.0,
        format_duration(Duration::from_millis(summary.average_response_time_ms.round() as u64)),
        summary.average_satisfaction,
        summary.top_agent.as_deref().unwrap_or("-"),
    )
}

/// `/status` reply
pub fn format_status(snapshot: &EngineSnapshot) -> String {
    let mut msg = format!(
        "<b>Engine status</b>\nQueue depth: {}\nActive executions: {}\n\n",
        snapshot.queue_depth, snapshot.active_executions
    );
    msg.push_str(&format_agents(snapshot));
    msg.push_str("\n\n");
    msg.push_str(&format_summary(&snapshot.performance));
    msg
}

/// `/agents` reply
pub fn format_agents(snapshot: &EngineSnapshot) -> String {
    let mut msg = String::from("<b>Agents</b>\n");
    for row in &snapshot.agents {
        let marker = match row.status {
            AgentStatus::Online => "on",
            AgentStatus::Offline => "off",
        };
        msg.push_str(&format!(
            "<code>{}</code> [{}] {}/{} eff {:.2} ({} tasks)\n",
            html_escape(&row.name),
            marker,
            row.load,
            row.max_concurrency,
            row.effective_efficiency,
            row.total_tasks
        ));
    }
    msg.trim_end().to_string()
}

/// Map a known error shape to an actionable hint
pub fn error_hint(error: &str) -> Option<&'static str> {
    let lower = error.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        return Some("The operation took too long. Try a smaller or simpler request.");
    }
    if lower.contains("no url") {
        return Some("Include the full link (https://...) you want fetched.");
    }
    if lower.contains("outside the workspace") || lower.contains("permission denied") {
        return Some("Only files inside the configured workspace can be accessed.");
    }
    if lower.contains("not found") {
        return Some("Check that the referenced file or resource exists.");
    }
    if lower.contains("parse") || lower.contains("invalid input") {
        return Some("The input format was not recognised. Send plain CSV or JSON.");
    }
    if lower.contains("http") || lower.contains("connection") {
        return Some("The remote service could not be reached. Try again later.");
    }
    None
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Truncate to `max` characters, appending an ellipsis
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
