//! Autopilot Engine - Entry Point
//!
//! Reads one message per stdin line and feeds it to the engine:
//! - `sender:chat:text` or plain text (sender and chat default to `local`)
//! - lines starting with `/` are operator commands (`/status`, `/agents`)

use autopilot_engine::{ConsoleNotifier, Engine, EngineConfig, IngestEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const LOCAL: &str = "local";

/// `sender:chat:text` or plain text
fn parse_line(line: &str) -> Option<IngestEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let parts: Vec<&str> = line.splitn(3, ':').collect();
    let (sender, chat, text) = match parts.as_slice() {
        [sender, chat, text]
            if !sender.is_empty() && !chat.is_empty() && !sender.contains(char::is_whitespace) =>
        {
            (*sender, *chat, text.trim())
        }
        _ => (LOCAL, LOCAL, line),
    };

    if text.starts_with('/') {
        Some(IngestEvent::command(sender, chat, text))
    } else {
        Some(IngestEvent::text(sender, chat, text))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Autopilot Engine v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: autopilot [--help]");
        println!();
        println!("Reads messages from stdin, one per line:");
        println!("  sender:chat:text     message from a sender in a chat");
        println!("  text                 message from the local chat");
        println!("  /status, /agents     operator commands");
        println!();
        println!("Environment variables:");
        println!("  AUTOPILOT_CONFIG            TOML config file");
        println!("  OLLAMA_URL                  enable the LLM analyzer");
        println!("  AUTOPILOT_ANALYZER_MODEL    analyzer model (default: llama3.2:3b)");
        println!("  AUTOPILOT_EVENT_LOG         JSONL analytics log path");
        println!("  AUTOPILOT_OPERATOR_CHAT     chat for summaries and suggestions");
        println!("  AUTOPILOT_WORKSPACE         file-ops workspace root");
        println!("  AUTOPILOT_DEFAULT_LANGUAGE  default task language (default: en)");
        println!("  AUTOPILOT_MAX_IN_FLIGHT     global in-flight ceiling");
        println!("  AUTOPILOT_LOG_JSON=1        JSON logs on stderr");
        println!("  RUST_LOG                    log filter (default: info)");
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("AUTOPILOT_LOG_JSON").map(|v| v == "1").unwrap_or(false) {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Autopilot Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env()?;
    let engine = Arc::new(Engine::from_config(config, Arc::new(ConsoleNotifier))?);
    let handle = engine.start();
    let events = handle.sender();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Some(event) = parse_line(&line) {
                            if events.send(event).await.is_err() {
                                warn!("Intake loop is gone");
                                break;
                            }
                        }
                    }
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_engine::TaskKind;

    #[test]
    fn test_parse_line() {
        let event = parse_line("alice:chat-7:analyze sales: Q3").unwrap();
        assert_eq!(event.sender_id, "alice");
        assert_eq!(event.chat_id, "chat-7");
        assert_eq!(event.payload, "analyze sales: Q3");

        let plain = parse_line("summarize this text").unwrap();
        assert_eq!(plain.chat_id, LOCAL);
        assert_eq!(plain.kind, TaskKind::Text);

        let prose = parse_line("note to self: buy milk").unwrap();
        assert_eq!(prose.chat_id, LOCAL);
        assert_eq!(prose.payload, "note to self: buy milk");

        assert_eq!(parse_line("/status").unwrap().kind, TaskKind::Command);
        assert!(parse_line("   ").is_none());
    }
}
