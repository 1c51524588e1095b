//! Interactive console.
//! Lines typed at the prompt become tool calls: free text asks about the
//! current position, `white <q>`/`black <q>` force a side, `watch on|off`
//! toggles watching mode and `q` shuts the pipeline down.

use anyhow::Result;
use dialoguer::Input;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyzer::{Analyzer, Side};
use crate::bridge::{ToolCall, ToolResponse, handle_tool_call};
use crate::capture::FrameHub;
use crate::context::PipelineContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Tool(ToolCall),
    /// Stores a question without asking it.
    Pending(String),
    Quit,
    Empty,
}

pub fn parse_command(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match (head.to_ascii_lowercase().as_str(), rest.to_ascii_lowercase().as_str()) {
        ("q" | "quit" | "exit", "") => ConsoleCommand::Quit,
        ("watch", "on") => ConsoleCommand::Tool(ToolCall::StartWatchingMode),
        ("watch", "off") => ConsoleCommand::Tool(ToolCall::StopWatchingMode),
        ("pending", _) if !rest.is_empty() => ConsoleCommand::Pending(rest.to_string()),
        ("white", _) => ConsoleCommand::Tool(ToolCall::InspectCurrentPosition {
            query: rest.to_string(),
            side: Some(Side::White),
        }),
        ("black", _) => ConsoleCommand::Tool(ToolCall::InspectCurrentPosition {
            query: rest.to_string(),
            side: Some(Side::Black),
        }),
        _ => ConsoleCommand::Tool(ToolCall::InspectCurrentPosition {
            query: line.to_string(),
            side: None,
        }),
    }
}

fn print_response(response: &ToolResponse) {
    match response {
        ToolResponse::AnalysisReady { analysis, perspective, .. } => {
            println!("\n[{perspective}]\n{}", analysis.trim_end());
        }
        ToolResponse::NoAnalysis { message } => println!("{message}"),
        ToolResponse::WatchingModeStarted => println!("Watching mode ON"),
        ToolResponse::WatchingModeStopped => println!("Watching mode OFF"),
    }
}

/// Reads prompt lines on a blocking thread and answers them until `q`,
/// end of input, or cancellation.
pub async fn run_console(
    ctx: Arc<PipelineContext>,
    hub: FrameHub,
    analyzer: Arc<dyn Analyzer>,
    token: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<String>(8);
    tokio::task::spawn_blocking(move || {
        loop {
            let line = match Input::<String>::new().with_prompt("ask").allow_empty(true).interact_text() {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "console input closed");
                    break;
                }
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Ask about the position, 'white <q>' / 'black <q>', 'watch on|off', 'q' to quit.");
    loop {
        let line = tokio::select! {
            line = rx.recv() => line,
            _ = token.cancelled() => break,
        };
        let Some(line) = line else { break };

        match parse_command(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Quit => {
                info!("quit requested from console");
                token.cancel();
                break;
            }
            ConsoleCommand::Pending(query) => {
                ctx.set_pending_query(Some(query));
                println!("Question saved for the next analysis.");
            }
            ConsoleCommand::Tool(call) => {
                let response = handle_tool_call(call, &ctx, &hub, &analyzer).await;
                print_response(&response);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("  "), ConsoleCommand::Empty);
        assert_eq!(parse_command("q"), ConsoleCommand::Quit);
        assert_eq!(parse_command("Watch ON"), ConsoleCommand::Tool(ToolCall::StartWatchingMode));
        assert_eq!(parse_command("watch off"), ConsoleCommand::Tool(ToolCall::StopWatchingMode));
        assert_eq!(
            parse_command("black is the knight safe?"),
            ConsoleCommand::Tool(ToolCall::InspectCurrentPosition {
                query: "is the knight safe?".into(),
                side: Some(Side::Black),
            })
        );
        assert_eq!(
            parse_command("who is winning"),
            ConsoleCommand::Tool(ToolCall::InspectCurrentPosition {
                query: "who is winning".into(),
                side: None,
            })
        );
        assert_eq!(parse_command("pending best plan?"), ConsoleCommand::Pending("best plan?".into()));
    }

    #[test]
    fn test_quit_requires_bare_word() {
        assert!(matches!(parse_command("q what about e5"), ConsoleCommand::Tool(_)));
    }
}
