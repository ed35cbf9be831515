//! REPL slash commands and terminal rendering of loop events.

use std::io::Write;
use std::sync::Arc;

use crate::agent_loop::{LoopEvent, LoopEventSink};
use crate::util::text::truncate_utf8;

const RESULT_PREVIEW_BYTES: usize = 200;

pub const HELP: &str = "\
Commands:
  /help              show this help
  /clear             start a fresh conversation
  /provider [name]   show or switch the provider (claude, chatgpt, ollama)
  /status            provider, model, tunnel and conversation size
  /tools             list the tools the model can call
  /exit              quit
Ctrl-C interrupts a running turn; at the prompt it quits.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Clear,
    Provider(Option<String>),
    Status,
    Tools,
    Exit,
    Unknown(String),
}

impl SlashCommand {
    /// `None` when the line is a prompt rather than a command.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix('/')?;
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();
        let arg = words.next().map(str::to_string);
        Some(match name.as_str() {
            "help" | "?" => Self::Help,
            "clear" => Self::Clear,
            "provider" => Self::Provider(arg),
            "status" => Self::Status,
            "tools" => Self::Tools,
            "exit" | "quit" => Self::Exit,
            _ => Self::Unknown(name),
        })
    }
}

/// Streams assistant text to stdout and tool activity to stderr.
pub fn terminal_sink() -> LoopEventSink {
    Arc::new(|event: LoopEvent| match event {
        LoopEvent::AssistantDelta { text } => {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{text}");
            let _ = stdout.flush();
        }
        LoopEvent::ToolCallStarted { call } => {
            eprintln!("\n-> {}({})", call.name, call.arguments_value());
        }
        LoopEvent::ToolResult { result } => {
            let text = result.model_text();
            let preview = truncate_utf8(&text, RESULT_PREVIEW_BYTES);
            let ellipsis = if preview.len() < text.len() { "..." } else { "" };
            let marker = if result.is_error() { "!!" } else { "<-" };
            eprintln!("{marker} {}{ellipsis}", preview.replace('\n', " | "));
        }
        LoopEvent::Notice { message } => eprintln!("\n[{message}]"),
        LoopEvent::StateChanged { .. } | LoopEvent::Failed { .. } => {}
    })
}
