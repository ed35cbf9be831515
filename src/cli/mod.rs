//! Command-line interface for aicli.

pub mod commands;
pub mod repl;

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::provider::ProviderKind;

/// Chat with Claude, ChatGPT or Ollama, with local file and shell tools.
#[derive(Parser, Debug)]
#[command(name = "aicli", version, about)]
pub struct Cli {
    /// Config file (defaults to $AICLI_CONFIG, then ~/.aicli/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log aicli internals to stderr (-v debug, -vv everything)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat session
    Chat(ChatArgs),
    /// Ask a single question and exit
    Ask(AskArgs),
    /// Write provider settings to the config file
    Configure(ConfigureArgs),
    /// Check every configured provider
    Status,
    /// Open the Ollama SSH tunnel and keep it up until Ctrl-C
    Tunnel,
}

#[derive(Args, Debug, Default)]
pub struct ChatArgs {
    /// claude, chatgpt or ollama (defaults to `default_provider`)
    #[arg(short, long)]
    pub provider: Option<ProviderKind>,

    /// Model override for this session
    #[arg(short, long)]
    pub model: Option<String>,
}

#[derive(Args, Debug)]
pub struct AskArgs {
    #[command(flatten)]
    pub session: ChatArgs,

    /// The prompt
    #[arg(required = true, num_args = 1..)]
    pub prompt: Vec<String>,
}

impl AskArgs {
    pub fn prompt_text(&self) -> String {
        self.prompt.join(" ")
    }
}

#[derive(Args, Debug, Default)]
pub struct ConfigureArgs {
    /// Provider used when none is given on the command line
    #[arg(long)]
    pub default_provider: Option<ProviderKind>,

    #[arg(long)]
    pub anthropic_api_key: Option<String>,
    #[arg(long)]
    pub claude_model: Option<String>,

    #[arg(long)]
    pub openai_api_key: Option<String>,
    #[arg(long)]
    pub chatgpt_model: Option<String>,

    #[arg(long)]
    pub ollama_url: Option<String>,
    #[arg(long)]
    pub ollama_model: Option<String>,

    /// SSH host that runs Ollama; enables the tunnel
    #[arg(long)]
    pub tunnel_host: Option<String>,
    #[arg(long)]
    pub tunnel_user: Option<String>,
    #[arg(long)]
    pub tunnel_ssh_port: Option<u16>,
    /// Private key used for the SSH connection
    #[arg(long)]
    pub tunnel_key: Option<PathBuf>,
    /// Local port to forward from (free port if omitted)
    #[arg(long)]
    pub tunnel_local_port: Option<u16>,
    #[arg(long)]
    pub tunnel_remote_port: Option<u16>,

    /// Remove the Ollama tunnel settings
    #[arg(long, conflicts_with = "tunnel_host")]
    pub no_tunnel: bool,
}
