//! Handlers behind each subcommand.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use strum::IntoEnumIterator;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{ConversationLoop, Session, TurnOutcome};
use crate::config::AppConfig;
use crate::error::{AicliError, Result};
use crate::provider::ProviderKind;
use crate::tools::{BuiltinSettings, ToolRegistry};
use crate::tunnel::{AuthMethod, TunnelManager, TunnelSpec, TunnelState};
use crate::util::retry::RetryPolicy;

use super::repl::{terminal_sink, SlashCommand, HELP};
use super::{AskArgs, ChatArgs, ConfigureArgs};

fn tool_registry(config: &AppConfig) -> Result<Arc<ToolRegistry>> {
    let cwd = std::env::current_dir()?;
    Ok(Arc::new(ToolRegistry::with_builtins(
        cwd,
        &BuiltinSettings::from(&config.agent),
    )))
}

async fn open_session(
    config_path: Option<&Path>,
    args: &ChatArgs,
    tunnels: Arc<TunnelManager>,
) -> Result<(Session, ConversationLoop)> {
    let mut config = AppConfig::load(config_path)?;
    let kind = args.provider.unwrap_or(config.default_provider);
    if let Some(model) = &args.model {
        config.set_model(kind, model);
    }
    let tools = tool_registry(&config)?;
    let runner = ConversationLoop::from_settings(&config.agent).with_event_sink(terminal_sink());
    let session = Session::open(kind, config, tools, tunnels).await?;
    Ok((session, runner))
}

/// Run one turn with Ctrl-C wired to the cancellation token.
async fn run_turn_interruptible(
    runner: &mut ConversationLoop,
    session: &mut Session,
    input: &str,
) -> Result<TurnOutcome> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    let outcome = runner.run_turn(session, input, &cancel).await;
    watcher.abort();
    outcome
}

fn report_error(err: &AicliError) {
    eprintln!("\nError: {err}");
    let hint = match err.recovery_suggestion() {
        crate::error::RecoverySuggestion::CheckCredentials => {
            Some("check the API key, then /provider to re-enable")
        }
        crate::error::RecoverySuggestion::CheckRemoteHost => {
            Some("check the SSH host, then /provider ollama to reconnect")
        }
        crate::error::RecoverySuggestion::RetryTurn => Some("send the message again to retry"),
        _ => None,
    };
    if let Some(hint) = hint {
        eprintln!("  ({hint})");
    }
}

pub async fn run_chat(config_path: Option<&Path>, args: ChatArgs) -> Result<()> {
    let tunnels = Arc::new(TunnelManager::default());
    let (mut session, mut runner) = open_session(config_path, &args, tunnels.clone()).await?;

    println!(
        "aicli: {} ({}). /help for commands.",
        session.kind(),
        session.adapter().model_id()
    );

    chat_repl(
        BufReader::new(tokio::io::stdin()),
        &mut session,
        &mut runner,
        &tunnels,
    )
    .await
}

/// Read lines from `input` until EOF, Ctrl-C or `/exit`. Tunnels are closed
/// however the loop ends; a failed read is returned after that.
async fn chat_repl<R: AsyncBufRead + Unpin>(
    input: R,
    session: &mut Session,
    runner: &mut ConversationLoop,
    tunnels: &TunnelManager,
) -> Result<()> {
    let mut lines = LinesStream::new(input.lines());
    let ended = loop {
        print!("\n> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => break Err(AicliError::from(e)),
            None => break Ok(()),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = SlashCommand::parse(input) {
            if !handle_slash(command, session, runner).await {
                break Ok(());
            }
            continue;
        }

        match run_turn_interruptible(runner, session, input).await {
            Ok(TurnOutcome::Completed) => println!(),
            Ok(TurnOutcome::IterationCapReached) => println!(),
            Ok(TurnOutcome::Interrupted) => eprintln!("\n[interrupted]"),
            Err(err) => report_error(&err),
        }
    };

    session.shutdown().await;
    tunnels.close_all().await;
    ended
}

/// Returns `false` when the REPL should exit.
async fn handle_slash(command: SlashCommand, session: &mut Session, runner: &ConversationLoop) -> bool {
    match command {
        SlashCommand::Help => println!("{HELP}"),
        SlashCommand::Clear => {
            session.clear();
            println!("Conversation cleared.");
        }
        SlashCommand::Provider(None) => {
            let names: Vec<String> = ProviderKind::iter().map(|k| k.to_string()).collect();
            println!("Current: {} ({})", session.kind(), session.adapter().model_id());
            println!("Available: {}", names.join(", "));
        }
        SlashCommand::Provider(Some(name)) => match name.parse::<ProviderKind>() {
            Ok(kind) => match session.switch_provider(kind).await {
                Ok(()) => println!("Switched to {} ({}).", kind, session.adapter().model_id()),
                Err(err) => report_error(&err),
            },
            Err(_) => println!("Unknown provider '{name}'. Try claude, chatgpt or ollama."),
        },
        SlashCommand::Status => {
            println!("Provider: {} ({})", session.kind(), session.adapter().model_id());
            println!("Messages: {}", session.conversation().len());
            println!("Loop state: {}", runner.state());
            if let Some(reason) = session.disabled_reason() {
                println!("Disabled: {reason}");
            }
            if let Some(tunnel) = session.tunnel() {
                let status = tunnel.status();
                println!("Tunnel: {} on {} [{}]", tunnel.spec(), tunnel.local_url(), status.state);
                if let Some(err) = status.last_error {
                    println!("  last error: {err}");
                }
            }
        }
        SlashCommand::Tools => {
            for schema in session.tools().schemas() {
                println!("{:<14} {}", schema.name, schema.description);
            }
        }
        SlashCommand::Exit => return false,
        SlashCommand::Unknown(name) => println!("Unknown command /{name}. /help lists commands."),
    }
    true
}

pub async fn run_ask(config_path: Option<&Path>, args: AskArgs) -> Result<()> {
    let tunnels = Arc::new(TunnelManager::default());
    let (mut session, mut runner) = open_session(config_path, &args.session, tunnels.clone()).await?;

    let outcome = run_turn_interruptible(&mut runner, &mut session, &args.prompt_text()).await;
    println!();
    session.shutdown().await;
    tunnels.close_all().await;

    match outcome? {
        TurnOutcome::Interrupted => Err(AicliError::InvalidState("interrupted".into())),
        _ => Ok(()),
    }
}

/// Apply the given flags to the config file without touching anything else.
pub fn apply_configure(config: &mut AppConfig, args: ConfigureArgs) {
    if let Some(kind) = args.default_provider {
        config.default_provider = kind;
    }

    let providers = &mut config.providers;
    if let Some(key) = args.anthropic_api_key {
        providers.claude.api_key = Some(key);
    }
    if let Some(model) = args.claude_model {
        providers.claude.model = model;
    }
    if let Some(key) = args.openai_api_key {
        providers.chatgpt.api_key = Some(key);
    }
    if let Some(model) = args.chatgpt_model {
        providers.chatgpt.model = model;
    }
    if let Some(url) = args.ollama_url {
        providers.ollama.base_url = url;
    }
    if let Some(model) = args.ollama_model {
        providers.ollama.model = model;
    }

    if args.no_tunnel {
        providers.ollama.tunnel = None;
        return;
    }

    let tunnel = match (providers.ollama.tunnel.take(), args.tunnel_host) {
        (_, Some(host)) => Some(TunnelSpec::builder().host(host).build()),
        (existing, None) => existing,
    };
    providers.ollama.tunnel = tunnel.map(|mut spec| {
        if let Some(user) = args.tunnel_user {
            spec.user = Some(user);
        }
        if let Some(port) = args.tunnel_ssh_port {
            spec.ssh_port = port;
        }
        if let Some(path) = args.tunnel_key {
            spec.auth = AuthMethod::KeyFile { path };
        }
        if let Some(port) = args.tunnel_local_port {
            spec.local_port = Some(port);
        }
        if let Some(port) = args.tunnel_remote_port {
            spec.remote_port = port;
        }
        spec
    });
}

pub fn run_configure(config_path: Option<&Path>, args: ConfigureArgs) -> Result<()> {
    let path = AppConfig::resolve_path(config_path);
    // Load without env overrides so keys from the environment are not persisted.
    let mut config = AppConfig::load_from_path(&path)?;
    apply_configure(&mut config, args);
    config.save_to_path(&path)?;
    println!("Saved {}", path.display());
    Ok(())
}

pub async fn run_status(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let tools = tool_registry(&config)?;
    let tunnels = Arc::new(TunnelManager::default());
    let retry = RetryPolicy::default();

    println!("Config: {}", AppConfig::resolve_path(config_path).display());
    println!("Default provider: {}", config.default_provider);
    println!();

    let mut sessions = Vec::new();
    for kind in ProviderKind::iter() {
        let model = config.model_for(kind);
        if !config.is_configured(kind) {
            println!("  {kind:<8} {model:<28} not configured");
            continue;
        }
        let session = match Session::open(kind, config.clone(), tools.clone(), tunnels.clone()).await {
            Ok(session) => session,
            Err(err) => {
                println!("  {kind:<8} {model:<28} FAILED: {err}");
                continue;
            }
        };
        let adapter = session.adapter().clone();
        match retry.execute(|| adapter.validate()).await {
            Ok(()) => println!("  {kind:<8} {model:<28} ok"),
            Err(err) => println!("  {kind:<8} {model:<28} FAILED: {err}"),
        }
        sessions.push(session);
    }

    let mcp = &config.providers.claude.mcp_servers;
    if !mcp.is_empty() {
        println!("\nMCP servers (listed only):");
        for server in mcp {
            println!("  {:<12} {} {}", server.name, server.command, server.args.join(" "));
        }
    }

    let open = tunnels.list().await;
    if !open.is_empty() {
        println!("\nTunnels:");
        for row in open {
            println!("  {} on 127.0.0.1:{} [{}]", row.spec, row.local_port, row.status.state);
        }
    }

    for mut session in sessions {
        session.shutdown().await;
    }
    tunnels.close_all().await;
    Ok(())
}

pub async fn run_tunnel(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let spec = config.providers.ollama.tunnel.clone().ok_or_else(|| {
        AicliError::Configuration("no [providers.ollama.tunnel] section configured".into())
    })?;

    let tunnels = TunnelManager::default();
    let handle = tunnels.open(spec).await?;
    println!("Tunnel open: {} -> {}", handle.spec(), handle.local_url());
    println!("Press Ctrl-C to close.");

    let mut endpoint = handle.endpoint();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            status = endpoint.changed() => {
                let Some(status) = status else { break };
                match status.last_error {
                    Some(err) => println!("tunnel {}: {err}", status.state),
                    None => println!("tunnel {}", status.state),
                }
                if status.state == TunnelState::Error {
                    break;
                }
            }
        }
    }

    tunnels.close(&handle).await;
    Ok(())
}
