//! toolhost CLI: manage, start and call MCP tool servers.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use toolhost_config::{BuiltinId, HostConfig, ServerDefinition, ServerPatch, parse_install_request};
use toolhost_core::ToolInvocationService;
use toolhost_mcp::{McpClient, ServerProcessManager};
use toolhost_permissions::Capability;
use toolhost_types::{EventBus, GenericToolCall, HostEvent};

#[derive(Parser)]
#[command(name = "toolhost", version, about = "Start, inspect and call MCP tool servers")]
struct Cli {
    /// Config directory (overrides TOOLHOST_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configured servers
    #[command(subcommand)]
    Servers(ServersCommand),
    /// Start a server and keep it running until Ctrl-C
    Start { name: String },
    /// List the default server's tools
    Tools,
    /// Call a tool on the default server
    Call {
        tool: String,
        /// JSON object with the tool arguments
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Read a resource
    Read {
        uri: String,
        /// Server to read from (defaults to the default server)
        #[arg(long)]
        server: Option<String>,
    },
    /// Install servers from a JSON install request
    Install { file: PathBuf },
}

#[derive(Subcommand)]
enum ServersCommand {
    /// List configured servers
    List,
    /// Add or replace a server
    Add(AddArgs),
    /// Remove a server, stopping it first
    Remove { name: String },
    /// Select the default server
    Default { name: String },
    /// Enable a server
    Enable { name: String },
    /// Disable a server
    Disable { name: String },
}

#[derive(Args)]
struct AddArgs {
    name: String,
    /// Command to spawn
    #[arg(long, conflicts_with_all = ["builtin", "url"])]
    command: Option<String>,
    /// Command argument (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Environment override as KEY=VALUE (repeatable)
    #[arg(long = "env")]
    env: Vec<String>,
    /// Working directory for the process
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Built-in server to run in-process (filesystem or prompts)
    #[arg(long, conflicts_with = "url")]
    builtin: Option<String>,
    /// Base URL of a remote server
    #[arg(long)]
    url: Option<String>,
    /// Approval: read, write or all (repeatable)
    #[arg(long = "approve")]
    approvals: Vec<String>,
    #[arg(long)]
    description: Option<String>,
    /// Readiness phrase replacing the built-in ones
    #[arg(long)]
    ready_phrase: Option<String>,
    /// Also make this the default server
    #[arg(long)]
    default: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let host = match &cli.config_dir {
        Some(dir) => HostConfig::load_from(dir.clone()),
        None => HostConfig::load(),
    };

    // Set up logging
    let fallback = if cli.verbose {
        "debug".to_string()
    } else {
        host.log_filter.clone().unwrap_or_else(|| "warn".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&fallback)),
        )
        .with_writer(io::stderr)
        .init();

    tracing::debug!(config_dir = %host.config_dir.display(), "loaded host config");

    let events = EventBus::new();
    let config = Arc::new(host.open_store(events.clone()));
    let manager = ServerProcessManager::new(Arc::clone(&config), events);
    let service = ToolInvocationService::new(config, manager);

    let result = run(cli.command, &service).await;
    service.shutdown().await;
    result
}

async fn run(command: Commands, service: &ToolInvocationService) -> Result<()> {
    match command {
        Commands::Servers(cmd) => servers(cmd, service).await,
        Commands::Start { name } => start(&name, service).await,
        Commands::Tools => {
            let tools = service.list_all_tools().await?;
            for tool in tools {
                println!("{}  {}", tool.function.name, tool.function.description);
            }
            Ok(())
        }
        Commands::Call { tool, arguments } => {
            let parsed: serde_json::Value =
                serde_json::from_str(&arguments).context("Tool arguments must be valid JSON")?;
            if !parsed.is_object() {
                bail!("Tool arguments must be a JSON object");
            }
            let call = GenericToolCall::new("", tool, arguments);
            let result = service.invoke(&call).await;
            if result.is_error {
                bail!("{}", result.content);
            }
            println!("{}", result.content);
            Ok(())
        }
        Commands::Read { uri, server } => {
            let server = match server {
                Some(server) => server,
                None => service
                    .config()
                    .default_server()
                    .context("No default server is selected")?,
            };
            service.manager().start(&server).await?;
            let client = McpClient::new(
                server,
                Arc::clone(service.config()),
                service.manager().clone(),
            );
            let contents = client.read_resource(&uri).await?;
            println!("{}", contents.text);
            Ok(())
        }
        Commands::Install { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let request = parse_install_request(&text)?;
            let outcome = service.install(request);
            for (name, definition) in &outcome.accepted {
                println!("installed {name} ({})", definition.kind.transport().as_str());
            }
            for rejection in &outcome.rejected {
                eprintln!("rejected {}: {}", rejection.name, rejection.reason);
            }
            if outcome.accepted.is_empty() && !outcome.rejected.is_empty() {
                bail!("no servers were installed");
            }
            Ok(())
        }
    }
}

async fn servers(cmd: ServersCommand, service: &ToolInvocationService) -> Result<()> {
    let config = service.config();
    match cmd {
        ServersCommand::List => {
            let set = config.get();
            if set.servers.is_empty() {
                println!("No servers configured ({})", config.path().display());
                return Ok(());
            }
            let default = set.default_server();
            for (name, definition) in &set.servers {
                let marker = if Some(name.as_str()) == default { "*" } else { " " };
                let approvals: Vec<String> =
                    definition.approvals.iter().map(|a| a.to_string()).collect();
                let state = if definition.enabled { "" } else { " (disabled)" };
                println!(
                    "{marker} {name}  [{}]  approvals: {}{state}  {}",
                    definition.kind.transport().as_str(),
                    if approvals.is_empty() {
                        "none".to_string()
                    } else {
                        approvals.join(",")
                    },
                    definition.description,
                );
            }
        }
        ServersCommand::Add(args) => {
            let name = args.name.clone();
            let make_default = args.default;
            let definition = definition_from_args(args)?;
            config.upsert(&name, definition)?;
            if make_default {
                config.set_default(&name)?;
            }
            println!("Saved server '{name}'");
        }
        ServersCommand::Remove { name } => {
            if service.remove_server(&name).await? {
                println!("Removed server '{name}'");
            } else {
                bail!("Server '{name}' is not configured");
            }
        }
        ServersCommand::Default { name } => {
            config.set_default(&name)?;
            println!("Default server is now '{name}'");
        }
        ServersCommand::Enable { name } => set_enabled(service, &name, true)?,
        ServersCommand::Disable { name } => set_enabled(service, &name, false)?,
    }
    Ok(())
}

fn set_enabled(service: &ToolInvocationService, name: &str, enabled: bool) -> Result<()> {
    let patch = ServerPatch {
        enabled: Some(enabled),
        ..ServerPatch::default()
    };
    service.config().patch(name, patch)?;
    println!(
        "Server '{name}' {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn start(name: &str, service: &ToolInvocationService) -> Result<()> {
    let mut events = service.events().subscribe();
    service.manager().start(name).await?;
    let info = service
        .manager()
        .running()
        .into_iter()
        .find(|info| info.name == name);
    match info.and_then(|info| info.pid) {
        Some(pid) => println!("Server '{name}' running (pid {pid}). Press Ctrl-C to stop."),
        None => println!("Server '{name}' running in-process. Press Ctrl-C to stop."),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(HostEvent::ServerStatusChanged { name: ref n, exit_code, unexpected: true, .. })
                    if n == name =>
                {
                    bail!("Server '{name}' exited unexpectedly (code {exit_code:?})");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn definition_from_args(args: AddArgs) -> Result<ServerDefinition> {
    let mut definition = match (args.command, args.builtin, args.url) {
        (Some(command), None, None) => ServerDefinition::spawned(command, args.args),
        (None, Some(builtin), None) => {
            let id = BuiltinId::from_name(&builtin)
                .with_context(|| format!("Unknown built-in server '{builtin}'"))?;
            let mut definition = ServerDefinition::in_memory(id);
            definition.args = args.args;
            definition
        }
        (None, None, Some(url)) => ServerDefinition::remote(url),
        (None, None, None) => match BuiltinId::from_name(&args.name) {
            Some(id) => ServerDefinition::in_memory(id),
            None => bail!("Pass one of --command, --builtin or --url"),
        },
        _ => bail!("--command, --builtin and --url are mutually exclusive"),
    };

    definition.env = parse_env(&args.env)?;
    definition.cwd = args.cwd;
    definition.ready_phrase = args.ready_phrase;
    if let Some(description) = args.description {
        definition.description = description;
    }
    definition.approvals = args
        .approvals
        .iter()
        .map(|a| parse_capability(a))
        .collect::<Result<_>>()?;
    Ok(definition)
}

fn parse_capability(value: &str) -> Result<Capability> {
    match value.trim().to_ascii_lowercase().as_str() {
        "read" => Ok(Capability::Read),
        "write" => Ok(Capability::Write),
        "all" => Ok(Capability::All),
        other => bail!("Unknown approval '{other}' (expected read, write or all)"),
    }
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got '{pair}'"))?;
            if key.is_empty() {
                bail!("Empty variable name in '{pair}'");
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
