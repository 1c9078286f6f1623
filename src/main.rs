#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use cartrita::config::Config;
use cartrita::gateway::{self, AppState};
use cartrita::observability::{self, runtime_trace};
use cartrita::{daemon, InProcessTransport, TaskRouter};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Cartrita - task routing and supervisor coordination.
#[derive(Parser, Debug)]
#[command(name = "cartrita")]
#[command(version)]
#[command(about = "Routes tasks to supervisor pools and correlates their results.", long_about = None)]
struct Cli {
    /// Configuration directory (default: $CARTRITA_CONFIG_DIR or ~/.cartrita)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket gateway only
    #[command(long_about = "\
Start the gateway server.

Serves the task API (/api/tasks), registry views and the supervisor \
WebSocket transport (/ws/supervisor). Bind address defaults to the \
values in your config file (gateway.host / gateway.port).

Examples:
  cartrita gateway                  # use config defaults
  cartrita gateway -p 8080          # listen on port 8080
  cartrita gateway -p 0             # random available port")]
    Gateway {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Start the long-running router (gateway + heartbeat monitor)
    #[command(long_about = "\
Start the long-running daemon.

Runs the gateway and, when [heartbeat] enabled = true, the supervisor \
staleness monitor. Components are restarted with exponential backoff \
if they fail. Ctrl+C fails any in-flight tasks and stops everything.

Examples:
  cartrita daemon                   # use config defaults
  cartrita daemon -p 9090           # gateway on port 9090
  cartrita daemon --host 127.0.0.1  # localhost only")]
    Daemon {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// List configured supervisor pools and task-type routes
    Supervisors,

    /// Show recorded runtime trace events
    #[command(long_about = "\
Show runtime trace events, newest first.

Events are only recorded when [observability] runtime_trace_mode is \
`rolling` or `full`.

Examples:
  cartrita trace
  cartrita trace --event routing_error
  cartrita trace --task 6f1c... --limit 5")]
    Trace {
        /// Maximum number of events to print
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only events of this type (e.g. task_routed, task_settled)
        #[arg(long)]
        event: Option<String>,

        /// Only events for this task id
        #[arg(long)]
        task: Option<String>,
    },

    /// Manage configuration
    #[command(long_about = "\
Manage Cartrita configuration.

Examples:
  cartrita config show                # effective TOML
  cartrita config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `cartrita`.

Examples:
  source <(cartrita completions bash)
  cartrita completions zsh > ~/.zfunc/_cartrita")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Completions stay stdout-only: no config, no logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    let config_dir = match cli.config_dir.as_deref() {
        Some(dir) if dir.trim().is_empty() => bail!("--config-dir cannot be empty"),
        Some(dir) => Some(PathBuf::from(dir)),
        None => None,
    };

    observability::init_tracing();

    let config = Config::load_or_init_in(config_dir.as_deref()).await?;
    runtime_trace::init_from_config(&config.observability, &config.workspace_dir);

    match cli.command {
        Commands::Completions { .. } => Ok(()),

        Commands::Gateway { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            info!("Starting Cartrita gateway on {host}:{port}");
            let transport = Arc::new(InProcessTransport::new());
            let router = TaskRouter::from_config(&config, transport.clone());
            let state = AppState::new(router, transport, config.gateway.clone());
            gateway::run_gateway(&host, port, state).await
        }

        Commands::Daemon { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            info!("Starting Cartrita daemon on {host}:{port}");
            daemon::run(config, host, port).await
        }

        Commands::Supervisors => {
            print_supervisors(&config);
            Ok(())
        }

        Commands::Trace { limit, event, task } => {
            let path = runtime_trace::resolve_trace_path(&config.observability, &config.workspace_dir);
            let query = runtime_trace::TraceQuery {
                limit,
                event_type: event,
                task_id: task,
            };
            let events = runtime_trace::load_events(&path, &query)
                .with_context(|| format!("Failed to read trace file {}", path.display()))?;
            if events.is_empty() {
                println!("No trace events recorded at {}", path.display());
                return Ok(());
            }
            for event in events {
                println!(
                    "{} {:<16} task={} supervisor={} {}",
                    event.timestamp,
                    event.event_type,
                    event.task_id.as_deref().unwrap_or("-"),
                    event.supervisor.as_deref().unwrap_or("-"),
                    event.message.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let rendered =
                    toml::to_string_pretty(&config).context("Failed to serialize config")?;
                println!("# {}", config.config_path.display());
                println!("{rendered}");
                Ok(())
            }
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&schema)
                        .context("Failed to serialize JSON Schema")?
                );
                Ok(())
            }
        },
    }
}

fn print_supervisors(config: &Config) {
    let router = TaskRouter::from_config(config, Arc::new(InProcessTransport::new()));
    let supervisors = router.get_supervisors();
    println!("Supervisor pools ({}):", supervisors.len());
    for record in &supervisors {
        println!(
            "  {:<14} type={:<13} capacity={:<3} {}",
            record.id, record.supervisor_type, record.max_concurrent_tasks, record.name,
        );
    }

    let routes = router.routes();
    println!();
    println!("Task routes ({}):", routes.len());
    for (task_type, target) in routes {
        let marker = if config.task_routes.contains_key(&task_type) {
            " (override)"
        } else {
            ""
        };
        println!("  {task_type:<28} -> {target}{marker}");
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
