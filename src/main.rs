use clap::{Parser, Subcommand};
use revive::alarm_store::FileAlarmStore;
use revive::alarmd::AlarmDaemon;
use revive::config::ReviveConfig;
use revive::data_dir::DataDir;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Process-liveness watchdog: keeps a host application in the foreground and
/// brings it back after it crashes, hangs or is backgrounded.
#[derive(Parser, Debug)]
#[command(name = "revive", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "revive.toml", global = true)]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (timer fires, liveness transitions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver due alarms to the host, relaunching it when it is gone
    Alarmd {
        /// Poll interval in milliseconds (overrides config)
        #[arg(long)]
        poll_ms: Option<u64>,

        /// Host command to relaunch (overrides config)
        #[arg(long)]
        command: Option<String>,

        /// Arguments for the host command
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Run the interactive demo host under the watchdog
    Demo {
        /// Start with restarts disabled
        #[arg(long)]
        restart_disabled: bool,
    },
    /// Print pending alarms as JSON
    Status,
    /// Create the data directory with a default config
    Init,
    /// Run a command through the privileged shell and print its output
    Exec {
        /// Command line handed to the shell
        cmd: String,

        /// Kill the command after this many milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Apply CLI overrides on top of the loaded config.
fn resolve_config(cli: &Cli) -> Result<ReviveConfig, Box<dyn std::error::Error>> {
    let mut config = ReviveConfig::load(&cli.config)?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    match &cli.command {
        Command::Alarmd {
            poll_ms,
            command,
            args,
        } => {
            if let Some(ms) = poll_ms {
                config.alarmd.poll_interval_ms = *ms;
            }
            if let Some(command) = command {
                config.alarmd.command = Some(command.clone());
                config.alarmd.args = args.clone();
            }
        }
        Command::Demo { restart_disabled } => {
            if *restart_disabled {
                config.watchdog.restart_disabled = true;
            }
        }
        Command::Exec { timeout_ms, .. } => {
            if let Some(ms) = timeout_ms {
                config.exec.timeout_ms = *ms;
            }
        }
        Command::Status | Command::Init => {}
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = resolve_config(&cli)?;
    if cli.dry_run {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }
    let data_dir = DataDir::new(&config.storage.data_dir);

    match cli.command {
        Command::Alarmd { .. } => {
            AlarmDaemon::acquire(data_dir, config.alarmd)?.run().await?;
        }
        Command::Demo { .. } => revive::demo::run(config).await?,
        Command::Status => {
            let store = FileAlarmStore::open(data_dir.clone())?;
            let status = serde_json::json!({
                "data_dir": data_dir.root(),
                "alarms": store.pending()?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Init => {
            if data_dir.init()? {
                println!("initialized {}", data_dir.root().display());
            } else {
                println!("{} already exists", data_dir.root().display());
            }
        }
        Command::Exec { cmd, .. } => {
            let timeout = config.exec.timeout();
            let queue = revive_exec::ExecQueue::new(config.exec.shell, timeout);
            let output = queue.run_checked(&cmd).await?;
            print!("{output}");
        }
    }
    Ok(())
}
