mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use workoclock_core::Config;
use workoclock_storage::PresetStore;

use commands::{
    init::init_command,
    preset::{handle_preset_command, PresetAction},
    service::{ping, run_foreground, run_service_process, show_status, start_service, stop_service},
};

#[derive(Parser)]
#[command(name = "workoclock", version)]
#[command(about = "Schedule-based application blocking presets", long_about = None)]
struct Cli {
    /// Data directory holding config.toml, presets and logs
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize workoclock (first-time setup)
    Init,
    /// Manage blocking presets
    Preset {
        #[command(subcommand)]
        action: PresetAction,
    },
    /// Start the enforcement service in the background
    Start,
    /// Enforce presets in the foreground until Ctrl-C
    Run,
    /// Stop the background enforcement service
    Stop {
        /// Kill the service if it does not stop in time
        #[arg(short, long)]
        force: bool,
    },
    /// Check service status and active presets
    Status,
    /// Check that the enforcement service answers
    Ping,
    /// (Internal) Run the enforcement process
    #[command(name = "service-internal-start", hide = true)]
    ServiceInternalStart {
        #[arg(default_value = "")]
        argument: String,
    },
}

fn load_config(data_dir: Option<&Path>) -> Result<Config> {
    match data_dir {
        Some(dir) => Config::load_from_dir(dir),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The detached process logs to a file instead.
    if !matches!(cli.command, Commands::ServiceInternalStart { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let config = || load_config(cli.data_dir.as_deref());

    match cli.command {
        Commands::Init => init_command(&config()?),
        Commands::Preset { action } => {
            let store = PresetStore::open(config()?.presets_path())?;
            handle_preset_command(action, &store)
        }
        Commands::Start => start_service(&config()?).await,
        Commands::Run => run_foreground(&config()?).await,
        Commands::Stop { force } => stop_service(&config()?, force).await,
        Commands::Status => show_status(&config()?).await,
        Commands::Ping => ping(&config()?).await,
        Commands::ServiceInternalStart { argument } => run_service_process(&argument).await,
    }
}
