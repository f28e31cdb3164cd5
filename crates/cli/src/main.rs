use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier chat agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config.json, workspace/SYSTEM.md).
    Init {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat with the agent on the console. Each line is a message addressed to the bot;
    /// scheduled messages are printed here when they fire.
    Chat {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Ollama model to use instead of agents.defaultModel.
        #[arg(long, short, value_name = "NAME")]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, model }) => {
            if let Err(e) = run_chat(config, model).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
            // The stdin reader thread may still be parked in a blocking read.
            std::process::exit(0);
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(courier::config::default_config_path);
    let dir = courier::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let (config, path) = courier::config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());
    courier::runtime::run_console(config, path, model).await
}
