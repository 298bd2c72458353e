use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use lapsecam::app::{capture_once, run_focus_session, App, Components};
use lapsecam::config::{redacted_lines, ConfigStore};

/// lapsecam: time-lapse camera appliance
#[derive(Parser)]
#[command(name = "lapsecam")]
#[command(version, about = "Time-lapse camera appliance controller")]
#[command(after_help = "EXAMPLES:
    # Run the appliance with the default config
    lapsecam

    # One capture, then exit
    lapsecam capture --config /etc/lapsecam/config.toml

    # Two minutes of crosshair preview frames for focusing
    lapsecam focus --duration 120

    # Pipe the focus preview as MJPEG to another program
    lapsecam focus --mjpeg | my-mjpeg-server

    # Show the effective configuration
    lapsecam check-config")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, streaming and signal handlers (default)
    Run {
        /// Path to config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Take one still and exit
    Capture {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Write crosshair preview frames to focus.preview_path
    Focus {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Session length in seconds
        #[arg(short, long, default_value_t = 60)]
        duration: u64,
        /// Write a multipart MJPEG stream to stdout instead
        #[arg(long)]
        mjpeg: bool,
    },
    /// Validate and print the configuration with secrets masked
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let default = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "{} {:<5} [{}] {}",
                buf.timestamp_millis(),
                record.level(),
                thread.name().unwrap_or("worker"),
                record.args()
            )
        })
        .init();
}

fn open_config(path: Option<PathBuf>) -> Arc<ConfigStore> {
    match ConfigStore::open(path.as_deref()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    }
}

async fn load_components(config: Arc<ConfigStore>) -> Components {
    match Components::load(config).await {
        Ok(components) => components,
        Err(e) => {
            log::error!("CRITICAL: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    // .env is optional; existing variables win
    let _ = dotenv::dotenv();
    init_logging();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run { config: None });

    let code = match command {
        Commands::Run { config } => {
            let store = open_config(config);
            runtime().block_on(async move {
                let components = load_components(store).await;
                App::new(components).run().await
            })
        }
        Commands::Capture { config } => {
            let store = open_config(config);
            runtime().block_on(async move {
                let components = load_components(store).await;
                capture_once(components).await
            })
        }
        Commands::Focus {
            config,
            duration,
            mjpeg,
        } => {
            let store = open_config(config);
            runtime().block_on(async move {
                let components = load_components(store).await;
                let session = tokio::task::spawn_blocking(move || {
                    let duration = Duration::from_secs(duration);
                    if mjpeg {
                        let mut stdout = std::io::stdout().lock();
                        run_focus_session(&components, duration, Some(&mut stdout))
                    } else {
                        run_focus_session(&components, duration, None)
                    }
                })
                .await;
                match session {
                    Ok(Ok(frames)) => {
                        log::info!("Focus session wrote {} frames", frames);
                        0
                    }
                    Ok(Err(e)) => {
                        log::error!("Focus session failed: {}", e);
                        1
                    }
                    Err(e) => {
                        log::error!("CRITICAL: focus session crashed: {}", e);
                        1
                    }
                }
            })
        }
        Commands::CheckConfig { config } => {
            let store = open_config(config);
            for line in redacted_lines(&store.get()) {
                println!("{}", line);
            }
            println!("Configuration OK");
            0
        }
    };
    std::process::exit(code);
}
