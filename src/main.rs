use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate::{
    config, ledger::FileLedger, AccessGate, CallContext, CancelHandle, FaceResult, ImagePayload, ResidentId,
};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facegate")]
#[command(version, about = "Face recognition access control gate")]
struct Cli {
    /// Config file (defaults to the system config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a resident's face with the oracle
    Register {
        #[arg(short, long)]
        resident: String,
        /// Image file, or `-` to read base64 / a data URL from stdin
        image: String,
    },
    /// Check that a face belongs to the claimed resident
    Verify {
        #[arg(short, long)]
        resident: String,
        /// Image file, or `-` to read base64 / a data URL from stdin
        image: String,
    },
    /// Find whose face this is, if anyone's
    Identify {
        /// Image file, or `-` to read base64 / a data URL from stdin
        image: String,
    },
    /// Probe the recognition oracle
    Health,
    /// Show the latest audit ledger entries
    Log {
        #[arg(short, default_value_t = 10)]
        n: usize,
    },
    /// Open config file in editor
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let config_path = cli.config.as_deref();
    let cfg = config::load_config(config_path)?;

    match cli.command {
        Commands::Register { resident, image } => {
            let gate = AccessGate::from_config(&cfg)?;
            let image = read_image(&image)?;
            let result = gate
                .register_face(&ResidentId::from(resident), &image, &cancel_on_ctrl_c())
                .await?;
            report(&result);
            if !result.verified {
                anyhow::bail!("Enrollment failed: {}", result.decision.detail());
            }
            Ok(())
        }
        Commands::Verify { resident, image } => {
            let gate = AccessGate::from_config(&cfg)?;
            let image = read_image(&image)?;
            let result = gate
                .verify_face(&ResidentId::from(resident), &image, &cancel_on_ctrl_c())
                .await?;
            report(&result);
            if !result.verified {
                anyhow::bail!("Access denied: {}", result.decision.detail());
            }
            Ok(())
        }
        Commands::Identify { image } => {
            let gate = AccessGate::from_config(&cfg)?;
            let image = read_image(&image)?;
            let result = gate.find_face(&image, &cancel_on_ctrl_c()).await?;
            report(&result);
            if !result.found {
                anyhow::bail!("Access denied: {}", result.decision.detail());
            }
            Ok(())
        }
        Commands::Health => {
            let gate = AccessGate::from_config(&cfg)?;
            if gate.check_server_health(&cancel_on_ctrl_c()).await {
                info!("✓ Oracle at {} is healthy", cfg.oracle_url);
                Ok(())
            } else {
                anyhow::bail!("Oracle at {} is unavailable", cfg.oracle_url)
            }
        }
        Commands::Log { n } => show_log(&cfg.ledger_path, n),
        Commands::Config => open_config(config_path),
    }
}

/// A call context that is cancelled when the operator hits Ctrl+C.
fn cancel_on_ctrl_c() -> CallContext {
    let (handle, signal) = CancelHandle::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling oracle call");
            handle.cancel();
        }
    });
    CallContext::new().with_cancel(signal)
}

fn read_image(arg: &str) -> Result<ImagePayload> {
    if arg == "-" {
        let mut encoded = String::new();
        std::io::stdin()
            .read_to_string(&mut encoded)
            .context("reading image from stdin")?;
        return ImagePayload::from_base64(&encoded).context("decoding base64 image");
    }
    let bytes = std::fs::read(arg).with_context(|| format!("reading image {arg}"))?;
    Ok(ImagePayload::from_bytes(bytes))
}

fn report(result: &FaceResult) {
    let decision = &result.decision;
    info!(
        "{} {}: {} (confidence {:.2})",
        decision.outcome(),
        result
            .resident_id
            .as_ref()
            .map(|r| r.as_str())
            .unwrap_or("unknown"),
        decision.detail(),
        result.confidence
    );
    if let Some(error) = &result.error {
        warn!("{error}");
    }
}

fn show_log(path: &Path, n: usize) -> Result<()> {
    let entries = FileLedger::open(path)
        .and_then(|ledger| ledger.latest(n))
        .with_context(|| format!("reading ledger {}", path.display()))?;
    for entry in &entries {
        let who = match &entry.resident {
            Some(r) => format!("{} ({}, apt {})", r.name, r.id, r.apartment),
            None => entry
                .decision
                .resident_id()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
        };
        println!(
            "{}  {:<12} {:<10} {:<12} {:.2}  {}  {}",
            entry.recorded_at().format("%Y-%m-%d %H:%M:%S"),
            entry.access_point,
            entry.main_message,
            entry.decision.outcome(),
            entry.confidence,
            who,
            entry.decision.detail()
        );
    }
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
