use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Config, RawImage, Verifier};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall per-identity face verification CLI")]
struct Cli {
    /// TOML config file (ROLLCALL_* environment variables still apply)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train (or retrain) the classifier for an identity
    Train {
        /// Identity key, e.g. a roll number
        #[arg(short, long)]
        identity: String,
        /// Enrollment images: file paths or data URIs
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Check whether a probe image matches an identity
    Recognize {
        #[arg(short, long)]
        identity: String,
        /// Probe image: a file path, or a data URI starting with "data:"
        probe: String,
    },
    /// List identities with a trained model
    List,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Train { identity, images } => {
            let verifier = Verifier::new(&config)?;
            let images: Vec<RawImage> = images.iter().map(|s| RawImage::parse(s)).collect();
            if !verifier.train(&identity, &images) {
                bail!("training failed for {identity}; see log for the cause");
            }
            println!("trained {identity} from {} image(s)", images.len());
        }
        Commands::Recognize { identity, probe } => {
            let verifier = Verifier::new(&config)?;
            let decision = verifier
                .verify(&RawImage::parse(&probe), &identity)
                .with_context(|| format!("recognizing {identity}"))?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if !decision.is_match() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::List => {
            let verifier = Verifier::new(&config)?;
            let identities = verifier.registry().identities()?;
            if identities.is_empty() {
                println!("No identities trained");
            }
            for id in identities {
                println!("{id}");
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
