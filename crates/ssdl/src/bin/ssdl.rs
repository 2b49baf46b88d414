//! ssdl CLI

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

use ssdl::{config::PredictionMode, Analysis, AnalysisConfig, AnalysisYields};

#[derive(Parser)]
#[command(name = "ssdl")]
#[command(about = "Data-driven fake-lepton background for same-sign dilepton searches")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: LevelFilter,

    /// Analysis configuration (TOML). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read every sample and write the same-sign and opposite-sign yields
    Accumulate {
        /// Sample list (TOML with [[sample]] tables)
        #[arg(short, long)]
        samples: PathBuf,

        /// Output file for the yields (JSON)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Predict the background from previously accumulated yields
    Predict {
        /// Sample list (TOML with [[sample]] tables)
        #[arg(short, long)]
        samples: PathBuf,

        /// Yields written by `accumulate`
        #[arg(short, long)]
        yields: PathBuf,

        #[command(flatten)]
        options: PredictOptions,
    },

    /// Accumulate and predict in one go
    Run {
        /// Sample list (TOML with [[sample]] tables)
        #[arg(short, long)]
        samples: PathBuf,

        /// Also write the yields (JSON)
        #[arg(long)]
        save_yields: Option<PathBuf>,

        #[command(flatten)]
        options: PredictOptions,
    },

    /// List the configured regions
    Regions,
}

#[derive(clap::Args)]
struct PredictOptions {
    /// Regions to report. Every configured region when omitted.
    #[arg(short, long)]
    region: Vec<String>,

    /// Prediction mode (integrated or binned). Overrides the configuration.
    #[arg(long)]
    mode: Option<PredictionMode>,

    /// Also run the closure test on background simulation
    #[arg(long)]
    closure: bool,

    /// Include the cut flow tables
    #[arg(long)]
    cutflow: bool,

    /// Output file for the report. Defaults to stdout.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path {} is not valid UTF-8", path.display()))
}

fn load_analysis(config: Option<&Path>, samples: &Path) -> Result<Analysis> {
    let config = config.map(path_str).transpose()?;
    let analysis = Analysis::from_files(config, path_str(samples)?)
        .context("failed to set up the analysis")?;
    if analysis.registry().is_empty() {
        bail!("no usable samples in {}", samples.display());
    }
    Ok(analysis)
}

fn cmd_predict(
    analysis: &mut Analysis,
    yields: &AnalysisYields,
    options: &PredictOptions,
) -> Result<()> {
    if let Some(mode) = options.mode {
        analysis.set_prediction_mode(mode);
    }
    let regions: Vec<String> = if options.region.is_empty() {
        analysis
            .config()
            .regions
            .iter()
            .map(|r| r.name.clone())
            .collect()
    } else {
        options.region.clone()
    };
    let mut text = String::new();
    for region in &regions {
        let report = analysis
            .report(yields, region, options.closure, options.cutflow)
            .with_context(|| format!("failed to predict region {}", region))?;
        text.push_str(&report);
    }
    match &options.report {
        Some(path) => {
            fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Accumulate { samples, output } => {
            let mut analysis = load_analysis(cli.config.as_deref(), &samples)?;
            let yields = analysis.accumulate()?;
            yields.save(path_str(&output)?)?;
            info!("Yields written to {}", output.display());
            Ok(())
        }
        Commands::Predict {
            samples,
            yields,
            options,
        } => {
            let mut analysis = load_analysis(cli.config.as_deref(), &samples)?;
            let yields = AnalysisYields::load(path_str(&yields)?)
                .with_context(|| format!("failed to read yields from {}", yields.display()))?;
            cmd_predict(&mut analysis, &yields, &options)
        }
        Commands::Run {
            samples,
            save_yields,
            options,
        } => {
            let mut analysis = load_analysis(cli.config.as_deref(), &samples)?;
            let yields = analysis.accumulate()?;
            if let Some(path) = save_yields {
                yields.save(path_str(&path)?)?;
            }
            cmd_predict(&mut analysis, &yields, &options)
        }
        Commands::Regions => {
            let config = match &cli.config {
                Some(path) => AnalysisConfig::load(path_str(path)?)?,
                None => AnalysisConfig::default(),
            };
            for region in &config.regions {
                println!("{}", region);
            }
            Ok(())
        }
    }
}
