//! refpack - Generate stripped reference packages from compiled modules
//!
//! Every configuration document names a source directory. Matching modules
//! are stripped to reference modules, packaged one per module or all
//! together, and optionally pushed to a package feed.

mod config;
mod discover;
mod publish;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config;
use discover::Discovery;
use publish::FeedPublisher;
use refpack_core::{LogLevel, NoPublish, PackageAssembler, Pipeline, Publisher};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Generate stripped reference packages from compiled modules
#[derive(Parser, Debug)]
#[command(name = "refpack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration files, handled one by one; missing ones are generated
    #[arg(required = true, value_name = "CONFIG")]
    configs: Vec<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn base_filter(level: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(level.into())
}

/// Applies a configuration's stripping log level on top of the base filter
fn apply_strip_log_level(handle: &FilterHandle, level: Level, strip: LogLevel) {
    let directive = format!("refpack_core::strip={}", strip.as_directive());
    match directive.parse::<Directive>() {
        Ok(directive) => {
            if let Err(e) = handle.reload(base_filter(level).add_directive(directive)) {
                warn!("Could not apply strip log level: {}", e);
            }
        }
        Err(e) => warn!("Invalid strip log level directive {}: {}", directive, e),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let (filter, handle) = reload::Layer::new(base_filter(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    let mut failed = 0;
    for path in &cli.configs {
        if let Err(e) = process_config(path, level, &handle) {
            error!("{:#}", e);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} configurations failed", failed, cli.configs.len());
    }
    Ok(())
}

/// Runs one configuration document, generating it if it does not exist
fn process_config(path: &Path, level: Level, handle: &FilterHandle) -> Result<()> {
    if !path.exists() {
        println!("Generating missing config file: {}", path.display());
        return Config::write_default(path);
    }

    let config = Config::load(path)?;
    apply_strip_log_level(handle, level, config.strip.log_level);

    let sources = Discovery::new(&config)?
        .search()
        .with_context(|| format!("Failed to search for modules for {}", path.display()))?;
    info!(
        "Found {} candidate files in {}",
        sources.len(),
        config.source_path.display()
    );

    let mut publisher: Box<dyn Publisher> = match config.active_publish_target() {
        Some(target) => Box::new(FeedPublisher::new(target)?),
        None => {
            info!("No publish target defined or publishing disabled, skipping package upload");
            Box::new(NoPublish)
        }
    };

    let pipeline = Pipeline::new(
        config.run_settings(),
        config.strategy(),
        PackageAssembler::new(config.package_settings()),
    );
    let report = pipeline
        .run(&sources, publisher.as_mut())
        .with_context(|| format!("Configuration {} aborted", path.display()))?;

    for package in &report.packages {
        println!("Wrote {}", package.display());
    }
    for package in &report.published {
        println!("Published {}", package.display());
    }
    info!(
        "Summary: {} stripped, {} not modules, {} duplicates skipped, {} packages, {} failures",
        report.stripped.len(),
        report.invalid.len(),
        report.duplicates.len(),
        report.packages.len(),
        report.failures.len()
    );
    Ok(())
}
