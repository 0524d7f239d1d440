//! `buildsched` binary entry point. Loads configuration, wires up
//! builders and the source-tarball generator, and runs the scheduler
//! until a shutdown signal arrives.
//!
//! Upstream change ingestion (the `EventSource` side of the contract) is
//! out of scope here -- a real deployment pairs this binary with a
//! process that calls `JobScheduler::submit` as change events arrive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use buildsched::builder::{Builder, ProcessBuilder};
use buildsched::config::Config;
use buildsched::scheduler::{JobScheduler, ProcessSourceTarballGenerator};

#[derive(Parser, Debug)]
#[command(name = "buildsched", version)]
#[command(about = "Continuous build dispatcher and repository-commit engine")]
struct Cli {
    /// Path to the scheduler's YAML configuration document.
    #[arg(long, default_value = "buildsched.yaml")]
    config: PathBuf,

    /// Argv of the external source-tarball generator. `{method}`,
    /// `{url}`, `{tag}`, `{version_from_vcs}`, `{only_modified}` are
    /// substituted per request.
    #[arg(
        long,
        value_delimiter = ' ',
        default_value = "mmpack-build mksource --method={method} --url={url} --tag={tag}"
    )]
    srctar_generator: Vec<String>,

    /// Argv template used to build each configured Builder's command
    /// line. `{srctar}`, `{pkgdir}`, `{arch}` are substituted per job.
    #[arg(
        long,
        value_delimiter = ' ',
        default_value = "mmpack-build pkg-build --srctar={srctar} --pkgdir={pkgdir}"
    )]
    builder_command: Vec<String>,
}

fn main() -> std::process::ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("can't load configuration {:?}: {}", cli.config, e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let builders: Vec<Arc<dyn Builder>> = config
        .builders
        .iter()
        .map(|(name, builder_cfg)| {
            Arc::new(ProcessBuilder::new(name.clone(), builder_cfg.arch.clone(), cli.builder_command.clone()))
                as Arc<dyn Builder>
        })
        .collect();

    let generator = Arc::new(ProcessSourceTarballGenerator::new(cli.srctar_generator.clone()));

    let scheduler = match JobScheduler::new(&config, builders, generator) {
        Ok(s) => s,
        Err(e) => {
            error!("can't construct scheduler: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    scheduler.start();
    info!("scheduler started");

    let stopping = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stopping);
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        error!("can't install signal handler: {}", e);
    }

    while !stopping.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutdown signal received, draining in-flight builds");
    scheduler.stop();
    std::process::ExitCode::SUCCESS
}
