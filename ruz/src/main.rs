mod build_index;
mod config;
mod telemetry;

use build_index::BuildIndexArgs;
use clap::{Args, Parser};
use config::Config;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "ruz", version, about = "Caching proxy for the RUZ schedule API")]
enum CliCommand {
    /// Serve the API and the frontend bundle
    Proxy(ProxyArgs),
    /// Build groups_index.json from the RUZ group dictionary
    BuildIndex(BuildIndexArgs),
}

#[derive(Args)]
struct ProxyArgs {
    #[arg(long)]
    config_file_path: Option<PathBuf>,
}

fn main() {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::Proxy(args) => run_proxy(args),
        CliCommand::BuildIndex(args) => run_build_index(args),
    }
}

fn run_proxy(args: ProxyArgs) {
    let config = match Config::load(args.config_file_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let _sentry = telemetry::init_logging(config.common.logging.as_ref());
    if let Some(metrics) = &config.common.metrics
        && let Err(e) = telemetry::init_metrics(metrics)
    {
        tracing::error!(error = %e, "could not initialize metrics");
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "could not start tokio runtime");
            process::exit(1);
        }
    };

    tracing::info!("Starting proxy");
    if let Err(e) = rt.block_on(proxy::run(config.proxy)) {
        tracing::error!(error = %e, "proxy stopped");
        process::exit(1);
    }
}

fn run_build_index(args: BuildIndexArgs) {
    let _sentry = telemetry::init_logging(None);

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "could not start tokio runtime");
            process::exit(1);
        }
    };

    match rt.block_on(build_index::build_index(&args)) {
        Ok(report) => {
            println!(
                "saved {} groups -> {}",
                report.unique_labels,
                args.out.display()
            );
            if args.validate {
                println!(
                    "validation: {} pairs -> {} unique labels, {} duplicates, {} probes",
                    report.total_pairs, report.unique_labels, report.duplicate_ids, report.probes
                );
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "group index build failed");
            process::exit(build_index::exit_code(&e));
        }
    }
}
