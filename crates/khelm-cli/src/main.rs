//! khelm - render Helm charts as a CLI, kustomize plugin or kpt function

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod exit_codes;

use commands::template::TemplateArgs;

#[derive(Parser)]
#[command(name = "khelm")]
#[command(version)]
#[command(about = "Render Helm charts into Kubernetes manifests", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug output and show full error cause chains
    #[arg(long, global = true, env = "KHELM_DEBUG")]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a chart and write the manifests to stdout or a file
    #[command(disable_version_flag = true)]
    Template(TemplateArgs),

    /// Run as kustomize exec generator plugin
    Kustomize {
        /// ChartRenderer generator file
        generator: PathBuf,
    },

    /// Run as kpt function, transforming a ResourceList from stdin to stdout
    Fn,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("KHELM_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_logging(cli.debug);

    let cancel = CancellationToken::new();
    let listener = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, canceling");
                cancel.cancel();
            }
        }
    });

    let result = match cli.command {
        Commands::Template(args) => commands::template::run(args, &cancel, cli.debug).await,
        Commands::Kustomize { generator } => {
            commands::kustomize::run(&generator, &cancel, cli.debug).await
        }
        Commands::Fn => commands::kpt::run(&cancel, cli.debug).await,
    };
    listener.abort();

    match result {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            ExitCode::from(code)
        }
    }
}
