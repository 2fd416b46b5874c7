//! referenceclient: runs conformance directives read from stdin and writes
//! results to stdout.
//!
//! ```bash
//! connectconformance ... | referenceclient --json -p 8
//! ```

use std::sync::Arc;

use clap::Parser;
use connectconf_client::{RunOptions, default_parallelism, run};
use connectconf_wire::{RecordFormat, WritePrinter};
use eyre::{WrapErr, bail};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "referenceclient")]
#[command(about = "Reference client for Connect, gRPC and gRPC-Web conformance")]
#[command(disable_version_flag = true)]
struct Args {
    /// Use JSON instead of the binary format for directives and results
    #[arg(long)]
    json: bool,

    /// Print the version and exit
    #[arg(long)]
    version: bool,

    /// Number of calls to run in parallel
    #[arg(short = 'p', long = "parallelism", default_value_t = default_parallelism())]
    parallelism: usize,

    #[arg(hide = true)]
    positional: Vec<String>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();
    if args.version {
        println!("referenceclient {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if !args.positional.is_empty() {
        bail!("this command does not accept any positional arguments");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create runtime")?;

    let mut opts = RunOptions::new(RecordFormat::from_json_flag(args.json));
    opts.parallelism = args.parallelism;
    opts.feedback = Some(Arc::new(WritePrinter::new(std::io::stderr())));
    rt.block_on(run(tokio::io::stdin(), tokio::io::stdout(), opts))?;
    Ok(())
}
