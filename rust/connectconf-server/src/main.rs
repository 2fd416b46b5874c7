//! referenceserver: reads its configuration from stdin, reports where it
//! listens on stdout, and serves until interrupted.
//!
//! ```bash
//! echo '{"httpVersion":"HTTP_VERSION_2"}' | referenceserver --json --port 8080
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use connectconf_server::{ServerOptions, run};
use connectconf_wire::{RecordFormat, WritePrinter};
use eyre::{WrapErr, bail};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "referenceserver")]
#[command(about = "Reference server for Connect, gRPC and gRPC-Web conformance")]
#[command(disable_version_flag = true)]
struct Args {
    /// Use JSON instead of the binary format for configuration and response
    #[arg(long)]
    json: bool,

    /// Print the version and exit
    #[arg(long)]
    version: bool,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port to listen on; 0 picks a free one
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// PEM certificate used when TLS is requested
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key for --cert
    #[arg(long)]
    key: Option<PathBuf>,

    #[arg(hide = true)]
    positional: Vec<String>,
}

fn read_pem(path: Option<&PathBuf>, what: &str) -> eyre::Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).wrap_err_with(|| format!("failed to read {what} {}", path.display())),
        None => Ok(Vec::new()),
    }
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
        println!("referenceserver {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if !args.positional.is_empty() {
        bail!("this command does not accept any positional arguments");
    }
    if args.cert.is_some() != args.key.is_some() {
        bail!("--cert and --key must be given together");
    }

    let mut opts = ServerOptions::new(Arc::new(WritePrinter::new(std::io::stderr())));
    opts.bind = args.bind;
    opts.port = args.port;
    opts.cert = read_pem(args.cert.as_ref(), "certificate")?;
    opts.key = read_pem(args.key.as_ref(), "key")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create runtime")?;
    rt.block_on(run(
        tokio::io::stdin(),
        tokio::io::stdout(),
        RecordFormat::from_json_flag(args.json),
        opts,
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "failed to wait for interrupt");
            }
        },
    ))?;
    Ok(())
}
