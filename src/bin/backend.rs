//! wardgate/src/bin/backend.rs
//! Learning backend CLI.

use clap::Parser;
use std::path::PathBuf;
use wardgate::backend::Backend;

#[derive(Parser)]
#[command(
    name = "wardgate-backend",
    about = "Learning backend for wardgate proxies"
)]
struct Args {
    /// Port accepting proxy update requests.
    port: u16,
    /// Directory holding the per-service observation logs.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wardgate::logging::init("info");
    let args = Args::parse();
    Backend::new(args.port, args.data_dir).run().await?;
    Ok(())
}
