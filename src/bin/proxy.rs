//! wardgate/src/bin/proxy.rs
//! Proxy CLI: one instance in front of one protected service port.

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use wardgate::handler::{Handler, HandlerFactory, NoTcpHandler, TcpPump};
use wardgate::http::{HttpPump, NoHttpHandler};
use wardgate::judge::Judge;
use wardgate::proxy::TcpProxy;
use wardgate::smart::SmartTcpHandler;
use wardgate::types::JudgeConfig;

#[derive(Parser)]
#[command(
    name = "wardgate-proxy",
    about = "Intercepting reverse proxy for one service port"
)]
struct Args {
    listen_address: String,
    listen_port: u16,
    target_address: String,
    target_port: u16,
    /// Handler run on every connection.
    #[arg(long, value_enum, default_value_t = HandlerKind::Raw)]
    handler: HandlerKind,
    /// JSON judge configuration file (smart handler only).
    #[arg(long)]
    judge_config: Option<PathBuf>,
    /// Backend endpoint as host:port (smart handler only; a shortcut for
    /// a default judge configuration).
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum HandlerKind {
    /// Forward raw packets unchanged.
    Raw,
    /// Parse and re-serialise HTTP messages.
    Http,
    /// Record traffic and drop flagged connections per the learned model.
    Smart,
}

fn judge_config(args: &Args) -> anyhow::Result<JudgeConfig> {
    if let Some(path) = &args.judge_config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&raw).context("parsing judge configuration");
    }
    if let Some(backend) = &args.backend {
        let (host, port) = backend
            .rsplit_once(':')
            .context("--backend must be host:port")?;
        let port = port.parse().context("bad backend port")?;
        return Ok(JudgeConfig::for_endpoint(host, port));
    }
    bail!("the smart handler needs --judge-config or --backend");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wardgate::logging::init("info");
    let args = Args::parse();

    let factory: HandlerFactory = match args.handler {
        HandlerKind::Raw => Arc::new(|| TcpPump::new(NoTcpHandler) as Arc<dyn Handler>),
        HandlerKind::Http => Arc::new(|| HttpPump::new(NoHttpHandler) as Arc<dyn Handler>),
        HandlerKind::Smart => {
            let config = judge_config(&args)?;
            let judge = Judge::new(config).context("invalid judge configuration")?;
            tokio::spawn(
                judge
                    .clone()
                    .run_updater(args.listen_port.to_string()),
            );
            Arc::new(move || TcpPump::new(SmartTcpHandler::new(judge.clone())) as Arc<dyn Handler>)
        }
    };

    let proxy = TcpProxy::new(
        args.listen_address,
        args.listen_port,
        args.target_address,
        args.target_port,
        factory,
    );
    proxy.run().await.context("proxy failed")?;
    Ok(())
}
