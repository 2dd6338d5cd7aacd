use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spoolfuzz::session::RunDir;
use spoolfuzz::{
    DeviceControl, DeviceController, Document, FuzzConfig, FuzzTarget, Minimizer, MinimizeOutcome,
    NoDevice, PrinterFuzzer, Protocol, Reference, TcpTransport,
};

#[derive(Parser, Debug)]
#[clap(about = "Stateful IPP/LPD printer fuzzer")]
struct Args {
    /// Printer protocol, selects the default port.
    #[clap(short, long, default_value = "ipp")]
    protocol: Protocol,
    /// Template document to mutate.
    #[clap(short = 'f', long)]
    file: Option<PathBuf>,
    /// Reference document with mutation policies.
    #[clap(short = 'x', long)]
    reference: Option<PathBuf>,
    /// Device control config (power switch, monitors, cleanup).
    #[clap(short, long)]
    config: Option<PathBuf>,
    #[clap(short, long)]
    target: Option<String>,
    #[clap(short = 'P', long)]
    port: Option<u16>,
    #[clap(short, long, default_value = "0")]
    seed: u64,
    /// Session log to replay and minimize instead of fuzzing.
    #[clap(short, long)]
    log: Option<PathBuf>,
    #[clap(short = 'a', long, default_value = "0")]
    start_round: u64,
    /// Last round to replay; negative replays the whole log.
    #[clap(short = 'r', long, default_value = "-1", allow_hyphen_values = true)]
    target_round: i64,
    #[clap(long, default_value = "fuzz_data")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = FuzzConfig::with_seed(args.seed);

    let device = match &args.config {
        Some(path) => Some(
            DeviceController::load(path)
                .with_context(|| format!("failed to load device config {}", path.display()))?,
        ),
        None => None,
    };
    let target = device
        .as_ref()
        .and_then(|d| d.target_ip().map(str::to_string))
        .or_else(|| args.target.clone());
    let Some(target) = target else {
        Args::command().print_help()?;
        bail!("no target address given");
    };
    let port = args.port.unwrap_or_else(|| args.protocol.default_port());
    let transport = TcpTransport::new(&target, port, config.connect_timeout);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                shutdown.cancel();
            }
        }
    });

    match device {
        Some(device) => run(&args, config, transport, device, &target, port, shutdown).await,
        None => run(&args, config, transport, NoDevice, &target, port, shutdown).await,
    }
}

async fn run<D: DeviceControl>(
    args: &Args,
    config: FuzzConfig,
    transport: TcpTransport,
    device: D,
    target: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Some(log) = &args.log {
        let poc_dir = Path::new("poc").join(format!("{target}-{port}"));
        let mut minimizer = Minimizer::new(args.protocol, transport, device, config, poc_dir);
        let outcome = tokio::select! {
            outcome = minimizer.run(log, args.start_round, args.target_round) => outcome
                .with_context(|| format!("failed to minimize {}", log.display()))?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        match outcome {
            MinimizeOutcome::NoReproduction => info!("replay did not reproduce a crash"),
            MinimizeOutcome::NotReproducible => info!("minimized replay no longer crashes the target"),
            MinimizeOutcome::Minimized { poc, steps } => {
                info!(steps, path = %poc.display(), "minimized reproducer written")
            }
        }
        return Ok(());
    }

    let Some(file) = &args.file else {
        Args::command().print_help()?;
        bail!("no template file given");
    };
    let template = Document::load(file)
        .with_context(|| format!("failed to load template {}", file.display()))?;
    let run_dir =
        RunDir::create(&args.log_dir, target, port).context("failed to create run directory")?;
    template
        .save(&run_dir.input())
        .context("failed to copy template")?;
    let reference = match &args.reference {
        Some(path) if path.is_file() => {
            std::fs::copy(path, run_dir.reference())
                .with_context(|| format!("failed to copy reference {}", path.display()))?;
            let reference = Reference::load(path)
                .with_context(|| format!("failed to load reference {}", path.display()))?;
            Some(reference)
        }
        Some(path) => {
            warn!(path = %path.display(), "reference file not found, reference guided mutation disabled");
            None
        }
        None => None,
    };
    info!(run_dir = %run_dir.root().display(), %target, port, "starting fuzzer");

    let mut fuzzer = PrinterFuzzer::new(
        args.protocol,
        transport,
        device,
        template,
        reference,
        run_dir,
        config,
    )?;
    let stats = fuzzer.run(shutdown).await?;
    info!("rounds: {}", stats.rounds);
    info!("seeds: {}", stats.seeds);
    info!("crashes: {}", stats.crashes);
    info!("stage: {}", stats.stage);
    Ok(())
}
