use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pimbridge::config::{LogFormat, PimBridgeConfig};
use pimbridge::verify::CheckStatus;
use pimbridge::{
    AcceleratorClient, Activation, EltwiseOp, RuntimeSession, SimRuntime, Tensor,
};

#[derive(Parser)]
#[command(
    name = "pimbridge",
    about = "Tensor operations on processing-in-memory accelerators",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (overrides PIMBRIDGE_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run functional verification against the host emulator
    Verify {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Worker count for the concurrency check
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Run a single GEMM on seeded random data
    Gemm {
        /// Input shape, comma separated (C,H,W or N,C,H,W)
        #[arg(long, value_delimiter = ',', required = true)]
        input: Vec<usize>,

        /// Output width of the weight matrix
        #[arg(long)]
        out_width: usize,

        /// Fused activation: none or relu
        #[arg(long, default_value = "none")]
        activation: Activation,

        /// Submit without blocking and wait on the returned handle
        #[arg(long)]
        no_block: bool,

        /// Seed for the generated operands (defaults to verify.seed)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run one elementwise op on constant inputs (1 and 2)
    Eltwise {
        /// Element count
        #[arg(long, default_value = "32")]
        len: usize,

        /// Operation: add or mul
        #[arg(long, default_value = "add")]
        op: EltwiseOp,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => PimBridgeConfig::load(path)?,
        None => PimBridgeConfig::load_or_default(),
    };
    init_tracing(&cfg);

    match cli.command {
        Commands::Verify { json, threads } => {
            if let Some(threads) = threads {
                cfg.verify.threads = threads;
            }
            tracing::info!(threads = cfg.verify.threads, "Running functional verification");
            let report = pimbridge::verify::run(&cfg).await?;
            if json {
                let json_output = serde_json::to_string_pretty(&report)?;
                println!("{}", json_output);
            } else {
                println!("\npimbridge Functional Verification");
                println!("{:<20} | {:<6} | Details", "Check", "Status");
                println!("{:-<20}-|-{:-<6}-|-{:-<40}", "", "", "");
                for res in &report.results {
                    let status_str = match res.status {
                        CheckStatus::Pass => "PASS",
                        CheckStatus::Fail => "FAIL",
                    };
                    println!("{:<20} | {:<6} | {}", res.name, status_str, res.details);
                }
                let c = &report.lifecycle;
                println!("\n=== Runtime Calls ===");
                println!(
                    "descriptors {}/{}  buffers {}/{}  executions {}",
                    c.descriptors_created,
                    c.descriptors_destroyed,
                    c.buffers_created,
                    c.buffers_destroyed,
                    c.executions
                );
                println!();
            }
            if !report.all_passed() {
                let failed = report
                    .results
                    .iter()
                    .filter(|r| r.status == CheckStatus::Fail)
                    .count();
                bail!("{} verification check(s) failed", failed);
            }
        }
        Commands::Gemm {
            input,
            out_width,
            activation,
            no_block,
            seed,
        } => {
            let seed = seed.unwrap_or(cfg.verify.seed);
            let in_width = input.last().copied().unwrap_or(0);
            tracing::info!(?input, out_width, ?activation, no_block, "Running GEMM");

            let inputs = Tensor::random(&input, seed);
            let weights = Tensor::random(&[in_width, out_width], seed.wrapping_add(1));
            let bias = Tensor::random(&[out_width], seed.wrapping_add(2));

            let client = open_client(&cfg)?;
            let pending = client.execute_gemm(&inputs, &weights, &bias, activation, !no_block)?;
            if no_block {
                println!("queued op {} (output {:?})", pending.op_id(), pending.output_shape());
            }
            let output = pending.wait()?;
            println!("output shape: {:?}", output.shape());
            println!("checksum:     {:.6}", output.checksum());
            close_client(client)?;
        }
        Commands::Eltwise { len, op } => {
            tracing::info!(len, ?op, "Running elementwise op");
            let lhs = Tensor::full(&[len], 1.0);
            let rhs = Tensor::full(&[len], 2.0);

            let client = open_client(&cfg)?;
            let output = client.execute_elementwise(&lhs, &rhs, op)?;
            let values = output.to_f32_vec();
            println!("{:?} x {}: {:?}", op, len, values);
            close_client(client)?;
        }
        Commands::Config => {
            print!("{}", cfg.to_toml()?);
        }
    }

    Ok(())
}

fn init_tracing(cfg: &PimBridgeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cfg.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn open_client(cfg: &PimBridgeConfig) -> Result<AcceleratorClient<SimRuntime>> {
    let sim = SimRuntime::new()
        .with_latency(Duration::from_micros(cfg.runtime.emulator_latency_us));
    let session = RuntimeSession::new(sim, cfg.runtime.kind, cfg.runtime.precision)
        .context("failed to initialize PIM runtime")?;
    Ok(AcceleratorClient::new(Arc::new(session)))
}

fn close_client(client: AcceleratorClient<SimRuntime>) -> Result<()> {
    client
        .session()
        .shutdown()
        .context("failed to deinitialize PIM runtime")
}
