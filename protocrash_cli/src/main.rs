use clap::Parser;
use protocrash_core::config::FuzzConfig;
use protocrash_core::supervisor::{run_worker_from_env, Supervisor};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(name = "protocrash", author, version, about = "Coverage-guided protocol fuzzer")]
struct Cli {
    /// TOML campaign configuration.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// Target command line; overrides the config file. The literal `@@` is
    /// replaced by the mutant file path, otherwise stdin is used.
    #[clap(long, num_args = 1.., allow_hyphen_values = true)]
    target: Option<Vec<String>>,

    /// Directory of seed inputs.
    #[clap(short, long)]
    seeds: Option<PathBuf>,

    /// Number of worker processes.
    #[clap(short, long)]
    workers: Option<usize>,

    /// Campaign duration in seconds.
    #[clap(short, long)]
    duration: Option<u64>,

    /// Per-execution timeout in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,

    /// Protocol spoken by the target (http, dns, smtp).
    #[clap(short, long)]
    protocol: Option<String>,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // When the supervisor re-invoked us, we are a worker; nothing below
    // applies.
    if let Some(outcome) = run_worker_from_env() {
        return outcome.map_err(Into::into);
    }

    let cli = Cli::parse();

    let mut config = match &cli.config_file {
        Some(path) => FuzzConfig::load_from_file(path)?,
        None => {
            let default_path = PathBuf::from("protocrash.toml");
            if default_path.exists() {
                FuzzConfig::load_from_file(&default_path)?
            } else {
                let argv = cli.target.clone().ok_or_else(|| {
                    anyhow::anyhow!("no config file found and no --target given")
                })?;
                FuzzConfig::for_target(argv)
            }
        }
    };

    if let Some(target) = cli.target {
        config.argv = target;
    }
    if let Some(seeds) = cli.seeds {
        config.seeds_dir = Some(seeds);
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(duration) = cli.duration {
        config.max_duration_s = Some(duration);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(protocol) = cli.protocol {
        config.protocol = Some(protocol);
    }

    if config.argv.is_empty() {
        anyhow::bail!("target command line is empty");
    }

    let duration = config.max_duration_s.map(Duration::from_secs);
    let totals = Supervisor::new(config).run(duration)?;

    println!(
        "executions: {}  crashes: {}  hangs: {}  coverage edges: {}",
        totals.executions, totals.crashes, totals.hangs, totals.coverage_edges
    );
    Ok(())
}
