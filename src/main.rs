#![warn(clippy::all, rust_2018_idioms)]

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use awsagent::args::Args;
use awsagent::cache::{config_hash, CacheStore};
use awsagent::credentials::{apply_proxy_settings, connection_test, AccessKey};
use awsagent::orchestrator::Orchestrator;
use awsagent::output::AgentOutput;

fn init_logging(args: &Args) {
    // stdout carries the wire format; every log line goes to stderr.
    let default_level = if args.debug {
        "awsagent=debug"
    } else if args.verbose {
        "awsagent=info"
    } else {
        "awsagent=warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},aws_config=warn,aws_smithy_runtime=warn,hyper=warn", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    // Sections run strictly one after another; a current-thread runtime makes
    // that explicit and keeps section futures free of Send bounds.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    apply_proxy_settings(&args);

    let key = match AccessKey::from_args(&args) {
        Ok(key) => key,
        Err(err) => {
            error!(%err, "invalid credentials configuration");
            eprintln!("{}", err);
            return ExitCode::from(2);
        }
    };

    // Credentials are always verified first; --connection-test stops here.
    let account_id = match connection_test(&key).await {
        Ok(account_id) => account_id,
        Err(err) if args.connection_test => {
            eprintln!("{}", err);
            return ExitCode::from(2);
        }
        Err(err) => {
            // Report the failure in-band and exit 0 so the monitoring server
            // does not flap on transient auth issues.
            error!(%err, "connection to AWS failed");
            let stdout = std::io::stdout();
            let mut out = AgentOutput::new(stdout.lock());
            let _ = out.write_exceptions(&[err.to_string()]);
            return ExitCode::SUCCESS;
        }
    };
    if args.connection_test {
        return ExitCode::SUCCESS;
    }

    match collect(&args, &key, &account_id).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(%err, "agent run failed");
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

/// Full collection run; returns false when any section raised.
async fn collect(args: &Args, key: &AccessKey, account_id: &str) -> Result<bool> {
    let base = args
        .cache_dir
        .clone()
        .unwrap_or_else(CacheStore::default_base);
    let cache = CacheStore::new(&base, &args.hostname);

    let changed = cache.config_changed(config_hash(&args.config_fingerprint()))?;
    let use_cache = !args.no_cache && !changed;

    let mut orchestrator = Orchestrator::build(args, key, account_id).await?;
    let report = orchestrator.run(&cache, use_cache).await?;

    let stdout = std::io::stdout();
    orchestrator.write_report(&report, stdout.lock())?;
    Ok(!report.has_exceptions())
}
