//! estima-sim entry point.

use std::process::ExitCode;

use estima_cli::{parse_script, CliArgs, CliError, SimConfig, Simulation};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), CliError> {
    let args = CliArgs::parse(std::env::args().skip(1)).ok_or(CliError::Usage)?;
    let config = SimConfig::load(args.config.as_deref())?;
    let script = parse_script(&std::fs::read_to_string(&args.script)?)?;

    tracing::info!(
        script = %args.script.display(),
        steps = script.len(),
        rollback_threshold = config.engine.rollback_threshold,
        "replaying pricing session"
    );

    let simulation = Simulation::new(config)?;
    let reports = simulation.run(&script).await;
    for report in &reports {
        println!("{report}");
    }
    println!();
    println!("{}", simulation.summary(&reports));
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "simulation failed");
            eprintln!("estima-sim: {e}");
            ExitCode::FAILURE
        }
    }
}
