use std::time::Instant;

use clap::Parser;

use cnn_mnist::backend::{available_workers, is_built_with_parallel, missing_backend_message};
use cnn_mnist::config::RunConfig;
use cnn_mnist::loss::METRICS_NAMES;
use cnn_mnist::pipeline;

fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = RunConfig::parse();

    println!("Num workers available: {}", available_workers());
    if !is_built_with_parallel() {
        println!("{}", missing_backend_message());
        std::process::exit(1);
    }

    let now = Instant::now();
    let report = pipeline::run(&config)?;
    log::info!("Finished in {}ms", now.elapsed().as_millis());

    println!("{}: {:.2}%", METRICS_NAMES[1], report.score.accuracy * 100.0);
    Ok(())
}
