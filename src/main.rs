use std::{process, sync::Arc};

use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use vaultcache::{
    cache::SecondLevelCache,
    config,
    error::AppError,
    infra::telemetry,
    workload::{self, SimulationParams, SimulationReport},
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Simulate(config::SimulateArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Simulate(args) => run_simulate(settings, args).await,
        config::Command::Config(_) => run_config(settings),
    }
}

async fn run_simulate(
    settings: config::Settings,
    args: config::SimulateArgs,
) -> Result<(), AppError> {
    let cache = Arc::new(SecondLevelCache::new(settings.cache_config()));
    let params = SimulationParams {
        transactions: args.transactions,
        workers: args.workers.clamp(1, 64),
        posts: args.posts,
        failure_rate: args.failure_rate,
    };

    let report = workload::simulate(Arc::clone(&cache), params).await?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
        println!("{rendered}");
    } else {
        print_report(&report);
    }

    info!(regions = cache.regions().len(), "Simulation report written");
    Ok(())
}

fn run_config(settings: config::Settings) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(&settings.cache_config())
        .map_err(|err| AppError::unexpected(format!("failed to encode configuration: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let tally = &report.tally;
    println!(
        "strategy {} (collections {}), {} transactions on {} workers in {} ms",
        report.strategy,
        report.collection_strategy,
        report.transactions,
        report.workers,
        report.elapsed_ms
    );
    println!(
        "posts: {} reads, {} hits, {} stale",
        tally.post_reads, tally.post_hits, tally.stale_post_reads
    );
    println!(
        "comments: {} reads, {} hits, {} stale",
        tally.comment_reads, tally.comment_hits, tally.stale_comment_reads
    );
    println!("queries: {} runs, {} hits", tally.queries, tally.query_hits);
    println!(
        "writes: {} committed, {} rolled back, {} lock conflicts, {} stale",
        tally.writes_committed, tally.writes_rolled_back, tally.lock_conflicts, tally.stale_writes
    );
    println!("divergent cached posts: {}", report.divergent_entries);
    println!();
    println!(
        "{:<40} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "region", "entries", "hits", "misses", "puts", "ratio"
    );
    for stats in &report.regions {
        println!(
            "{:<40} {:>8} {:>8} {:>8} {:>8} {:>8.2}",
            stats.region,
            stats.entries,
            stats.hits,
            stats.misses,
            stats.puts,
            stats.hit_ratio()
        );
    }
}
