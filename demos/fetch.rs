//! Fetch a URL or a web-seeded torrent
//!
//! Usage: cargo run --example fetch -- <url | file.torrent> [output_dir]
//!
//! Set `RUST_LOG=rangefetch=debug` to watch segment dispatch and retries.

use rangefetch::{EngineConfig, Locator, TransferEngine, TransferEvent, TransferOutcome};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let locator = env::args()
        .nth(1)
        .unwrap_or_else(|| "https://httpbin.org/bytes/1024".to_string());
    let output_dir = env::args().nth(2).unwrap_or_else(|| ".".to_string());

    let engine = TransferEngine::new(
        EngineConfig::default()
            .output_dir(output_dir)
            .concurrency(8),
    )?;

    let request = engine.resolve(&Locator::parse(&locator)?).await?;
    println!(
        "Fetching {} ({:?} bytes) from {} endpoint(s)",
        request.descriptor.name,
        request.descriptor.total_size,
        request.endpoints.len()
    );

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TransferEvent::Progress { progress, .. } => {
                    print!(
                        "\r{:>6.1}%  {:>10} B/s  {}/{} segments",
                        progress.percentage(),
                        progress.rate,
                        progress.segments_verified,
                        progress.segments_total
                    );
                }
                TransferEvent::SegmentFailed {
                    index, endpoint, error, ..
                } => eprintln!("\nsegment {index} failed on {endpoint}: {error}"),
                _ => {}
            }
        }
    });

    let handle = engine.start(request)?;
    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match handle.wait().await {
        TransferOutcome::Completed { path } => println!("\nSaved to {}", path.display()),
        TransferOutcome::Cancelled { verified_ranges } => {
            println!("\nCancelled; {} range(s) kept for resume", verified_ranges.len())
        }
        TransferOutcome::Failed {
            reason,
            failed_ranges,
        } => {
            eprintln!("\nFailed: {reason}");
            for range in failed_ranges {
                eprintln!("  missing {range}");
            }
        }
    }
    Ok(())
}
