//! Run one product-photo generation against a local studio service.
//!
//! Pass `--stream` to follow progress over the streaming endpoint instead
//! of polling. Set `RUST_LOG=studio_gen=debug` to see each status check.
//!
//! ```sh
//! cargo run --example generate -- https://cdn.example.com/uploads/shoe.jpg clean-studio
//! ```

use std::sync::Arc;
use std::time::Duration;
use studio_gen::{
    CompletionMode, EpisodeOutcome, Orchestrator, OrchestratorConfig, Phase, StudioClient,
    Workflow,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let stream = args.iter().any(|a| a == "--stream");
    args.retain(|a| a != "--stream");

    let image_url = args
        .first()
        .cloned()
        .unwrap_or_else(|| "https://cdn.example.com/uploads/shoe.jpg".to_string());
    let style = args.get(1).cloned().unwrap_or_else(|| "clean-studio".to_string());
    let endpoint =
        std::env::var("STUDIO_ENDPOINT").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let mut workflow = Workflow::new();
    workflow.image_uploaded(image_url)?;
    workflow.select_style(Some(style))?;
    let workflow = workflow.into_shared();

    let mode = if stream {
        CompletionMode::Stream
    } else {
        CompletionMode::Poll
    };
    let config = OrchestratorConfig::builder().with_mode(mode).build();
    println!("Waiting up to {:?} for a result", config.poll.ceiling());

    let orchestrator = Arc::new(
        Orchestrator::new(StudioClient::new(endpoint), Arc::clone(&workflow), config).with_sink(
            |record: &studio_gen::ResultRecord, _: Option<&studio_gen::TaskHandle>| {
                println!("Saved {} ({})", record.filename, record.url);
            },
        ),
    );

    let ticket = workflow
        .lock()
        .map_err(|_| "workflow lock poisoned")?
        .start_generation()?;
    let running = orchestrator.spawn(ticket);

    let watched = Arc::clone(&workflow);
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            let state = match watched.lock() {
                Ok(wf) => wf.snapshot(),
                Err(_) => break,
            };
            if state.phase != Phase::Generating {
                break;
            }
            println!(
                "  {}% {}",
                state.percent.unwrap_or(0),
                state.stage_label.unwrap_or_default()
            );
        }
    });

    // Ctrl-C abandons the episode; the workflow drops any late result.
    tokio::select! {
        outcome = running => match outcome? {
            EpisodeOutcome::Completed(record) => println!("Done: {}", record.url),
            EpisodeOutcome::Failed(e) => eprintln!("Failed: {}", e.user_message()),
            other => println!("Ended: {:?}", other),
        },
        _ = tokio::signal::ctrl_c() => {
            let released = workflow.lock().map_err(|_| "workflow lock poisoned")?.start_over();
            println!("Cancelled, released {} preview(s)", released.len());
        }
    }

    ticker.abort();
    let phase = workflow.lock().map_err(|_| "workflow lock poisoned")?.phase();
    if phase != Phase::Complete {
        std::process::exit(1);
    }
    Ok(())
}
