use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uplift::config::Config;
use uplift::utils::{format_bytes, format_duration};
use uplift::{BatchSummary, ItemEvent, UploadEvent, UploadManager, UploadStatus};

/// Upload files to an HTTP endpoint as multipart/form-data.
#[derive(Parser, Debug)]
#[command(name = "uplift", version, about)]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Upload URL, overrides `destination` in the config file
    #[arg(short, long)]
    destination: Option<String>,

    /// Files to upload, override `files` in the config file
    files: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uplift=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load_or_default(&args.config)?;

    if let Some(destination) = args.destination {
        config.destination = Some(destination);
    }
    if !args.files.is_empty() {
        config.files = args.files;
    }

    let Some(destination) = config.destination else {
        bail!("No destination given, use --destination or set it in {}", args.config.display());
    };

    let started = Instant::now();
    let handle = UploadManager::new(config.upload).context("Failed to start upload manager")?;
    let mut batch = handle.manager
        .submit(config.files, &destination)
        .await
        .context("Failed to submit batch")?;

    let mut last = None;
    loop {
        tokio::select! {
            event = batch.next() => match event {
                Some(UploadEvent::Item(event)) => print_event(&event),
                Some(UploadEvent::Summary(summary)) => {
                    println!("{}", summary);
                    last = Some(summary);
                    if summary.all_done {
                        println!("Finished in {}", format_duration(started.elapsed()));
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(batch_id = %batch.batch_id, "Interrupted, cancelling batch");
                handle.manager.cancel(batch.batch_id).await?;
            }
        }
    }

    handle.shutdown().await?;

    let succeeded = last.is_some_and(|summary: BatchSummary| summary.all_succeeded);
    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_event(event: &ItemEvent) {
    let position = format!("[{}/{}]", event.index + 1, event.total);

    match (&event.status, &event.failure) {
        (UploadStatus::Uploading, _) => {
            println!("{} {} {}%", position, event.display_name, event.progress_percent);
        }
        (UploadStatus::Succeeded, _) => {
            let size = event.size_bytes.map(format_bytes).unwrap_or_default();
            println!("{} {} done {}", position, event.display_name, size);
        }
        (UploadStatus::Failed, Some(failure)) => {
            let retry = if failure.will_retry { ", retrying" } else { "" };
            println!("{} {} failed: {}{}", position, event.display_name, failure.reason, retry);
        }
        _ => {}
    }
}
