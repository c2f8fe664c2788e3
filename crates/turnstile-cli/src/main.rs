use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

mod client;
mod replay;
mod verify;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "turnstile", about = "Turnstile face matching CLI")]
struct Cli {
    /// Base URL of turnstiled
    #[arg(long, env = "TURNSTILE_URL", default_value = "http://127.0.0.1:8000", global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,
    /// Enroll a person from one or more photos
    Enroll {
        #[arg(short, long)]
        name: String,
        /// Sample images of the same person
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Match a single image against the gallery
    Match {
        file: PathBuf,
        #[arg(long, default_value_t = 0.45)]
        thr: f32,
        #[arg(long, default_value = "simulator")]
        camera: String,
    },
    /// Compare two photos locally with the ONNX models (no daemon needed)
    Verify {
        first: PathBuf,
        second: PathBuf,
        #[arg(long, default_value_t = 0.45)]
        thr: f32,
        /// Directory holding det_10g.onnx and w600k_r50.onnx
        #[arg(long, env = "TURNSTILE_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// Record a sighting directly (subject to debounce)
    Log {
        #[arg(long)]
        person: String,
        #[arg(long)]
        score: f64,
        #[arg(long, default_value = "simulator")]
        camera: String,
        /// ISO-8601 time of the sighting (default: now, server side)
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// List recorded events, newest first
    Events {
        /// Only show the N most recent
        #[arg(long)]
        newest: Option<usize>,
    },
    /// Delete every recorded event
    Clear,
    /// Download the event log as CSV
    Export {
        /// Output file (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replay a folder of images as camera frames
    Replay {
        #[arg(long, default_value = "samples")]
        folder: PathBuf,
        #[arg(long, default_value = "simulator-1")]
        camera: String,
        #[arg(long, default_value_t = 0.45)]
        thr: f32,
        /// Seconds between frames
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Start over after the last image
        #[arg(long = "loop")]
        repeat: bool,
        /// Shuffle the order on every pass
        #[arg(long)]
        shuffle: bool,
        /// Client-side CSV log
        #[arg(long, default_value = "logs/folder_worker.csv")]
        log: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.url)?;

    match cli.command {
        Commands::Health => print_json(&client.health().await?)?,
        Commands::Enroll { name, files } => {
            let mut uploads = Vec::with_capacity(files.len());
            for path in &files {
                let bytes =
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".into());
                uploads.push((filename, bytes));
            }
            print_json(&client.enroll(&name, uploads).await?)?;
        }
        Commands::Match { file, thr, camera } => {
            let jpeg = replay::to_jpeg(&file)?;
            let reply = client.match_image(jpeg, thr, &camera).await?;
            for (name, score) in &reply.scores {
                println!("  {name:20} {score:.3}");
            }
            println!(
                "best: {} score={:.3} match={} thr={} logged={}",
                reply.best.name, reply.best.score, reply.best.is_match, reply.thr, reply.logged
            );
        }
        Commands::Verify {
            first,
            second,
            thr,
            model_dir,
        } => {
            let model_dir = model_dir.unwrap_or_else(turnstile_core::default_model_dir);
            let verdict = tokio::task::spawn_blocking(move || {
                let mut extractor = verify::load_extractor(&model_dir)?;
                verify::compare(&mut extractor, &first, &second, thr)
            })
            .await??;
            println!("cosine similarity = {:.3}", verdict.score);
            println!(
                "match: {} (threshold={thr})",
                if verdict.is_match { "YES" } else { "NO" }
            );
        }
        Commands::Log {
            person,
            score,
            camera,
            timestamp,
        } => {
            let reply = client
                .post_event(&person, score, &camera, timestamp.as_deref())
                .await?;
            print_json(&reply)?;
        }
        Commands::Events { newest } => {
            let mut reply = client.events().await?;
            if let (Some(n), Some(events)) = (
                newest,
                reply.get_mut("events").and_then(|e| e.as_array_mut()),
            ) {
                events.truncate(n);
            }
            print_json(&reply)?;
        }
        Commands::Clear => print_json(&client.clear_events().await?)?,
        Commands::Export { out } => {
            let csv = client.export_csv().await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &csv)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {} bytes to {}", csv.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&csv)?;
                }
            }
        }
        Commands::Replay {
            folder,
            camera,
            thr,
            interval,
            repeat,
            shuffle,
            log,
        } => {
            let opts = replay::ReplayOptions {
                folder,
                camera,
                thr,
                interval: Duration::try_from_secs_f64(interval)
                    .context("--interval must be a non-negative number of seconds")?,
                repeat,
                shuffle,
                log_path: log,
            };
            tokio::select! {
                result = replay::run(&client, &opts) => result?,
                _ = tokio::signal::ctrl_c() => println!("\nstopped by user"),
            }
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
