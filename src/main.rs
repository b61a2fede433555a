mod args;
mod assemble;
mod audio;
mod config;
mod image_gen;
mod llm;
mod pipeline;
mod state;
mod subtitle;
mod tts;

use args::{Args, Command};
use clap::Parser;
use config::Config;
use pipeline::Pipeline;
use state::RunStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    config.ensure_dirs()?;
    let mut store = RunStore::open(&config.state_file)?;

    match args.command {
        Command::Generate { new, clean } => {
            if clean {
                info!("Cleaning up incomplete runs before starting");
                store.delete_incomplete()?;
            }

            let resumable = if new {
                None
            } else {
                store.latest_incomplete().map(|run| run.id.clone())
            };
            let run_id = match resumable {
                Some(id) => {
                    info!("Resuming video generation from run {}", id);
                    id
                }
                None => {
                    let id = store.create(&config.niche, &config.language)?;
                    info!(
                        "Starting new run {} (niche: {}, language: {})",
                        id, config.niche, config.language
                    );
                    id
                }
            };

            let mut pipeline = Pipeline::new(&config, &mut store);
            match pipeline.run(&run_id).await {
                Ok(path) => info!("Generated video at {}", path.display()),
                Err(e) => {
                    error!("Video generation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::List => {
            let runs = store.list_incomplete();
            if runs.is_empty() {
                println!("No incomplete runs.");
            }
            for run in runs {
                println!(
                    "{}  {:?}  niche={}  steps=[{}]",
                    run.id,
                    run.status,
                    run.niche,
                    run.steps_completed.join(", ")
                );
            }
        }
        Command::Clean => {
            let removed = store.delete_incomplete()?;
            let pruned = store.delete_completed_older_than(chrono::Duration::days(7))?;
            remove_stale_work_files(&config)?;
            info!(
                "Removed {} incomplete run(s), pruned {} old completed run(s)",
                removed, pruned
            );
        }
    }

    Ok(())
}

/// Clears leftovers from the working directory. Rendered videos and JSON
/// documents survive; intermediate images, audio and subtitle files go.
fn remove_stale_work_files(config: &Config) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(&config.work_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let keep = path
            .extension()
            .is_some_and(|ext| ext == "mp4" || ext == "json");
        if !keep {
            if let Err(e) = std::fs::remove_file(&path) {
                error!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
    Ok(())
}
