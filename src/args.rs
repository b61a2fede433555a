use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "autoshorts")]
#[command(about = "Resumable short-form video generation pipeline", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a video, resuming the latest incomplete run when one exists
    Generate {
        /// Start a fresh run even when an incomplete one exists
        #[arg(long)]
        new: bool,

        /// Delete incomplete runs before starting
        #[arg(long)]
        clean: bool,
    },
    /// List incomplete runs
    List,
    /// Delete incomplete runs, prune old completed runs and stale work files
    Clean,
}
