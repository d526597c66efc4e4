use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "basind", about = "Basin control-plane daemon", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane: auth service, pipeline master, worker pool.
    Start,
}
