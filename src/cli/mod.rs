use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "smo")]
#[command(about = "Service management orchestrator for application graphs on federated clusters")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Base URL of a running SMO instance, for the client commands
    #[arg(long, default_value = "http://localhost:8000", env = "SMO_HOST")]
    pub host: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator and serve the HTTP API
    Serve {
        /// Configuration file path (falls back to SMO_CONFIG, then defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Deploy an application graph
    Deploy {
        /// Project the graph belongs to
        project: String,

        /// Descriptor file (YAML or JSON)
        #[arg(short, long, conflicts_with = "artifact")]
        file: Option<PathBuf>,

        /// OCI reference of a packaged descriptor artifact
        #[arg(long)]
        artifact: Option<String>,
    },

    /// List the graphs of a project
    ListGraphs {
        project: String,
    },

    /// Fetch one graph
    GetGraph {
        name: String,
    },

    /// Trigger the placement algorithm for a graph
    Placement {
        name: String,
    },

    /// Start a stopped graph
    Start {
        name: String,
    },

    /// Stop a running graph
    Stop {
        name: String,
    },

    /// Remove a graph
    Remove {
        name: String,
    },
}
