mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use smo::{SmoConfig, SmoRuntime};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Serve { config } => {
            info!("🚀 SMO starting up...");
            let config = match config {
                Some(path) => {
                    let mut config = SmoConfig::load_from(&path)?;
                    config.apply_env();
                    config
                }
                None => SmoConfig::load()?,
            };
            let runtime = SmoRuntime::new(config).await?;
            runtime.serve().await?;
        }

        Commands::Deploy {
            project,
            file,
            artifact,
        } => {
            let url = format!("{}/graph/project/{}", cli.host, project);
            let body = match (file, artifact) {
                (Some(path), None) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read descriptor {:?}", path))?,
                (None, Some(artifact_ref)) => {
                    serde_json::to_vec(&serde_json::json!({"artifact": artifact_ref}))?
                }
                _ => bail!("Provide exactly one of --file or --artifact"),
            };
            let response = reqwest::Client::new().post(&url).body(body).send().await?;
            print_response(response).await?;
        }

        Commands::ListGraphs { project } => {
            let url = format!("{}/graph/project/{}", cli.host, project);
            let response = reqwest::get(&url).await?;
            print_response(response).await?;
        }

        Commands::GetGraph { name } => {
            let url = format!("{}/graph/{}", cli.host, name);
            let response = reqwest::get(&url).await?;
            print_response(response).await?;
        }

        Commands::Placement { name } => {
            let url = format!("{}/graph/{}/placement", cli.host, name);
            let response = reqwest::get(&url).await?;
            print_response(response).await?;
        }

        Commands::Start { name } => {
            let url = format!("{}/graph/{}/start", cli.host, name);
            let response = reqwest::get(&url).await?;
            print_response(response).await?;
        }

        Commands::Stop { name } => {
            let url = format!("{}/graph/{}/stop", cli.host, name);
            let response = reqwest::get(&url).await?;
            print_response(response).await?;
        }

        Commands::Remove { name } => {
            let url = format!("{}/graph/{}", cli.host, name);
            let response = reqwest::Client::new().delete(&url).send().await?;
            print_response(response).await?;
        }
    }

    Ok(())
}

async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        println!("{}", body);
        Ok(())
    } else {
        bail!("Request failed with {}: {}", status, body)
    }
}
