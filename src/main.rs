use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tf_data_client::{Client, ProviderRef};

/// Reset SIGPIPE to default behavior so piping output (e.g. into `jq`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

/// Read a Terraform provider data source without terraform.
#[derive(Parser)]
#[command(name = "tf-data-client", about, long_about = None)]
struct Cli {
    /// Provider to use, as namespace/name (e.g. hashicorp/kubernetes)
    #[arg(long)]
    provider: String,

    /// Provider version (defaults to latest)
    #[arg(long, default_value = "")]
    version: String,

    /// Provider configuration as JSON
    #[arg(long, default_value = "{}")]
    config: String,

    /// Data source to read (e.g. kubernetes_all_namespaces)
    #[arg(long)]
    data_source: Option<String>,

    /// Data source configuration as JSON
    #[arg(long, default_value = "{}")]
    data_config: String,

    /// Write the JSON result to this file instead of stdout
    #[arg(long)]
    output: Option<std::path::PathBuf>,

    /// List available data sources and exit
    #[arg(long)]
    list_data_sources: bool,

    /// Provider cache directory (defaults to ~/.tf-data-client/providers)
    #[arg(long)]
    cache_dir: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    #[cfg(unix)]
    reset_sigpipe();

    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (namespace, name) = match cli.provider.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => (namespace, name),
        _ => bail!("provider must be in the form namespace/name (e.g. hashicorp/kubernetes)"),
    };

    let mut builder = Client::builder();
    if let Some(dir) = &cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    let client = builder.build()?;

    let provider_ref = ProviderRef::with_version(namespace, name, cli.version.clone());
    let session = client.create_provider(&provider_ref).await?;
    eprintln!(
        "Provider {}/{}@{} ready",
        session.namespace(),
        session.name(),
        session.version()
    );

    let result = drive(&cli, &session).await;
    if let Err(err) = client.close().await {
        tracing::warn!("failed to stop providers cleanly: {err}");
    }
    result
}

async fn drive(
    cli: &Cli,
    session: &tf_data_client::ProviderSession,
) -> Result<()> {
    if cli.list_data_sources {
        let mut data_sources = session.list_data_sources();
        data_sources.sort();
        println!("Available data sources:");
        for name in data_sources {
            println!("  - {name}");
        }
        return Ok(());
    }

    let config: serde_json::Value =
        serde_json::from_str(&cli.config).context("failed to parse provider config JSON")?;
    session.configure(&config).await?;

    let Some(data_source) = &cli.data_source else {
        eprintln!("Provider configured successfully. Use --data-source to read a data source.");
        return Ok(());
    };

    let data_config: serde_json::Value =
        serde_json::from_str(&cli.data_config).context("failed to parse data source config JSON")?;
    let result = session.read_data_source(data_source, &data_config).await?;

    let rendered = serde_json::to_string_pretty(&result.state)
        .context("failed to render result as JSON")?;

    match &cli.output {
        Some(path) => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            file.write_all(rendered.as_bytes())
                .and_then(|()| writeln!(file))
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Result written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
