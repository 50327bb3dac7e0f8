use anyhow::{Context, Result};
use clap::Parser;
use pms_host::{CancellationToken, ExtensionConfig, WsManager};
use serde::Deserialize;

/// Command line arguments for the demonstration host.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "PMS extension manager demo host",
    propagate_version = true
)]
struct Cli {
    /// Plugin executables to load.
    plugins: Vec<String>,

    /// Inherit plugin stdout/stderr and log verbosely.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Deserialize)]
struct HelloResponse {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        std::env::set_var("RUST_LOG", "info,pms_host=debug");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let mut builder = WsManager::builder();
    if cli.debug {
        builder = builder.with_debug();
    }
    let manager = builder.init().await?;

    // declare host extensions before loading plugins
    manager.register_host_extension::<String, i64, _>(
        ExtensionConfig::new("app.getRandomNumber.default", "app.getRandomNumber"),
        |_| Ok(6),
    );

    manager
        .load_plugins(&CancellationToken::new(), cli.plugins)
        .await
        .context("plugins loading failed")?;

    let mut results = manager.execute::<String, HelloResponse>("hello", "Anton".to_string());
    while let Some(result) = results.recv().await {
        println!("{}", result?.message);
    }

    let mut random = 0i64;
    let mut results = manager.execute::<String, i64>("app.getRandomNumber", String::new());
    while let Some(result) = results.recv().await {
        random ^= result.context("getRandomNumber failed")?;
    }
    println!("Host executed random number is: {random}");

    Ok(())
}
