use hashchain::cli::commands::run_cli;
use hashchain::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging is not up yet, so a bad config is reported on stderr.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("⚠️  Could not load config: {}, using defaults", e);
            Config::default()
        }
    };

    // Run CLI (logging will be initialized there based on debug flag)
    run_cli(config).await?;

    Ok(())
}
