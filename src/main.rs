use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;

use devloop::cli::{Cli, Commands};
use devloop::config::{Config, CONFIG_FILE};
use devloop::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);

    match cli.command {
        Some(Commands::Init) => init(),
        None => {
            let mut config = Config::load().await?;
            config.debug = cli.debug;
            devloop::run(config).await
        }
    }
}

fn init() -> Result<()> {
    if std::path::Path::new(CONFIG_FILE).exists() {
        print!("{CONFIG_FILE} already exists. Overwrite? [y/N] ");
        std::io::stdout().flush().context("failed to flush stdout")?;

        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("failed to read answer")?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    Config::write_default()?;
    println!("Created {CONFIG_FILE}");
    Ok(())
}
