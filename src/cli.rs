use clap::{ArgAction, Parser, Subcommand};

/// devloop watches your source tree, rebuilds on change, restarts your
/// backend, and reloads the browser when it comes back up.
#[derive(Parser, Debug)]
#[command(
    name = "devloop",
    version,
    about = "Development proxy with rebuild, restart, and browser reload",
    disable_version_flag = true
)]
pub struct Cli {
    /// Print version information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Verbose logging; also preserves the build status directory on exit
    #[arg(long, global = true, hide = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a devloop.yaml configuration file with default settings
    Init,
}
