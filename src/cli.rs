//! Process-level CLI flags. Most configuration is environment-driven
//! (see `config.rs`); these flags exist only as convenience overrides for
//! interactive/manual runs.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "agentboard", version, about = "Agentboard dashboard server")]
pub struct Args {
    /// Override the PORT environment variable.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the AGENTBOARD_DB_PATH environment variable.
    #[arg(long)]
    pub db_path: Option<std::path::PathBuf>,

    /// Override the LOG_LEVEL environment variable.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    /// Apply any flags provided on the command line as environment overrides,
    /// so the rest of the process can keep reading configuration from the
    /// environment uniformly.
    pub fn apply_as_env_overrides(&self) {
        if let Some(port) = self.port {
            unsafe { std::env::set_var("PORT", port.to_string()) };
        }
        if let Some(db_path) = &self.db_path {
            unsafe { std::env::set_var("AGENTBOARD_DB_PATH", db_path) };
        }
        if let Some(level) = &self.log_level {
            unsafe { std::env::set_var("LOG_LEVEL", level) };
        }
    }
}
