//! Configuration inspection

use clap::Subcommand;
use colored::Colorize;
use retail_analytics_config::ServiceConfig;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as JSON
    Show,

    /// Validate the effective configuration
    Validate,
}

impl ConfigCommand {
    pub fn execute(self, config: &ServiceConfig) -> anyhow::Result<()> {
        match self {
            ConfigCommand::Show => {
                println!("{}", serde_json::to_string_pretty(config)?);
            }
            ConfigCommand::Validate => {
                config.validate()?;
                println!("{} configuration is valid", "✓".green().bold());
            }
        }
        Ok(())
    }
}
