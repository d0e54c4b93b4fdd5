//! CLI command implementations

pub mod config;
pub mod migrate;
pub mod publish;
pub mod run;

pub use config::ConfigCommand;
pub use migrate::MigrateCommand;
pub use publish::PublishCommand;
pub use run::RunCommand;
