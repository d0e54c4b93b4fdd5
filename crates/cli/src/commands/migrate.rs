//! Apply the durable store schema

use clap::Args;
use colored::Colorize;
use processor::store::PostgresAggregateStore;
use retail_analytics_config::ServiceConfig;

use crate::components;

#[derive(Debug, Args)]
pub struct MigrateCommand {
    /// Only check that the store is reachable
    #[arg(long)]
    pub check: bool,
}

impl MigrateCommand {
    pub async fn execute(self, config: ServiceConfig) -> anyhow::Result<()> {
        let mut store_config = components::postgres_config(&config);
        store_config.auto_migrate = false;
        let retry = components::retry_policy(&config.retry);

        let store = PostgresAggregateStore::connect(store_config, &retry).await?;
        if self.check {
            let healthy = store.health_check().await?;
            store.close().await;
            if !healthy {
                anyhow::bail!("durable store answered but reported unhealthy");
            }
            println!("{} durable store reachable", "✓".green().bold());
            return Ok(());
        }

        store.migrate().await?;
        store.close().await;
        println!("{} schema up to date", "✓".green().bold());
        Ok(())
    }
}
