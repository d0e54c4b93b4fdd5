//! Publish transactions from a JSON-lines file

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use processor::broker::{BrokerClient, KafkaBroker};
use processor::WindowAggregator;
use retail_analytics_config::ServiceConfig;
use retail_analytics_types::decode_transaction;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::components;

#[derive(Debug, Args)]
pub struct PublishCommand {
    /// JSON-lines file, one transaction per line
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Validate every line without producing
    #[arg(long)]
    pub dry_run: bool,
}

/// Outcome of one publish run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub published: usize,
    pub rejected: usize,
}

impl PublishCommand {
    pub async fn execute(self, config: ServiceConfig) -> anyhow::Result<()> {
        let broker = if self.dry_run {
            None
        } else {
            let retry = components::retry_policy(&config.retry);
            Some(KafkaBroker::new(components::kafka_config(&config), retry)?)
        };

        let summary = publish_file(
            &self.file,
            broker.as_ref().map(|b| b as &dyn BrokerClient),
            &config,
        )
        .await?;

        let verb = if self.dry_run { "valid" } else { "published" };
        println!(
            "{} {} {}, {} rejected",
            "✓".green().bold(),
            summary.published,
            verb,
            summary.rejected
        );
        Ok(())
    }
}

/// Decode and validate each line, publishing the valid ones keyed by the
/// configured partition key. Blank lines are skipped; invalid lines are
/// counted and logged.
pub async fn publish_file(
    path: &Path,
    broker: Option<&dyn BrokerClient>,
    config: &ServiceConfig,
) -> anyhow::Result<BatchSummary> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let windowing = components::windowing_config(config);
    let aggregator = WindowAggregator::new(windowing.partition_key, windowing.assigner()?);
    let mut summary = BatchSummary::default();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let tx = match decode_transaction(line.as_bytes()) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(line = index + 1, reason = err.reason(), error = %err, "skipping undecodable line");
                summary.rejected += 1;
                continue;
            }
        };
        if let Err(reason) = aggregator.validate(&tx) {
            warn!(line = index + 1, invoice_no = %tx.invoice_no, %reason, "skipping invalid transaction");
            summary.rejected += 1;
            continue;
        }

        if let Some(broker) = broker {
            let key = aggregator.partition_key().extract(&tx);
            broker
                .publish(&tx, key)
                .await
                .with_context(|| format!("failed to publish line {}", index + 1))?;
        }
        summary.published += 1;
    }

    info!(
        file = %path.display(),
        published = summary.published,
        rejected = summary.rejected,
        "publish finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor::broker::MemoryBroker;
    use std::io::Write;
    use std::time::Duration;

    const LINES: &str = r#"{"invoice_no":"536365","stock_code":"85123A","customer_id":"17850","country":"United Kingdom","quantity":6,"unit_price":"2.55","invoice_date":"2010-12-01T08:26:00Z"}
{"invoice_no":"536366","stock_code":"22633","customer_id":"17850","country":"United Kingdom","quantity":6,"unit_price":"1.85","invoice_date":"2010-12-01T08:28:00Z"}

not json
{"invoice_no":"C536379","stock_code":"D","customer_id":"14527","country":"United Kingdom","quantity":-1,"unit_price":"27.50","invoice_date":"2010-12-01T09:41:00Z"}
"#;

    fn input_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LINES.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_publish_skips_invalid_lines() {
        let file = input_file();
        let config = ServiceConfig::default();
        let broker = MemoryBroker::new(1);
        broker
            .subscribe(&[config.broker.topic.clone()], &config.broker.group_id)
            .await
            .unwrap();

        let summary = publish_file(file.path(), Some(&broker), &config).await.unwrap();

        assert_eq!(summary, BatchSummary { published: 2, rejected: 2 });
        assert_eq!(broker.pending(), 2);

        let records = broker.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key.as_deref(), Some("United Kingdom".as_bytes()));
    }

    #[tokio::test]
    async fn test_dry_run_only_counts() {
        let file = input_file();
        let summary = publish_file(file.path(), None, &ServiceConfig::default())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary { published: 2, rejected: 2 });
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let result = publish_file(Path::new("/nonexistent/orders.jsonl"), None, &ServiceConfig::default()).await;
        assert!(result.is_err());
    }
}
