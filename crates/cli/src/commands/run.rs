//! Run the aggregation pipeline

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use processor::broker::{BrokerClient, KafkaBroker, MemoryBroker};
use processor::store::{
    AggregateStore, CounterStore, MemoryAggregateStore, MemoryCounterStore, PostgresAggregateStore,
    RedisCounterStore, StoredAggregate,
};
use processor::{
    CoordinatorStats, MetricsRegistry, MetricsServer, MetricsServerConfig, PipelineCoordinator,
};
use retail_analytics_config::ServiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::publish::publish_file;
use crate::components;

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Use the in-process broker and stores instead of Kafka, PostgreSQL and Redis
    #[arg(long)]
    pub in_memory: bool,

    /// Preload transactions from a JSON-lines file
    #[arg(long, value_name = "FILE", requires = "in_memory")]
    pub input: Option<PathBuf>,

    /// Stop once every preloaded record has been consumed
    #[arg(long, requires = "in_memory")]
    pub until_idle: bool,

    /// Override the consumer group
    #[arg(long)]
    pub group_id: Option<String>,
}

/// Broker, durable store, optional counter store, and the concrete
/// in-memory handles when running without servers
type Backends = (
    Arc<dyn BrokerClient>,
    Arc<dyn AggregateStore>,
    Option<Arc<dyn CounterStore>>,
    Option<MemoryBackends>,
);

struct MemoryBackends {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryAggregateStore>,
}

impl RunCommand {
    pub async fn execute(self, mut config: ServiceConfig) -> anyhow::Result<()> {
        if let Some(group_id) = &self.group_id {
            config.broker.group_id = group_id.clone();
        }
        config.validate()?;

        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_signal(shutdown.clone()));

        let registry = MetricsRegistry::global();
        let metrics = registry.register_pipeline();

        let (broker, durable, counters, memory) = if self.in_memory {
            self.memory_backends(&config).await?
        } else {
            connected_backends(&config).await?
        };

        if self.until_idle {
            if let Some(backends) = &memory {
                tokio::spawn(cancel_when_drained(
                    backends.broker.clone(),
                    shutdown.clone(),
                    Duration::from_millis(config.coordinator.idle_sleep_ms.max(10)),
                ));
            }
        }

        let mut coordinator = PipelineCoordinator::new(
            components::coordinator_config(&config),
            components::windowing_config(&config),
            broker,
            durable,
        )?
        .with_metrics(metrics);
        if let Some(counters) = counters {
            coordinator = coordinator.with_counter_store(counters);
        }

        if let Some(addr) = &config.observability.metrics_addr {
            let server = MetricsServer::with_registry(MetricsServerConfig::parse(addr)?, registry)
                .with_coordinator_status(coordinator.status());
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start(token).await {
                    error!(error = %e, "metrics server failed");
                }
            });
        }

        let result = coordinator.run(shutdown.clone()).await;
        shutdown.cancel();
        let stats = result?;

        print_stats(&stats);
        if let Some(backends) = memory {
            print_rows(&backends.store.rows(), &config);
        }
        Ok(())
    }

    async fn memory_backends(&self, config: &ServiceConfig) -> anyhow::Result<Backends> {
        let rate = config.reporting.conversion_rate;
        let broker = Arc::new(MemoryBroker::new(1));
        let store = Arc::new(MemoryAggregateStore::new(rate));
        let counters: Option<Arc<dyn CounterStore>> = if config.counter_store.enabled {
            Some(Arc::new(MemoryCounterStore::new(rate, config.counter_store.dedup_applies)))
        } else {
            None
        };

        if let Some(input) = &self.input {
            broker
                .subscribe(&[config.broker.topic.clone()], &config.broker.group_id)
                .await?;
            let summary = publish_file(input, Some(broker.as_ref() as &dyn BrokerClient), config).await?;
            info!(
                published = summary.published,
                rejected = summary.rejected,
                "preloaded in-memory broker"
            );
        }

        let client: Arc<dyn BrokerClient> = broker.clone();
        let durable: Arc<dyn AggregateStore> = store.clone();
        Ok((client, durable, counters, Some(MemoryBackends { broker, store })))
    }
}

async fn connected_backends(config: &ServiceConfig) -> anyhow::Result<Backends> {
    let retry = components::retry_policy(&config.retry);

    let broker = KafkaBroker::new(components::kafka_config(config), retry.clone())
        .context("failed to create Kafka client")?;
    let durable = PostgresAggregateStore::connect(components::postgres_config(config), &retry)
        .await
        .context("durable store unavailable")?;

    let counters: Option<Arc<dyn CounterStore>> = if config.counter_store.enabled {
        match RedisCounterStore::connect(components::redis_config(config), &retry).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "counter store unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let broker: Arc<dyn BrokerClient> = Arc::new(broker);
    let durable: Arc<dyn AggregateStore> = Arc::new(durable);
    Ok((broker, durable, counters, None))
}

/// Cancel once the in-memory log has been read to the end
async fn cancel_when_drained(broker: Arc<MemoryBroker>, shutdown: CancellationToken, every: Duration) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(every) => {
                if broker.pending() == 0 {
                    info!("input consumed, stopping");
                    shutdown.cancel();
                    return;
                }
            }
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

fn print_stats(stats: &CoordinatorStats) {
    println!("{}", "Pipeline stopped".bold());
    println!("  state:            {}", stats.state);
    println!("  events consumed:  {}", stats.events_consumed);
    println!("  events folded:    {}", stats.events_folded);
    println!("  events rejected:  {}", stats.events_rejected.to_string().yellow());
    println!("  late events:      {}", stats.events_late);
    println!("  duplicate events: {}", stats.events_duplicate);
    println!("  windows sealed:   {}", stats.windows_sealed);
    println!(
        "  durable writes:   {} written, {} skipped, {} diverted, {} failed",
        stats.durable_written.to_string().green(),
        stats.durable_skipped,
        stats.durable_diverted.to_string().yellow(),
        stats.durable_failures.to_string().red()
    );
    println!(
        "  counter applies:  {} applied, {} duplicate, {} failed",
        stats.counter_applied, stats.counter_duplicates, stats.counter_failures
    );
    println!("  commits:          {}", stats.commits);
    if let Some(watermark) = stats.watermark {
        println!("  watermark:        {}", watermark.to_rfc3339());
    }
}

fn print_rows(rows: &[StoredAggregate], config: &ServiceConfig) {
    if rows.is_empty() {
        return;
    }
    let currency = &config.reporting.currency;
    let converted = &config.reporting.converted_currency;
    println!();
    println!("{}", "Window aggregates".bold());
    for row in rows {
        println!(
            "  {} {} orders={} customers={} revenue={} {} ({} {}) avg={}",
            row.partition_key.cyan(),
            row.window_start.format("%Y-%m-%d %H:%M"),
            row.order_count,
            row.distinct_customers,
            row.revenue_total,
            currency,
            row.revenue_converted,
            converted,
            row.avg_order_value
        );
    }
}
