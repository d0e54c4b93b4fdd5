//! Process-wide Prometheus registry

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;
use std::sync::{Arc, OnceLock};

use super::pipeline::PipelineMetrics;
use super::MetricsError;

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Shared handle to one [`Registry`]; clones see the same metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    /// Empty registry carrying only the build info metric
    pub fn new() -> Self {
        let mut registry = Registry::default();
        registry.register(
            "retail_pipeline_build",
            "Build information",
            Info::new(vec![(
                "version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            )]),
        );
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    /// The registry served by the CLI, created on first use
    pub fn global() -> Arc<MetricsRegistry> {
        GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())).clone()
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.inner.clone()
    }

    /// Register a fresh set of pipeline metrics and return a handle to it
    pub fn register_pipeline(&self) -> PipelineMetrics {
        let metrics = PipelineMetrics::new();
        metrics.register(&mut self.inner.write());
        metrics
    }

    /// Render in the OpenMetrics text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut out = String::new();
        encode(&mut out, &self.inner.read()).map_err(|e| MetricsError::EncodingError(e.to_string()))?;
        Ok(out)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_reports_build_info() {
        let text = MetricsRegistry::new().encode().unwrap();
        assert!(text.contains(&format!(
            "retail_pipeline_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )));
        assert!(text.ends_with("# EOF\n"));
    }

    #[test]
    fn test_global_registry_is_shared() {
        assert!(Arc::ptr_eq(&MetricsRegistry::global(), &MetricsRegistry::global()));
    }

    #[test]
    fn test_registered_pipeline_shows_up_in_clones() {
        let registry = MetricsRegistry::new();
        let metrics = registry.register_pipeline();
        metrics.commit();
        metrics.commit();

        let shared = registry.clone();
        assert!(shared.encode().unwrap().contains("retail_pipeline_commits_total 2"));
    }
}
