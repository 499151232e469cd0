//! Named pools, one per task domain.
//!
//! The registry is built once by the application's composition root and then
//! passed to whoever submits work. There is no global instance.
//!
//! # Examples
//!
//! ```rust
//! use forgepool::prelude::*;
//! use serde_json::{Value, json};
//!
//! async fn render(task_type: String, data: Value) -> HandlerResult {
//!     Ok(json!({"rendered": task_type, "input": data}))
//! }
//!
//! #[tokio::main]
//! async fn main() -> PoolResult<()> {
//!     let registry = PoolRegistry::builder()
//!         .domain(PoolDomain::Pdf, WorkerEntry::from_fn("pdf", render))
//!         .pool("reports", PoolConfig::with_workers(1, 2), WorkerEntry::from_fn("reports", render))
//!         .build()
//!         .await?;
//!
//!     let pdf = registry.get_domain(PoolDomain::Pdf)?;
//!     let out: Value = pdf.execute("merge", json!({"files": 2}), TaskOptions::new()).await?;
//!     assert_eq!(out["rendered"], "merge");
//!
//!     registry.shutdown_all(std::time::Duration::from_secs(1)).await;
//!     Ok(())
//! }
//! ```

use crate::config::{PoolConfig, PoolDomain, RegistryConfig};
use crate::core::{PoolStats, WorkerPool};
use crate::error::{PoolError, PoolResult};
use crate::handler::WorkerEntry;
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Builder for a [`PoolRegistry`].
#[derive(Debug, Default)]
pub struct PoolRegistryBuilder {
    config: RegistryConfig,
    pools: Vec<(String, Option<PoolConfig>, WorkerEntry)>,
}

impl PoolRegistryBuilder {
    /// Use `config` for pool sizes and the shutdown deadline.
    ///
    /// Pools added without an explicit configuration look theirs up here by
    /// name before falling back to the domain defaults.
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a pool with an explicit configuration.
    pub fn pool(mut self, name: impl Into<String>, config: PoolConfig, entry: WorkerEntry) -> Self {
        self.pools.push((name.into(), Some(config), entry));
        self
    }

    /// Add the pool serving `domain`.
    pub fn domain(mut self, domain: PoolDomain, entry: WorkerEntry) -> Self {
        self.pools.push((domain.name().to_string(), None, entry));
        self
    }

    fn resolve_config(&self, name: &str) -> PoolConfig {
        if let Some(config) = self.config.pools.get(name) {
            return config.clone();
        }
        PoolDomain::ALL
            .iter()
            .find(|domain| domain.name() == name)
            .map(PoolDomain::default_config)
            .unwrap_or_default()
    }

    /// Validate everything, then start every pool.
    ///
    /// Nothing is started if a name is registered twice or any configuration
    /// is invalid.
    pub async fn build(self) -> PoolResult<PoolRegistry> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.pools.len());

        for (name, config, entry) in &self.pools {
            if !seen.insert(name.clone()) {
                return Err(PoolError::DuplicatePool { name: name.clone() });
            }

            let config = config.clone().unwrap_or_else(|| self.resolve_config(name));
            config.validate().map_err(|errors| {
                PoolError::config(format!("pool '{}': {}", name, errors.join("; ")))
            })?;
            resolved.push((name.clone(), config, entry.clone()));
        }

        for name in self.config.pools.keys() {
            if !seen.contains(name) {
                tracing::warn!("🔨 Pool '{}' is configured but has no worker entry", name);
            }
        }

        let mut pools = BTreeMap::new();
        for (name, config, entry) in resolved {
            let pool = WorkerPool::start(name.clone(), config, entry).await?;
            pools.insert(name, pool);
        }

        tracing::info!("🔨 Pool registry ready with {} pools", pools.len());

        Ok(PoolRegistry {
            pools,
            shutdown_timeout: self.config.shutdown_timeout(),
        })
    }
}

/// A set of running pools addressed by name.
#[derive(Debug, Clone)]
pub struct PoolRegistry {
    pools: BTreeMap<String, WorkerPool>,
    shutdown_timeout: Duration,
}

impl PoolRegistry {
    /// Start building a registry
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::default()
    }

    /// Look up a pool by name.
    pub fn get(&self, name: &str) -> PoolResult<&WorkerPool> {
        self.pools.get(name).ok_or_else(|| PoolError::UnknownPool {
            name: name.to_string(),
        })
    }

    /// Look up the pool serving `domain`.
    pub fn get_domain(&self, domain: PoolDomain) -> PoolResult<&WorkerPool> {
        self.get(domain.name())
    }

    /// Names of all pools, sorted
    pub fn names(&self) -> Vec<&str> {
        self.pools.keys().map(String::as_str).collect()
    }

    /// Iterate over all pools in name order
    pub fn pools(&self) -> impl Iterator<Item = &WorkerPool> {
        self.pools.values()
    }

    /// Statistics of every pool, by name.
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Shut every pool down concurrently, each with the same `deadline`.
    pub async fn shutdown_all(&self, deadline: Duration) {
        tracing::info!(
            "🔨 Shutting down {} pools (deadline {:?})",
            self.pools.len(),
            deadline
        );
        join_all(self.pools.values().map(|pool| pool.shutdown(deadline))).await;
        tracing::info!("🔨 All pools shut down");
    }

    /// Wait for Ctrl+C, then shut every pool down with the configured deadline.
    pub async fn run_until_signal(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("🔨 Received Ctrl+C, initiating graceful shutdown..."),
            Err(e) => tracing::error!("🔨 Unable to listen for Ctrl+C, shutting down: {}", e),
        }
        self.shutdown_all(self.shutdown_timeout).await;
    }
}
