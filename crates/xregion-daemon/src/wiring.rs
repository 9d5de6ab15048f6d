//! Builds a [`Coordinator`] from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};
use xregion_core::config::CoordinatorConfig;
use xregion_core::region::{
    HttpRegionalApi, MemoryRegionalApi, RegionRegistry, RegionalUserApi, StaticRegionRegistry,
};
use xregion_core::services::{AccountServices, HttpAccountServices};
use xregion_core::{Clock, Coordinator, JobRegistry, TransactionStore};

/// Builds the regional user API client.
///
/// A base URL is required. With `regional_api.dry_run` and no URL, units run
/// against an in-memory region and never touch a cluster.
pub fn regional_api(config: &CoordinatorConfig) -> Result<Arc<dyn RegionalUserApi>> {
    match config.regional_api.base_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            let api = HttpRegionalApi::new(
                url,
                Duration::from_secs(config.regional_api.timeout_secs),
            )
            .context("failed to build regional API client")?;
            Ok(Arc::new(api))
        },
        _ if config.regional_api.dry_run => {
            warn!("regional_api.base_url not set; using in-memory regional API (dry run)");
            Ok(Arc::new(MemoryRegionalApi::new()))
        },
        _ => bail!("regional_api.base_url is not set (pass --dry-run to use an in-memory region)"),
    }
}

/// Picks the region registry: the configured list when non-empty, else the
/// store's `region` table.
#[must_use]
pub fn region_registry(config: &CoordinatorConfig, store: &TransactionStore) -> Arc<dyn RegionRegistry> {
    if config.regions.uids.is_empty() {
        Arc::new(store.clone())
    } else {
        Arc::new(StaticRegionRegistry::new(config.regions.as_set()))
    }
}

/// Wires store, registry, jobs and clock into a coordinator for the
/// configured region. Registers the region in the store.
pub fn build_coordinator(
    config: &CoordinatorConfig,
    store: TransactionStore,
    clock: Arc<dyn Clock>,
) -> Result<Coordinator> {
    let region_uid = config.coordinator.region_uid.clone();
    if store
        .register_region(&region_uid, clock.now_ms())
        .context("failed to register region")?
    {
        info!(region_uid = %region_uid, "registered region");
    }

    let region = regional_api(config)?;
    let services: Arc<dyn AccountServices> = Arc::new(
        HttpAccountServices::from_config(&config.services)
            .context("failed to build account service clients")?,
    );
    if !services.is_configured() {
        warn!("account services not fully configured; merge commits will wait");
    }

    let jobs = JobRegistry::standard(&store, &region, &services, &config.jobs);
    let registry = region_registry(config, &store);
    Ok(Coordinator::new(store, region_uid, registry, jobs, clock))
}
