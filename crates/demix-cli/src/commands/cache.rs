use anyhow::anyhow;
use demix_app::{CacheResult, ResultCache};
use demix_config::DemixConfig;

use crate::cli::OutputFormat;
use crate::client::{CliError, CliResult};
use crate::output::render_cache_count;

pub(crate) async fn handle_cache_purge(config: &DemixConfig, format: OutputFormat) -> CliResult<()> {
    let removed = with_cache(config, ResultCache::purge_expired).await?;
    render_cache_count("purge", removed, format)
}

pub(crate) async fn handle_cache_clear(config: &DemixConfig, format: OutputFormat) -> CliResult<()> {
    let removed = with_cache(config, ResultCache::clear).await?;
    render_cache_count("clear", removed, format)
}

async fn with_cache<T, F>(config: &DemixConfig, operation: F) -> CliResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ResultCache) -> CacheResult<T> + Send + 'static,
{
    let cache_config = config.cache.clone();
    let outcome = tokio::task::spawn_blocking(move || -> CacheResult<Option<T>> {
        ResultCache::from_config(&cache_config)?
            .map(|cache| operation(&cache))
            .transpose()
    })
    .await
    .map_err(|err| CliError::failure(anyhow!("cache task failed: {err}")))??;
    outcome.ok_or_else(|| CliError::validation("result cache is disabled (cache.enabled is false)"))
}
