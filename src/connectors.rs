use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::extractor::{Extractor, ExtractorError, FileExtractor};
use crate::loader::{Loader, LoaderError, MemoryLoader, ThrottledLoader};
use crate::migration::{DataSource, DataSourceType, MigrationConfig};

pub type ExtractorBuilder =
    Arc<dyn Fn(&DataSource) -> Result<Box<dyn Extractor>, ExtractorError> + Send + Sync>;

pub type LoaderBuilder =
    Arc<dyn Fn(&MigrationConfig) -> Result<Arc<dyn Loader>, LoaderError> + Send + Sync>;

/// Extractor builders keyed by source type and loader builders keyed by target service
#[derive(Clone)]
pub struct Connectors {
    extractors: HashMap<DataSourceType, ExtractorBuilder>,
    loaders: HashMap<String, LoaderBuilder>,
}

impl Connectors {
    /// No connectors at all
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
            loaders: HashMap::new(),
        }
    }

    pub fn register_extractor<F>(&mut self, source_type: DataSourceType, builder: F)
    where
        F: Fn(&DataSource) -> Result<Box<dyn Extractor>, ExtractorError> + Send + Sync + 'static,
    {
        self.extractors.insert(source_type, Arc::new(builder));
    }

    pub fn register_loader<F>(&mut self, target_service: &str, builder: F)
    where
        F: Fn(&MigrationConfig) -> Result<Arc<dyn Loader>, LoaderError> + Send + Sync + 'static,
    {
        self.loaders.insert(target_service.to_lowercase(), Arc::new(builder));
    }

    pub fn has_extractor(&self, source_type: DataSourceType) -> bool {
        self.extractors.contains_key(&source_type)
    }

    pub fn build_extractor(&self, source: &DataSource) -> Result<Box<dyn Extractor>, ExtractorError> {
        let builder = self
            .extractors
            .get(&source.source_type)
            .ok_or(ExtractorError::Unsupported(source.source_type))?;
        debug!(source = %source.key(), source_type = %source.source_type, "Building extractor");
        builder(source)
    }

    /// Loader for the configured target. Dry runs always load into memory and
    /// a configured rate limit wraps the loader in a throttle.
    pub fn build_loader(&self, config: &MigrationConfig) -> Result<Arc<dyn Loader>, LoaderError> {
        let loader: Arc<dyn Loader> = if config.dry_run {
            info!(target_service = %config.target_service, "Dry run, loading into memory");
            Arc::new(MemoryLoader::new(&config.target_service))
        } else {
            let builder = self
                .loaders
                .get(&config.target_service.to_lowercase())
                .ok_or_else(|| LoaderError::Unsupported(config.target_service.clone()))?;
            builder(config)?
        };

        Ok(match config.rate_limit {
            Some(rate) if rate > 0.0 => Arc::new(ThrottledLoader::new(loader, rate)),
            _ => loader,
        })
    }
}

impl Default for Connectors {
    /// File extractors for json and yaml exports
    fn default() -> Self {
        let mut connectors = Self::empty();
        for source_type in [DataSourceType::Json, DataSourceType::Yaml] {
            connectors.register_extractor(source_type, |source| {
                Ok(Box::new(FileExtractor::new(source.clone())?) as Box<dyn Extractor>)
            });
        }
        connectors
    }
}
