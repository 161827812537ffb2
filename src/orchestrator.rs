use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::connectors::Connectors;
use crate::dedup;
use crate::extractor::{self, ExtractionResult, ExtractorError};
use crate::field_path::value_to_string;
use crate::loader::Loader;
use crate::mapping::{EntityMapping, MigrationMapping};
use crate::migration::{
    DataSource, DataSourceType, MigrationConfig, MigrationError, MigrationRun, MigrationStatus,
    MigrationStep, StepError,
};
use crate::progress::{ProgressReporter, RunControl, RunSignal};
use crate::record::{RecordStatus, SourceRecord, TransformedRecord};
use crate::schema_registry::SchemaRegistry;
use crate::transformation_engine::TransformEngine;
use crate::transforms::TransformContext;
use crate::validation::{ErrorType, RecordValidator, ValidationError};

/// Transformed records bound for one target entity
#[derive(Debug, Clone)]
struct EntityRecords {
    target_service: String,
    target_entity: String,
    records: Vec<TransformedRecord>,
}

/// Drives a migration through extraction, transformation, validation and loading.
///
/// The orchestrator owns the [`MigrationRun`] and is the only writer of its
/// counters. Run control is checked between batches, never inside one.
pub struct MigrationOrchestrator {
    config: MigrationConfig,
    registry: Arc<SchemaRegistry>,
    mapping: Option<MigrationMapping>,
    connectors: Connectors,
    engine: TransformEngine,
    validator: RecordValidator,
    progress: ProgressReporter,
    control: RunControl,
    run: MigrationRun,
    loader: Option<Arc<dyn Loader>>,
    extracted: BTreeMap<String, Vec<SourceRecord>>,
    transformed: Vec<EntityRecords>,
    loaded_entities: Vec<String>,
    error_count: usize,
    report_path: Option<PathBuf>,
}

impl MigrationOrchestrator {
    pub fn new(config: MigrationConfig, registry: Arc<SchemaRegistry>) -> Self {
        let run = MigrationRun::new(&config.name);
        Self {
            config,
            registry,
            mapping: None,
            connectors: Connectors::default(),
            engine: TransformEngine::new(),
            validator: RecordValidator::new(),
            progress: ProgressReporter::disabled(),
            control: RunControl::new(),
            run,
            loader: None,
            extracted: BTreeMap::new(),
            transformed: Vec::new(),
            loaded_entities: Vec::new(),
            error_count: 0,
            report_path: None,
        }
    }

    pub fn with_mapping(mut self, mapping: MigrationMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_connectors(mut self, connectors: Connectors) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    /// Register custom operators before running
    pub fn transform_engine_mut(&mut self) -> &mut TransformEngine {
        &mut self.engine
    }

    /// Register custom field rules before running
    pub fn validator_mut(&mut self) -> &mut RecordValidator {
        &mut self.validator
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn run(&self) -> &MigrationRun {
        &self.run
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    pub fn extracted_records(&self, service: &str, entity: &str) -> &[SourceRecord] {
        self.extracted
            .get(&format!("{}_{}", service, entity))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Records for `entity` that are still in the working set
    pub fn transformed_records(&self, entity: &str) -> Vec<&TransformedRecord> {
        self.transformed
            .iter()
            .filter(|set| set.target_entity == entity)
            .flat_map(|set| set.records.iter())
            .collect()
    }

    /// Add records by hand, replacing anything held for the same service and entity
    pub fn add_source_data(&mut self, service: &str, entity: &str, payloads: Vec<Value>) {
        let source = DataSource::new(DataSourceType::Manual, service, entity);
        let records: Vec<SourceRecord> = payloads
            .into_iter()
            .enumerate()
            .map(|(position, payload)| {
                let id = payload
                    .get("id")
                    .filter(|v| !v.is_null())
                    .map(value_to_string)
                    .unwrap_or_else(|| position.to_string());
                extractor::create_record(&source, id, payload)
            })
            .collect();

        info!(service, entity, count = records.len(), "Added source data");
        self.extracted.insert(source.key(), records);
    }

    /// Execute the whole pipeline. The returned run is always final: failures
    /// are recorded on it rather than returned.
    pub async fn run_migration(&mut self) -> MigrationRun {
        self.run = MigrationRun::new(&self.config.name);
        self.run.description = self.config.description.clone();
        self.run.dry_run = self.config.dry_run;
        self.run.metadata.insert(
            "target_service".to_string(),
            Value::String(self.config.target_service.clone()),
        );
        self.transformed.clear();
        self.loaded_entities.clear();
        self.error_count = 0;

        info!(run_id = %self.run.id, name = %self.run.name, dry_run = self.config.dry_run, "Starting migration");

        if let Err(e) = self.execute().await {
            self.fail(e);
        }

        self.run.update_totals();
        self.save_report().await;
        self.progress.complete(&self.run);

        info!(
            run_id = %self.run.id,
            status = %self.run.status,
            processed = self.run.total_records_processed,
            failed = self.run.total_records_failed,
            "Migration finished"
        );
        self.run.clone()
    }

    async fn execute(&mut self) -> Result<(), MigrationError> {
        self.config.check()?;
        let mapping = self.resolve_mapping()?;
        self.run.mapping_name = Some(mapping.name.clone());
        self.preflight(&mapping)?;

        self.enter(MigrationStatus::Extracting, "=== PHASE 1: EXTRACTION ===")?;
        self.run_extraction().await?;

        self.enter(MigrationStatus::Transforming, "=== PHASE 2: TRANSFORMATION ===")?;
        self.run_transformation(&mapping).await?;

        self.enter(MigrationStatus::Validating, "=== PHASE 3: VALIDATION ===")?;
        self.run_validation().await?;

        self.enter(MigrationStatus::Loading, "=== PHASE 4: LOADING ===")?;
        self.run_loading(&mapping).await?;

        self.enter(MigrationStatus::Completed, "=== MIGRATION COMPLETED ===")
    }

    fn enter(&mut self, phase: MigrationStatus, banner: &str) -> Result<(), MigrationError> {
        self.run.transition(phase)?;
        info!("{}", banner);
        Ok(())
    }

    fn fail(&mut self, e: MigrationError) {
        let phase = match self.run.status {
            MigrationStatus::Paused => self.run.paused_from.unwrap_or(MigrationStatus::Paused),
            status => status,
        };

        if matches!(e, MigrationError::Cancelled) {
            warn!(phase = %phase, "Migration cancelled");
            if let Err(e) = self.run.transition(MigrationStatus::Cancelled) {
                error!("{}", e);
            }
            return;
        }

        error!(phase = %phase, "Migration failed: {}", e);
        self.run.record_error(phase, e.to_string());
        self.progress.error(phase, e.to_string());
        if let Err(e) = self.run.transition(MigrationStatus::Failed) {
            error!("{}", e);
        }
    }

    /// The mapping to run with: the one supplied, else the configured mapping file
    fn resolve_mapping(&mut self) -> Result<MigrationMapping, MigrationError> {
        if self.mapping.is_none() {
            if let Some(path) = &self.config.mapping_file {
                info!(path = %path, "Loading mapping file");
                self.mapping = Some(MigrationMapping::from_file(path)?);
            }
        }

        self.mapping.clone().ok_or_else(|| {
            MigrationError::Config(
                "No migration mapping configured; supply a mapping or mapping_file".to_string(),
            )
        })
    }

    /// Check every entity mapping whose schemas are both known before records flow
    fn preflight(&self, mapping: &MigrationMapping) -> Result<(), MigrationError> {
        let mut problems = Vec::new();

        for entity_mapping in &mapping.entity_mappings {
            let source = self
                .registry
                .get_entity_schema(&entity_mapping.source_service, &entity_mapping.source_entity);
            let target = self
                .registry
                .get_entity_schema(&entity_mapping.target_service, &entity_mapping.target_entity);

            if source.is_none() || target.is_none() {
                warn!(
                    mapping = %entity_mapping.name,
                    "Skipping mapping validation, source or target schema not registered"
                );
                continue;
            }

            let report = self.registry.validate_mapping(entity_mapping);
            for warning in &report.warnings {
                warn!(mapping = %entity_mapping.name, field = %warning.field, "{}", warning.message);
            }
            if report.has_errors() {
                problems.push(format!("{}: {}", entity_mapping.name, report.error_summary()));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::Config(format!(
                "Mapping validation failed: {}",
                problems.join("; ")
            )))
        }
    }

    /// Honour pause and cancel requests. Called only between batches.
    async fn checkpoint(&mut self) -> Result<(), MigrationError> {
        match self.control.signal() {
            RunSignal::Running => Ok(()),
            RunSignal::Cancelled => Err(MigrationError::Cancelled),
            RunSignal::Paused => {
                let phase = self.run.status;
                self.run.transition(MigrationStatus::Paused)?;
                info!(phase = %phase, "Migration paused");

                match self.control.wait_while_paused().await {
                    RunSignal::Cancelled => Err(MigrationError::Cancelled),
                    _ => {
                        self.run.transition(phase)?;
                        info!(phase = %phase, "Migration resumed");
                        Ok(())
                    }
                }
            }
        }
    }

    fn finish_step(&mut self, mut step: MigrationStep, outcome: &Result<(), MigrationError>) {
        step.finish(match outcome {
            Ok(()) => MigrationStatus::Completed,
            Err(MigrationError::Cancelled) => MigrationStatus::Cancelled,
            Err(_) => MigrationStatus::Failed,
        });
        if let Err(e) = outcome {
            if !matches!(e, MigrationError::Cancelled) {
                step.errors.push(StepError::new(e.to_string()));
            }
        }
        self.progress.step_complete(&step);
        self.run.current_step = Some(step.id.clone());
        self.run.steps.push(step);
        self.run.update_totals();
    }

    fn check_error_budget(&self, phase: MigrationStatus) -> Result<(), MigrationError> {
        if self.error_count > self.config.max_errors {
            return Err(MigrationError::MaxErrorsExceeded {
                phase,
                count: self.error_count,
                max: self.config.max_errors,
            });
        }
        Ok(())
    }

    async fn run_extraction(&mut self) -> Result<(), MigrationError> {
        let sources = self.config.sources.clone();
        let connectors = self.connectors.clone();
        let connectors = &connectors;

        let mut extractions = stream::iter(sources)
            .map(|source| async move {
                let started_at = Utc::now();
                let outcome = extract_source(connectors, &source).await;
                (source, started_at, outcome)
            })
            .buffered(self.config.parallel_workers.max(1));

        while let Some((source, started_at, outcome)) = extractions.next().await {
            let mut step = MigrationStep::new(
                format!("Extract {} from {}", source.entity, source.service),
                &source.entity,
            );
            step.start(MigrationStatus::Extracting);
            step.started_at = Some(started_at);

            let outcome = match outcome {
                Ok(result) => {
                    self.absorb_extraction(&source, result, &mut step).await;
                    Ok(())
                }
                Err(e) => {
                    error!(service = %source.service, entity = %source.entity, "Extraction failed: {}", e);
                    Err(MigrationError::from(e))
                }
            };

            let failed = outcome.is_err();
            self.finish_step(step, &outcome);
            if failed && !self.config.continue_on_error {
                return outcome;
            }
            self.checkpoint().await?;
        }

        Ok(())
    }

    async fn absorb_extraction(
        &mut self,
        source: &DataSource,
        result: ExtractionResult,
        step: &mut MigrationStep,
    ) {
        let key = source.key();
        step.records_processed = result.total_extracted + result.errors.len();
        step.records_succeeded = result.total_extracted;
        step.records_failed = result.errors.len();
        step.errors.extend(result.errors);
        step.warnings.extend(result.warnings);

        info!(
            service = %source.service,
            entity = %source.entity,
            count = result.total_extracted,
            "Extracted {} {} records from {}",
            result.total_extracted,
            source.entity,
            source.service
        );

        if self.config.save_extracted {
            if let Err(e) = self.write_artifact("extracted", &key, &result.records).await {
                error!("{}", e);
                step.warnings.push(e.to_string());
            }
        }

        self.progress.progress(
            MigrationStatus::Extracting,
            step,
            result.total_extracted,
            format!("Extracted {} from {}", source.entity, source.service),
        );
        self.extracted.entry(key).or_default().extend(result.records);
    }

    fn transform_context(&self, mapping: &MigrationMapping) -> TransformContext {
        TransformContext {
            lookup_tables: self.config.lookup_tables.clone(),
            status_mappings: mapping.status_mappings.clone(),
        }
    }

    async fn run_transformation(&mut self, mapping: &MigrationMapping) -> Result<(), MigrationError> {
        let ctx = self.transform_context(mapping);

        for entity_mapping in &mapping.entity_mappings {
            let key = format!("{}_{}", entity_mapping.source_service, entity_mapping.source_entity);
            let mut step = MigrationStep::new(
                format!(
                    "Transform {} to {}",
                    entity_mapping.source_entity, entity_mapping.target_entity
                ),
                &entity_mapping.target_entity,
            );
            step.start(MigrationStatus::Transforming);

            let sources = self.extracted.get(&key).cloned().unwrap_or_default();
            if sources.is_empty() {
                warn!(mapping = %entity_mapping.name, "No source data found for {}", key);
                step.warnings.push(format!("No source data found for {}", key));
                self.finish_step(step, &Ok(()));
                continue;
            }

            let mut transformed = Vec::with_capacity(sources.len());
            let outcome = self
                .transform_records(&sources, entity_mapping, &ctx, &mut step, &mut transformed)
                .await;

            info!(
                entity = %entity_mapping.target_entity,
                succeeded = step.records_succeeded,
                failed = step.records_failed,
                "Transformed {} {} records",
                transformed.len(),
                entity_mapping.target_entity
            );
            self.push_transformed(entity_mapping, transformed);
            self.finish_step(step, &outcome);
            outcome?;
        }

        if self.config.save_transformed {
            for set in &self.transformed {
                let key = format!("{}_{}", set.target_service, set.target_entity);
                if let Err(e) = self.write_artifact("transformed", &key, &set.records).await {
                    error!("{}", e);
                }
            }
        }

        Ok(())
    }

    async fn transform_records(
        &mut self,
        sources: &[SourceRecord],
        entity_mapping: &EntityMapping,
        ctx: &TransformContext,
        step: &mut MigrationStep,
        transformed: &mut Vec<TransformedRecord>,
    ) -> Result<(), MigrationError> {
        let total = sources.len();

        for chunk in sources.chunks(self.config.batch_size) {
            for source in chunk {
                step.records_processed += 1;
                match self.engine.transform(
                    std::slice::from_ref(source),
                    entity_mapping,
                    &entity_mapping.target_service,
                    &entity_mapping.target_entity,
                    ctx,
                ) {
                    Ok(record) => {
                        let field_errors: Vec<ValidationError> = record
                            .validation_errors
                            .iter()
                            .filter(|e| e.error_type == ErrorType::Transform)
                            .cloned()
                            .collect();

                        if field_errors.is_empty() {
                            step.records_succeeded += 1;
                        } else {
                            warn!(
                                record_id = %record.id,
                                mapping = %entity_mapping.name,
                                errors = field_errors.len(),
                                "Record has transform errors"
                            );
                            step.records_failed += 1;
                            step.errors.push(
                                StepError::for_record(&record.id, "Record failed to transform")
                                    .with_errors(field_errors),
                            );
                            self.error_count += 1;
                        }
                        // kept so validation drops it with its full error list
                        transformed.push(record);
                    }
                    Err(e) => {
                        error!(record_id = %source.id, mapping = %entity_mapping.name, "Transform failed: {}", e);
                        step.records_failed += 1;
                        step.errors.push(StepError::for_record(&source.id, e.to_string()));
                        self.error_count += 1;
                    }
                }
            }

            self.progress.progress(
                MigrationStatus::Transforming,
                step,
                total,
                format!("Transformed {} of {}", step.records_processed, total),
            );
            self.check_error_budget(MigrationStatus::Transforming)?;
            self.checkpoint().await?;
        }

        Ok(())
    }

    fn push_transformed(&mut self, entity_mapping: &EntityMapping, records: Vec<TransformedRecord>) {
        let existing = self.transformed.iter_mut().find(|set| {
            set.target_service == entity_mapping.target_service
                && set.target_entity == entity_mapping.target_entity
        });
        match existing {
            Some(set) => set.records.extend(records),
            None => self.transformed.push(EntityRecords {
                target_service: entity_mapping.target_service.clone(),
                target_entity: entity_mapping.target_entity.clone(),
                records,
            }),
        }
    }

    async fn run_validation(&mut self) -> Result<(), MigrationError> {
        for index in 0..self.transformed.len() {
            let service = self.transformed[index].target_service.clone();
            let entity = self.transformed[index].target_entity.clone();
            let records = std::mem::take(&mut self.transformed[index].records);

            let mut step = MigrationStep::new(format!("Validate {}", entity), &entity);
            step.start(MigrationStatus::Validating);

            let mut kept = Vec::with_capacity(records.len());
            let outcome = self
                .validate_records(records, &service, &entity, &mut step, &mut kept)
                .await;

            info!(
                entity = %entity,
                valid = step.records_succeeded,
                dropped = step.records_failed,
                "Validated {} records",
                entity
            );
            self.transformed[index].records = kept;
            self.finish_step(step, &outcome);
            outcome?;
        }

        Ok(())
    }

    async fn validate_records(
        &mut self,
        records: Vec<TransformedRecord>,
        service: &str,
        entity: &str,
        step: &mut MigrationStep,
        kept: &mut Vec<TransformedRecord>,
    ) -> Result<(), MigrationError> {
        let registry = Arc::clone(&self.registry);
        let schema = registry.get_entity_schema(service, entity);
        if schema.is_none() {
            warn!(service, entity, "No target schema registered, skipping schema validation");
            step.warnings.push(format!(
                "No target schema registered for {}.{}; records not validated against a schema",
                service, entity
            ));
        }

        let total = records.len();
        let mut remaining = records.into_iter();
        loop {
            let chunk: Vec<TransformedRecord> =
                remaining.by_ref().take(self.config.batch_size).collect();
            if chunk.is_empty() {
                break;
            }

            for mut record in chunk {
                step.records_processed += 1;
                if let Some(schema) = schema {
                    let errors = self
                        .validator
                        .validate(&record, schema, self.config.strict_validation);
                    record.validation_errors.extend(errors);
                }

                if record.is_valid() {
                    record.status = RecordStatus::Validated;
                    step.records_succeeded += 1;
                    kept.push(record);
                } else {
                    record.status = RecordStatus::Failed;
                    step.records_failed += 1;
                    warn!(
                        record_id = %record.id,
                        entity,
                        errors = ?record.validation_errors,
                        "Dropping invalid record"
                    );
                    step.errors.push(
                        StepError::for_record(&record.id, "Record failed validation")
                            .with_errors(record.validation_errors),
                    );
                }
            }

            self.progress.progress(
                MigrationStatus::Validating,
                step,
                total,
                format!("Validated {} of {}", step.records_processed, total),
            );
            self.checkpoint().await?;
        }

        Ok(())
    }

    /// Working set grouped by target entity, in load order
    fn load_plan(&self, mapping: &MigrationMapping) -> Vec<(String, Vec<TransformedRecord>)> {
        let mut entities: Vec<String> = Vec::new();
        for name in mapping.target_entity_order() {
            if self.transformed.iter().any(|set| set.target_entity == name) && !entities.contains(&name) {
                entities.push(name);
            }
        }
        for set in &self.transformed {
            if !entities.contains(&set.target_entity) {
                entities.push(set.target_entity.clone());
            }
        }

        entities
            .into_iter()
            .map(|entity| {
                let records = self
                    .transformed
                    .iter()
                    .filter(|set| set.target_entity == entity)
                    .flat_map(|set| set.records.iter().cloned())
                    .collect();
                (entity, records)
            })
            .collect()
    }

    async fn run_loading(&mut self, mapping: &MigrationMapping) -> Result<(), MigrationError> {
        let loader = self.connectors.build_loader(&self.config)?;
        if !loader.validate_connection().await {
            return Err(MigrationError::Connection(self.config.target_service.clone()));
        }
        self.loader = Some(Arc::clone(&loader));

        for (entity, records) in self.load_plan(mapping) {
            let mut step = MigrationStep::new(format!("Load {}", entity), &entity);
            step.start(MigrationStatus::Loading);

            let records = if self.config.deduplication.is_empty() {
                records
            } else {
                let before = records.len();
                let deduplicated = dedup::deduplicate(
                    records,
                    self.config.dedup_key(&entity),
                    &self.config.dedup_preferred_source,
                );
                step.records_skipped = before - deduplicated.len();
                info!(entity = %entity, before, after = deduplicated.len(), "Deduplicated records");
                deduplicated
            };

            self.loaded_entities.push(entity.clone());
            let outcome = self.load_entity(&loader, &entity, &records, &mut step).await;

            info!(
                entity = %entity,
                "Loaded {}/{} {} records",
                step.records_succeeded,
                step.records_processed,
                entity
            );
            self.finish_step(step, &outcome);
            outcome?;
        }

        Ok(())
    }

    async fn load_entity(
        &mut self,
        loader: &Arc<dyn Loader>,
        entity: &str,
        records: &[TransformedRecord],
        step: &mut MigrationStep,
    ) -> Result<(), MigrationError> {
        let total = records.len();
        let batch_size = self.config.batch_size;
        let batches = (total + batch_size - 1) / batch_size;

        for (index, batch) in records.chunks(batch_size).enumerate() {
            let result = loader.load_batch(batch, entity, self.config.upsert).await;
            debug!(
                entity,
                batch = index + 1,
                attempted = result.total_attempted,
                failed = result.total_failed,
                "Loaded batch"
            );

            step.records_processed += result.total_attempted;
            step.records_succeeded += result.total_succeeded;
            step.records_failed += result.total_failed;
            step.records_skipped += result.total_skipped;
            step.errors.extend(result.errors);
            self.error_count += result.total_failed;
            self.run.add_rollback_ids(entity, result.created_ids);

            self.progress.progress(
                MigrationStatus::Loading,
                step,
                total,
                format!("Loaded batch {} of {}", index + 1, batches),
            );
            self.check_error_budget(MigrationStatus::Loading)?;
            self.checkpoint().await?;
        }

        Ok(())
    }

    /// Delete everything the run created, entities in reverse load order.
    ///
    /// Returns the number of records actually deleted per entity.
    pub async fn rollback(&mut self) -> Result<BTreeMap<String, usize>, MigrationError> {
        let loader = self
            .loader
            .clone()
            .ok_or_else(|| MigrationError::Config("No loader available for rollback".to_string()))?;

        self.run.transition(MigrationStatus::RollingBack)?;
        info!(run_id = %self.run.id, "Starting rollback");

        let mut entities: Vec<String> = self.loaded_entities.iter().rev().cloned().collect();
        for entity in self.run.rollback_data.keys() {
            if !entities.contains(entity) {
                entities.push(entity.clone());
            }
        }

        let mut deleted = BTreeMap::new();
        for entity in entities {
            let ids = self.run.rollback_data.get(&entity).cloned().unwrap_or_default();
            let mut count = 0;
            for id in &ids {
                match loader.delete_record(&entity, id).await {
                    Ok(true) => count += 1,
                    Ok(false) => warn!(entity = %entity, record_id = %id, "Record not deleted"),
                    Err(e) => error!(entity = %entity, record_id = %id, "Failed to delete: {}", e),
                }
            }
            info!(entity = %entity, "Rolled back {} of {} records", count, ids.len());
            deleted.insert(entity, count);
        }

        self.run.transition(MigrationStatus::RolledBack)?;
        self.run
            .metadata
            .insert("rollback".to_string(), serde_json::to_value(&deleted).unwrap_or_default());
        self.save_report().await;
        Ok(deleted)
    }

    /// Transform one payload without running the pipeline.
    ///
    /// The record is checked against the target schema when one is registered.
    pub fn preview_transformation(
        &self,
        payload: Value,
        source_service: &str,
        source_entity: &str,
        target_service: &str,
        target_entity: &str,
    ) -> Result<TransformedRecord, MigrationError> {
        let entity_mapping = self
            .mapping
            .as_ref()
            .and_then(|m| {
                m.entity_mappings
                    .iter()
                    .find(|em| em.matches(source_service, source_entity, target_service, target_entity))
            })
            .or_else(|| {
                self.registry
                    .get_entity_mapping(source_service, source_entity, target_service, target_entity)
            })
            .ok_or_else(|| {
                MigrationError::Config(format!(
                    "No mapping found for {}.{} -> {}.{}",
                    source_service, source_entity, target_service, target_entity
                ))
            })?;

        let id = payload
            .get("id")
            .filter(|v| !v.is_null())
            .map(value_to_string)
            .unwrap_or_else(|| "preview".to_string());
        let source = SourceRecord::new(id, source_service, source_entity, payload);

        let ctx = match &self.mapping {
            Some(mapping) => self.transform_context(mapping),
            None => TransformContext {
                lookup_tables: self.config.lookup_tables.clone(),
                ..TransformContext::default()
            },
        };

        let mut record = self.engine.transform(
            std::slice::from_ref(&source),
            entity_mapping,
            target_service,
            target_entity,
            &ctx,
        )?;

        if let Some(schema) = self.registry.get_entity_schema(target_service, target_entity) {
            let errors = self
                .validator
                .validate(&record, schema, self.config.strict_validation);
            record.validation_errors.extend(errors);
        }

        Ok(record)
    }

    async fn write_artifact<T: Serialize + ?Sized>(
        &self,
        dir: &str,
        key: &str,
        value: &T,
    ) -> Result<PathBuf, MigrationError> {
        let dir = Path::new(&self.config.output_dir).join(dir);
        let path = dir.join(format!("{}.json", key));
        let artifact_error = |e: String| MigrationError::Artifact(path.display().to_string(), e);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| artifact_error(e.to_string()))?;
        let content = serde_json::to_vec_pretty(value).map_err(|e| artifact_error(e.to_string()))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| artifact_error(e.to_string()))?;

        debug!(path = %path.display(), "Wrote artifact");
        Ok(path)
    }

    async fn save_report(&mut self) {
        let key = format!("migration_report_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        match self.write_artifact("logs", &key, &self.run).await {
            Ok(path) => {
                info!(path = %path.display(), "Saved migration report");
                self.report_path = Some(path);
            }
            Err(e) => error!("Failed to save migration report: {}", e),
        }
    }
}

async fn extract_source(
    connectors: &Connectors,
    source: &DataSource,
) -> Result<ExtractionResult, ExtractorError> {
    let extractor = connectors.build_extractor(source)?;
    let problems = extractor.validate_source();
    if !problems.is_empty() {
        return Err(ExtractorError::InvalidSource(problems.join("; ")));
    }
    extractor.extract().await
}
