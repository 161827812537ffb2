//! End-to-end tests for the migration orchestrator.
//!
//! These drive the real orchestrator with an in-memory extractor and a
//! recording loader standing in for the target service.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use saas_migrate::loader::load_batch_sequential;
use saas_migrate::{
    Connectors, DataSource, DataSourceType, EntityMapping, EntitySchema, Extractor,
    FieldDefinition, FieldMapping, FieldType, InMemoryExtractor, LoadResult, Loader, LoaderError,
    MigrationConfig, MigrationMapping, MigrationOrchestrator, MigrationResult, MigrationStatus,
    ProgressEvent, ProgressReporter, RunControl, SchemaRegistry, ServiceSchema, TransformType,
    TransformedRecord,
};

#[derive(Default)]
struct LoaderState {
    batches: Vec<(String, Vec<String>)>,
    loaded: Vec<TransformedRecord>,
    deleted: Vec<(String, String)>,
}

// Mock loader that records every call
struct RecordingLoader {
    state: Arc<Mutex<LoaderState>>,
    fail_ids: Vec<String>,
    connected: bool,
}

#[async_trait::async_trait]
impl Loader for RecordingLoader {
    fn target_service(&self) -> &str {
        "chargebee"
    }

    async fn load_record(
        &self,
        record: &TransformedRecord,
        _upsert: bool,
    ) -> Result<MigrationResult, LoaderError> {
        if self.fail_ids.contains(&record.id) {
            return Err(LoaderError::Request {
                service: "chargebee".to_string(),
                message: format!("rejected {}", record.id),
            });
        }
        self.state.lock().unwrap().loaded.push(record.clone());
        Ok(MigrationResult::success(record, record.id.clone()))
    }

    async fn load_batch(
        &self,
        records: &[TransformedRecord],
        entity: &str,
        upsert: bool,
    ) -> LoadResult {
        let ids = records.iter().map(|r| r.id.clone()).collect();
        self.state.lock().unwrap().batches.push((entity.to_string(), ids));
        load_batch_sequential(self, records, entity, upsert).await
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<bool, LoaderError> {
        self.state
            .lock()
            .unwrap()
            .deleted
            .push((entity.to_string(), id.to_string()));
        Ok(true)
    }

    async fn validate_connection(&self) -> bool {
        self.connected
    }
}

struct Harness {
    payloads: HashMap<String, Vec<Value>>,
    state: Arc<Mutex<LoaderState>>,
    fail_ids: Vec<String>,
    connected: bool,
}

impl Harness {
    fn new() -> Self {
        Self {
            payloads: HashMap::new(),
            state: Arc::new(Mutex::new(LoaderState::default())),
            fail_ids: Vec::new(),
            connected: true,
        }
    }

    fn with_source(mut self, service: &str, entity: &str, records: Vec<Value>) -> Self {
        self.payloads.insert(format!("{}_{}", service, entity), records);
        self
    }

    fn failing(mut self, id: &str) -> Self {
        self.fail_ids.push(id.to_string());
        self
    }

    fn connectors(&self) -> Connectors {
        let mut connectors = Connectors::default();

        let payloads = self.payloads.clone();
        connectors.register_extractor(DataSourceType::Manual, move |source| {
            let records = payloads.get(&source.key()).cloned().unwrap_or_default();
            Ok(Box::new(InMemoryExtractor::from_values(source.clone(), records)) as Box<dyn Extractor>)
        });

        let state = Arc::clone(&self.state);
        let fail_ids = self.fail_ids.clone();
        let connected = self.connected;
        connectors.register_loader("chargebee", move |_config| {
            Ok(Arc::new(RecordingLoader {
                state: Arc::clone(&state),
                fail_ids: fail_ids.clone(),
                connected,
            }) as Arc<dyn Loader>)
        });

        connectors
    }

    fn config(&self, output_dir: &std::path::Path) -> MigrationConfig {
        let mut config = MigrationConfig::new("pipeline-test", "chargebee");
        config.output_dir = output_dir.display().to_string();
        let mut keys: Vec<&String> = self.payloads.keys().collect();
        keys.sort();
        for key in keys {
            let (service, entity) = key.split_once('_').unwrap();
            config
                .sources
                .push(DataSource::new(DataSourceType::Manual, service, entity));
        }
        config
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batches.iter().map(|(_, ids)| ids.len()).collect()
    }
}

fn customer_registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register_schema(
        ServiceSchema::new("chargebee").with_entity(
            EntitySchema::new("customer")
                .with_field(FieldDefinition::new("first_name", FieldType::String).required())
                .with_field(FieldDefinition::new("email", FieldType::String).required()),
        ),
    );
    Arc::new(registry)
}

fn customer_mapping(source_service: &str, source_entity: &str) -> EntityMapping {
    EntityMapping::new(
        format!("{}_customers", source_service),
        (source_service, source_entity),
        ("chargebee", "customer"),
        vec![
            FieldMapping::direct("id", "id"),
            FieldMapping::direct("email", "email"),
            FieldMapping::direct("id", &format!("meta_data.{}_id", source_service)),
        ],
    )
}

#[tokio::test]
async fn test_split_name_scenario_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new().with_source(
        "crm",
        "contact",
        vec![json!({"name": "Jane Doe", "email": "jane@x.com"})],
    );

    let mapping = MigrationMapping::new("crm-to-chargebee", "chargebee").with_entity_mapping(
        EntityMapping::new(
            "contacts",
            ("crm", "contact"),
            ("chargebee", "customer"),
            vec![
                FieldMapping::new(Some("name"), "first_name", TransformType::SplitName)
                    .with_config(json!({"part": "first"})),
                FieldMapping::new(Some("email"), "email", TransformType::Direct),
            ],
        ),
    );

    let mut orchestrator = MigrationOrchestrator::new(harness.config(dir.path()), customer_registry())
        .with_mapping(mapping)
        .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Completed);
    let state = harness.state.lock().unwrap();
    assert_eq!(state.loaded.len(), 1);
    let record = &state.loaded[0];
    assert!(record.is_valid());
    assert_eq!(record.id, "crm_0");
    assert_eq!(
        Value::Object(record.data.clone()),
        json!({"first_name": "Jane", "email": "jane@x.com"})
    );

    assert!(dir.path().join("extracted/crm_contact.json").is_file());
    assert!(dir.path().join("transformed/chargebee_customer.json").is_file());
    let report = std::fs::read_to_string(orchestrator.report_path().unwrap()).unwrap();
    let report: Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["status"], "completed");
    assert_eq!(report["rollback_data"]["customer"], json!(["crm_0"]));
}

#[tokio::test]
async fn test_dedup_prefers_configured_source() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new()
        .with_source("salesforce", "contact", vec![json!({"id": "003", "email": "A@x.com"})])
        .with_source("stripe", "customer", vec![json!({"id": "cus_1", "email": "a@x.com"})]);

    let mapping = MigrationMapping::new("merge", "chargebee")
        .with_entity_mapping(customer_mapping("salesforce", "contact"))
        .with_entity_mapping(customer_mapping("stripe", "customer"));

    let mut config = harness.config(dir.path());
    config
        .deduplication
        .insert("customer".to_string(), "email".to_string());
    config.dedup_preferred_source = "stripe".to_string();

    let mut orchestrator = MigrationOrchestrator::new(config, Arc::new(SchemaRegistry::new()))
        .with_mapping(mapping)
        .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Completed);
    let state = harness.state.lock().unwrap();
    assert_eq!(state.loaded.len(), 1);
    assert_eq!(state.loaded[0].id, "cus_1");
    assert_eq!(
        state.loaded[0].data["meta_data"],
        json!({"stripe_id": "cus_1", "salesforce_id": "003"})
    );

    let load_step = run.steps.iter().find(|s| s.name == "Load customer").unwrap();
    assert_eq!(load_step.records_skipped, 1);
}

#[tokio::test]
async fn test_fixed_size_batches_survive_record_errors() {
    let dir = tempfile::tempdir().unwrap();
    let records = (0..25)
        .map(|i| json!({"id": format!("r{}", i), "email": format!("r{}@x.com", i)}))
        .collect();
    let harness = Harness::new()
        .with_source("stripe", "customer", records)
        .failing("r13");

    let mut config = harness.config(dir.path());
    config.batch_size = 10;

    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(customer_mapping("stripe", "customer"));
    let mut orchestrator = MigrationOrchestrator::new(config, Arc::new(SchemaRegistry::new()))
        .with_mapping(mapping)
        .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Completed);
    assert_eq!(harness.batch_sizes(), vec![10, 10, 5]);
    {
        let state = harness.state.lock().unwrap();
        let first_ids: Vec<&str> = state.batches[0].1.iter().map(String::as_str).collect();
        assert_eq!(first_ids[0], "r0");
        assert_eq!(state.batches[2].1[0], "r20");
        // the other nine records of the failing batch were still attempted
        let second_batch_loaded = state
            .loaded
            .iter()
            .filter(|r| state.batches[1].1.contains(&r.id))
            .count();
        assert_eq!(second_batch_loaded, 9);
    }

    let load_step = run.steps.iter().find(|s| s.name == "Load customer").unwrap();
    assert_eq!(load_step.records_processed, 25);
    assert_eq!(load_step.records_succeeded, 24);
    assert_eq!(load_step.records_failed, 1);
    assert_eq!(load_step.errors[0].record_id.as_deref(), Some("r13"));
    assert_eq!(run.rollback_data["customer"].len(), 24);
}

#[tokio::test]
async fn test_error_budget_aborts_loading() {
    let dir = tempfile::tempdir().unwrap();
    let records = (0..25).map(|i| json!({"id": format!("r{}", i)})).collect();
    let harness = Harness::new()
        .with_source("stripe", "customer", records)
        .failing("r3");

    let mut config = harness.config(dir.path());
    config.batch_size = 10;
    config.max_errors = 0;

    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(customer_mapping("stripe", "customer"));
    let mut orchestrator = MigrationOrchestrator::new(config, Arc::new(SchemaRegistry::new()))
        .with_mapping(mapping)
        .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Failed);
    assert_eq!(harness.batch_sizes(), vec![10]);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].phase, MigrationStatus::Loading);
    assert!(run.errors[0].message.contains("Max errors"));
    assert_eq!(run.total_records_failed, 1);
}

#[tokio::test]
async fn test_missing_mapping_is_a_hard_failure() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new().with_source("stripe", "customer", vec![json!({"id": "cus_1"})]);

    let mut orchestrator =
        MigrationOrchestrator::new(harness.config(dir.path()), Arc::new(SchemaRegistry::new()))
            .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Failed);
    assert!(run.errors[0].message.contains("No migration mapping"));
    assert!(harness.batch_sizes().is_empty());
    assert!(orchestrator.report_path().is_some());
}

#[tokio::test]
async fn test_unreachable_target_fails_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new().with_source("stripe", "customer", vec![json!({"id": "cus_1"})]);
    harness.connected = false;

    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(customer_mapping("stripe", "customer"));
    let mut orchestrator =
        MigrationOrchestrator::new(harness.config(dir.path()), Arc::new(SchemaRegistry::new()))
            .with_mapping(mapping)
            .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Failed);
    assert_eq!(run.errors[0].phase, MigrationStatus::Loading);
    assert!(harness.batch_sizes().is_empty());
}

#[tokio::test]
async fn test_pause_then_resume_completes() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new().with_source("stripe", "customer", vec![json!({"id": "cus_1"})]);
    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(customer_mapping("stripe", "customer"));

    let control = RunControl::new();
    control.pause();
    let (progress, mut events) = ProgressReporter::channel();

    let mut orchestrator =
        MigrationOrchestrator::new(harness.config(dir.path()), Arc::new(SchemaRegistry::new()))
            .with_mapping(mapping)
            .with_connectors(harness.connectors())
            .with_progress(progress)
            .with_control(control.clone());

    let state = Arc::clone(&harness.state);
    let (run, _) = tokio::join!(orchestrator.run_migration(), async {
        while let Some(event) = events.recv().await {
            if matches!(event, ProgressEvent::StepComplete { .. }) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.lock().unwrap().batches.is_empty());
        control.resume();
    });

    assert_eq!(run.status, MigrationStatus::Completed);
    assert_eq!(harness.batch_sizes(), vec![1]);
}

#[tokio::test]
async fn test_cancel_while_paused() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new().with_source("stripe", "customer", vec![json!({"id": "cus_1"})]);
    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(customer_mapping("stripe", "customer"));

    let control = RunControl::new();
    control.pause();
    let (progress, mut events) = ProgressReporter::channel();

    let mut orchestrator =
        MigrationOrchestrator::new(harness.config(dir.path()), Arc::new(SchemaRegistry::new()))
            .with_mapping(mapping)
            .with_connectors(harness.connectors())
            .with_progress(progress)
            .with_control(control.clone());

    let (run, _) = tokio::join!(orchestrator.run_migration(), async {
        while let Some(event) = events.recv().await {
            if matches!(event, ProgressEvent::StepComplete { .. }) {
                break;
            }
        }
        control.cancel();
    });

    assert_eq!(run.status, MigrationStatus::Cancelled);
    assert_eq!(run.steps.len(), 1);
    assert!(run.errors.is_empty());
    assert!(harness.batch_sizes().is_empty());
}

#[tokio::test]
async fn test_rollback_runs_in_reverse_load_order() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new()
        .with_source("stripe", "customer", vec![json!({"id": "cus_1"}), json!({"id": "cus_2"})])
        .with_source("stripe", "subscription", vec![json!({"id": "sub_1", "customer": "cus_1"})]);

    // subscriptions are listed first but depend on customers
    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(
            EntityMapping::new(
                "subscriptions",
                ("stripe", "subscription"),
                ("chargebee", "subscription"),
                vec![
                    FieldMapping::direct("id", "id"),
                    FieldMapping::direct("customer", "customer_id"),
                ],
            )
            .with_dependencies(["customers"]),
        )
        .with_entity_mapping(EntityMapping::new(
            "customers",
            ("stripe", "customer"),
            ("chargebee", "customer"),
            vec![FieldMapping::direct("id", "id")],
        ));

    let mut orchestrator =
        MigrationOrchestrator::new(harness.config(dir.path()), Arc::new(SchemaRegistry::new()))
            .with_mapping(mapping)
            .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;
    assert_eq!(run.status, MigrationStatus::Completed);

    let entities: Vec<String> = harness
        .state
        .lock()
        .unwrap()
        .batches
        .iter()
        .map(|(entity, _)| entity.clone())
        .collect();
    assert_eq!(entities, vec!["customer", "subscription"]);

    let deleted = orchestrator.rollback().await.unwrap();
    assert_eq!(deleted["customer"], 2);
    assert_eq!(deleted["subscription"], 1);
    assert_eq!(orchestrator.run().status, MigrationStatus::RolledBack);

    let state = harness.state.lock().unwrap();
    assert_eq!(
        state.deleted[0],
        ("subscription".to_string(), "sub_1".to_string())
    );
    assert_eq!(state.deleted.len(), 3);
}

#[tokio::test]
async fn test_file_source_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("customers.json");
    std::fs::write(
        &export,
        r#"{"data": [{"id": "cus_1", "email": "a@x.com"}, {"id": "cus_2", "email": "b@x.com"}]}"#,
    )
    .unwrap();

    let mut config = MigrationConfig::new("dry", "chargebee");
    config.dry_run = true;
    config.output_dir = dir.path().join("out").display().to_string();
    config.sources.push(
        DataSource::new(DataSourceType::Json, "stripe", "customer")
            .with_file_path(export.display().to_string()),
    );

    let mapping = MigrationMapping::new("m", "chargebee")
        .with_entity_mapping(customer_mapping("stripe", "customer"));
    let mut orchestrator = MigrationOrchestrator::new(config, Arc::new(SchemaRegistry::new()))
        .with_mapping(mapping);
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Completed);
    assert!(run.dry_run);
    assert_eq!(run.rollback_data["customer"], vec!["cus_1", "cus_2"]);
    assert!(dir.path().join("out/extracted/stripe_customer.json").is_file());
}

fn colliding_mapping() -> MigrationMapping {
    // `contact` is written as a string, so writing `contact.id` below it fails
    MigrationMapping::new("m", "chargebee").with_entity_mapping(EntityMapping::new(
        "customers",
        ("stripe", "customer"),
        ("chargebee", "customer"),
        vec![
            FieldMapping::direct("email", "contact"),
            FieldMapping::direct("id", "contact.id"),
        ],
    ))
}

#[tokio::test]
async fn test_transform_errors_count_against_error_budget() {
    let dir = tempfile::tempdir().unwrap();
    let records = (0..5)
        .map(|i| json!({"id": format!("r{}", i), "email": format!("r{}@x.com", i)}))
        .collect();
    let harness = Harness::new().with_source("stripe", "customer", records);

    let mut config = harness.config(dir.path());
    config.max_errors = 0;

    let mut orchestrator = MigrationOrchestrator::new(config, Arc::new(SchemaRegistry::new()))
        .with_mapping(colliding_mapping())
        .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Failed);
    assert_eq!(run.errors[0].phase, MigrationStatus::Transforming);
    assert!(run.errors[0].message.contains("Max errors"));
    assert!(harness.batch_sizes().is_empty());

    let step = run.steps.iter().find(|s| s.name.starts_with("Transform")).unwrap();
    assert_eq!(step.records_failed, 5);
    assert_eq!(step.records_succeeded, 0);
}

#[tokio::test]
async fn test_transform_errors_within_budget_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new().with_source(
        "stripe",
        "customer",
        vec![json!({"id": "cus_1", "email": "a@x.com"})],
    );

    let mut orchestrator =
        MigrationOrchestrator::new(harness.config(dir.path()), Arc::new(SchemaRegistry::new()))
            .with_mapping(colliding_mapping())
            .with_connectors(harness.connectors());
    let run = orchestrator.run_migration().await;

    assert_eq!(run.status, MigrationStatus::Completed);
    let transform = run.steps.iter().find(|s| s.name.starts_with("Transform")).unwrap();
    assert_eq!(transform.records_failed, 1);
    assert_eq!(transform.errors[0].record_id.as_deref(), Some("stripe_cus_1"));
    assert!(!transform.errors[0].errors.is_empty());

    let validate = run.steps.iter().find(|s| s.name.starts_with("Validate")).unwrap();
    assert_eq!(validate.records_failed, 1);
    assert!(harness.state.lock().unwrap().loaded.is_empty());
}
