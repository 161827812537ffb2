use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use saas_migrate::{
    DataSource, DataSourceType, Extractor, FileExtractor, MigrationConfig, MigrationMapping,
    MigrationOrchestrator, MigrationReporter, MigrationStatus, ReportFormat, SchemaRegistry,
    ServiceSchema,
};

#[derive(Parser, Debug)]
#[command(name = "saas-migrate")]
#[command(about = "Migrate business records between SaaS data models")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct RegistryArgs {
    /// Directory of service schema documents (json/yaml)
    #[arg(long, value_name = "DIR")]
    schemas: Option<PathBuf>,

    /// Directory of mapping documents (json/yaml)
    #[arg(long, value_name = "DIR")]
    mappings: Option<PathBuf>,

    /// Fetch a service schema document over HTTP
    #[arg(long = "schema-url", value_name = "URL")]
    schema_urls: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a migration described by a config file
    Run {
        /// Migration config (yaml or json)
        config: PathBuf,

        /// Mapping document, overrides mapping_file from the config
        #[arg(long, value_name = "FILE")]
        mapping: Option<PathBuf>,

        #[command(flatten)]
        registry: RegistryArgs,

        /// Load into memory instead of the target service
        #[arg(long)]
        dry_run: bool,

        /// Delete everything that was created once the run completes
        #[arg(long)]
        rollback: bool,

        #[arg(long, value_enum, default_value = "console")]
        format: ReportFormat,
    },

    /// Check a mapping document against the registered schemas
    ValidateMapping {
        mapping: PathBuf,

        #[command(flatten)]
        registry: RegistryArgs,
    },

    /// Infer an entity schema from sample records
    InferSchema {
        /// Sample records (json/yaml array, or an object with data/records)
        samples: PathBuf,

        #[arg(long)]
        service: String,

        #[arg(long)]
        entity: String,

        /// Write the service schema here instead of printing it
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Transform a single record and print the result
    Preview {
        /// Source record (json/yaml object)
        record: PathBuf,

        #[arg(long, value_name = "FILE")]
        mapping: PathBuf,

        /// Source as service.entity
        #[arg(long)]
        source: String,

        /// Target as service.entity
        #[arg(long)]
        target: String,

        #[command(flatten)]
        registry: RegistryArgs,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let outcome = match args.command {
        Command::Run {
            config,
            mapping,
            registry,
            dry_run,
            rollback,
            format,
        } => run(&config, mapping.as_deref(), &registry, dry_run, rollback, format).await,
        Command::ValidateMapping { mapping, registry } => validate_mapping(&mapping, &registry).await,
        Command::InferSchema {
            samples,
            service,
            entity,
            output,
        } => infer_schema(&samples, &service, &entity, output.as_deref()).await,
        Command::Preview {
            record,
            mapping,
            source,
            target,
            registry,
        } => preview(&record, &mapping, &source, &target, &registry).await,
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn build_registry(args: &RegistryArgs) -> Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    if let Some(dir) = &args.schemas {
        let count = registry.load_schemas_from_directory(dir)?;
        info!(count, dir = %dir.display(), "Loaded schemas");
    }
    if let Some(dir) = &args.mappings {
        let count = registry.load_mappings_from_directory(dir)?;
        info!(count, dir = %dir.display(), "Loaded mappings");
    }
    for url in &args.schema_urls {
        let name = registry
            .fetch_schema(url)
            .await
            .with_context(|| format!("fetching schema from {}", url))?;
        info!(service = %name, url = %url, "Fetched schema");
    }
    Ok(registry)
}

fn split_entity_ref(value: &str) -> Result<(&str, &str)> {
    match value.split_once('.') {
        Some((service, entity)) if !service.is_empty() && !entity.is_empty() => Ok((service, entity)),
        _ => bail!("expected service.entity, got '{}'", value),
    }
}

async fn run(
    config_path: &Path,
    mapping_path: Option<&Path>,
    registry_args: &RegistryArgs,
    dry_run: bool,
    rollback: bool,
    format: ReportFormat,
) -> Result<bool> {
    let mut config = MigrationConfig::from_file(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    config.dry_run |= dry_run;

    let registry = build_registry(registry_args).await?;
    let mut orchestrator = MigrationOrchestrator::new(config, Arc::new(registry));
    if let Some(path) = mapping_path {
        let mapping = MigrationMapping::from_file(path)
            .with_context(|| format!("loading mapping {}", path.display()))?;
        orchestrator = orchestrator.with_mapping(mapping);
    }

    let mut migration = orchestrator.run_migration().await;
    if rollback && migration.status == MigrationStatus::Completed {
        let deleted = orchestrator.rollback().await?;
        info!(?deleted, "Rollback finished");
        migration = orchestrator.run().clone();
    }

    let reporter = MigrationReporter::new().with_format(format);
    let report = reporter.generate_report(&migration);
    println!("{}", reporter.format_report(&report)?);
    if let Some(path) = orchestrator.report_path() {
        println!("  ✓ Run report: {}", path.display());
    }

    Ok(matches!(
        migration.status,
        MigrationStatus::Completed | MigrationStatus::RolledBack
    ))
}

async fn validate_mapping(path: &Path, registry_args: &RegistryArgs) -> Result<bool> {
    let mapping = MigrationMapping::from_file(path)
        .with_context(|| format!("loading mapping {}", path.display()))?;
    let registry = build_registry(registry_args).await?;

    println!("=== Mapping Validation: {} ===\n", mapping.name);
    let mut valid = true;
    for entity_mapping in &mapping.entity_mappings {
        let report = registry.validate_mapping(entity_mapping);
        let status = if report.is_valid { "VALID" } else { "INVALID" };
        println!(
            "{} ({}.{} -> {}.{}): {}",
            entity_mapping.name,
            entity_mapping.source_service,
            entity_mapping.source_entity,
            entity_mapping.target_service,
            entity_mapping.target_entity,
            status
        );
        for error in &report.errors {
            println!("  ❌ {}: {}", error.field, error.message);
        }
        for warning in &report.warnings {
            println!("  ⚠ {}: {}", warning.field, warning.message);
        }
        valid &= report.is_valid;
    }

    let order: Vec<String> = mapping.load_order().iter().map(|m| m.name.clone()).collect();
    println!("\nLoad order: {}", order.join(" -> "));
    Ok(valid)
}

async fn infer_schema(
    samples: &Path,
    service: &str,
    entity: &str,
    output: Option<&Path>,
) -> Result<bool> {
    let source = DataSource::new(DataSourceType::Json, service, entity)
        .with_file_path(samples.display().to_string());
    let records = FileExtractor::new(source)?.extract().await?.records;
    if records.is_empty() {
        warn!(path = %samples.display(), "No sample records found");
    }

    let payloads: Vec<_> = records.into_iter().map(|r| r.data).collect();
    let registry = SchemaRegistry::new();
    let schema = ServiceSchema::new(service)
        .with_entity(registry.infer_schema_from_data(&payloads, entity));

    match output {
        Some(path) => {
            let mut registry = registry;
            registry.register_schema(schema);
            registry.export_schema(service, path)?;
            println!("  ✓ Schema written to {}", path.display());
        }
        None => println!("{}", serde_yaml::to_string(&schema)?),
    }
    Ok(true)
}

async fn preview(
    record_path: &Path,
    mapping_path: &Path,
    source: &str,
    target: &str,
    registry_args: &RegistryArgs,
) -> Result<bool> {
    let (source_service, source_entity) = split_entity_ref(source)?;
    let (target_service, target_entity) = split_entity_ref(target)?;

    let content = tokio::fs::read_to_string(record_path)
        .await
        .with_context(|| format!("reading {}", record_path.display()))?;
    let payload: serde_json::Value = serde_yaml::from_str(&content)?;

    let mapping = MigrationMapping::from_file(mapping_path)
        .with_context(|| format!("loading mapping {}", mapping_path.display()))?;
    let registry = build_registry(registry_args).await?;
    let config = MigrationConfig::new(format!("preview-{}", mapping.name), target_service);
    let orchestrator = MigrationOrchestrator::new(config, Arc::new(registry)).with_mapping(mapping);

    let record = orchestrator.preview_transformation(
        payload,
        source_service,
        source_entity,
        target_service,
        target_entity,
    )?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(record.is_valid())
}
