//! compliancectl - compliance policy enforcement and audit streaming CLI
//!
//! ## Commands
//!
//! - `merge`: merge policy pipelines into a project pipeline
//! - `variables`: show the variables a job receives at run time
//! - `skip-ci`: check whether a user may bypass policies with `[skip ci]`
//! - `stream`: deliver one audit event to the configured destinations

use anyhow::{Context, Result};
use async_trait::async_trait;
use audit_stream::{
    AuditEvent, AuditEventStore, AuditEventStreamer, DeliveryResult, Destination, HttpSink,
    ReqwestTransport, StreamingConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use compliance_policy::{
    FeatureFlags, FragmentCategory, JobVariables, MergedPipeline, PipelineDefinition,
    PipelineMerger, PolicyConfig, PolicyFragment, PolicySet, Variable, VariableCollection,
    VariableOverrideResolver,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "compliancectl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compliance policy enforcement and audit event streaming", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Comma separated feature flags (default: omit_default_stages)
    #[arg(long, global = true, env = "COMPLIANCE_FEATURE_FLAGS")]
    flags: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge policy pipelines into a project pipeline
    Merge {
        /// Project pipeline definition (YAML or JSON)
        #[arg(short, long)]
        base: PathBuf,

        /// Policy file; repeat to apply several, in the order given
        #[arg(short, long = "policy")]
        policies: Vec<PathBuf>,

        /// Id of the project that holds the policy files
        #[arg(long, default_value = "1")]
        source_id: u64,

        #[arg(short, long, value_enum, default_value = "yaml")]
        format: OutputFormat,

        /// Write the merged pipeline here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resolve the variables a job receives
    Variables {
        /// Merged pipeline definition (YAML or JSON)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Job name
        #[arg(long)]
        job: String,

        /// Policy that injected the job; omit for project jobs
        #[arg(long)]
        policy: Option<PathBuf>,

        /// User-supplied variable as KEY=VALUE (repeatable)
        #[arg(short = 'e', long = "var", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,
    },

    /// Check whether a user may skip policy pipelines with `[skip ci]`
    SkipCi {
        /// Policy file (repeatable)
        #[arg(short, long = "policy")]
        policies: Vec<PathBuf>,

        /// User id
        #[arg(long)]
        user: u64,
    },

    /// Stream one audit event to every matching destination
    Stream {
        /// Destinations file (TOML)
        #[arg(short, long, env = "AUDIT_STREAM_DESTINATIONS")]
        destinations: PathBuf,

        /// Audit event (JSON)
        #[arg(short, long)]
        event: PathBuf,

        /// Override the event type recorded in the event file
        #[arg(long, default_value = "")]
        event_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    compliance_policy::init_tracing(cli.json, level);

    let flags = match cli.flags.as_deref() {
        Some(list) => FeatureFlags::parse_list(list),
        None => FeatureFlags::default(),
    };

    match cli.command {
        Commands::Merge {
            base,
            policies,
            source_id,
            format,
            output,
        } => cmd_merge(&base, &policies, source_id, flags, format, output.as_deref()),
        Commands::Variables {
            pipeline,
            job,
            policy,
            vars,
        } => cmd_variables(&pipeline, &job, policy.as_deref(), &vars),
        Commands::SkipCi { policies, user } => cmd_skip_ci(&policies, user),
        Commands::Stream {
            destinations,
            event,
            event_type,
        } => cmd_stream(&destinations, &event, &event_type, flags).await,
    }
}

// ---------------------------------------------------------------------------
// Policy files
// ---------------------------------------------------------------------------

/// Policy settings live at the top level; the rendered jobs under `pipeline`.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default = "default_category")]
    category: FragmentCategory,
    #[serde(default)]
    pipeline: serde_json::Value,
}

fn default_category() -> FragmentCategory {
    FragmentCategory::PipelineExecution
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

fn load_policy(path: &Path, source_id: u64, source_index: usize) -> Result<PolicyConfig> {
    let raw = read_file(path)?;
    PolicyConfig::from_yaml(&raw, source_id, source_index)
        .with_context(|| format!("Invalid policy in {:?}", path))
}

fn load_fragment(path: &Path, source_id: u64, source_index: usize) -> Result<PolicyFragment> {
    let raw = read_file(path)?;
    let policy = PolicyConfig::from_yaml(&raw, source_id, source_index)
        .with_context(|| format!("Invalid policy in {:?}", path))?;
    let file: PolicyFile =
        serde_yaml::from_str(&raw).with_context(|| format!("Invalid policy pipeline in {:?}", path))?;

    PolicyFragment::from_value(policy, file.category, file.pipeline)
        .with_context(|| format!("Invalid policy pipeline in {:?}", path))
}

fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let raw = read_file(path)?;
    PipelineDefinition::from_yaml(&raw).with_context(|| format!("Invalid pipeline in {:?}", path))
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

fn merge_files(
    base: &Path,
    policies: &[PathBuf],
    source_id: u64,
    flags: FeatureFlags,
) -> Result<MergedPipeline> {
    let base = load_pipeline(base)?;
    let fragments = policies
        .iter()
        .enumerate()
        .map(|(idx, path)| load_fragment(path, source_id, idx))
        .collect::<Result<Vec<_>>>()?;

    let merged = PipelineMerger::new(flags)
        .merge(&base, &fragments)
        .context("Pipeline merge failed")?;
    Ok(merged)
}

fn render_merged(merged: &MergedPipeline, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => Ok(merged.to_yaml()?),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&merged.to_value())?),
    }
}

fn cmd_merge(
    base: &Path,
    policies: &[PathBuf],
    source_id: u64,
    flags: FeatureFlags,
    format: OutputFormat,
    output: Option<&Path>,
) -> Result<()> {
    let merged = merge_files(base, policies, source_id, flags)?;
    let rendered = render_merged(&merged, format)?;

    info!(
        policies = merged.telemetry.len(),
        jobs = merged.jobs.len(),
        "pipeline merged"
    );
    compliance_policy::METRICS.flush();

    match output {
        Some(path) => {
            std::fs::write(path, &rendered).with_context(|| format!("Failed to write to {:?}", path))?;
            println!("Merged pipeline written to {:?}", path);
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// variables
// ---------------------------------------------------------------------------

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))?;
    if key.is_empty() {
        return Err(format!("empty variable name in `{}`", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

fn resolve_variables(
    pipeline: &Path,
    job: &str,
    policy: Option<&Path>,
    vars: &[(String, String)],
) -> Result<Vec<Variable>> {
    let definition = load_pipeline(pipeline)?;
    let body = definition
        .jobs
        .get(job)
        .with_context(|| format!("Job not found: {}", job))?;

    let globals = VariableCollection::from_value(
        definition
            .globals
            .get("variables")
            .unwrap_or(&serde_json::Value::Null),
    )?;
    let policy = policy.map(|path| load_policy(path, 0, 0)).transpose()?;
    let job = JobVariables::from_job(job, body, &globals, policy.as_ref())?;

    let user_variables: VariableCollection = vars
        .iter()
        .map(|(key, value)| Variable::new(key, value))
        .collect();

    Ok(VariableOverrideResolver::resolve_job_variables(&job, &user_variables).to_runner_map())
}

fn cmd_variables(
    pipeline: &Path,
    job: &str,
    policy: Option<&Path>,
    vars: &[(String, String)],
) -> Result<()> {
    for variable in resolve_variables(pipeline, job, policy, vars)? {
        println!("{}={}", variable.key, variable.value);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// skip-ci
// ---------------------------------------------------------------------------

fn skip_ci_allowed(policies: &[PathBuf], user: u64) -> Result<bool> {
    let policies = policies
        .iter()
        .enumerate()
        .map(|(idx, path)| load_policy(path, 0, idx))
        .collect::<Result<Vec<_>>>()?;
    Ok(PolicySet::new(policies).skip_ci_allowed(user))
}

fn cmd_skip_ci(policies: &[PathBuf], user: u64) -> Result<()> {
    if skip_ci_allowed(policies, user)? {
        println!("user {} may skip policy pipelines", user);
        Ok(())
    } else {
        anyhow::bail!("user {} may not skip policy pipelines", user)
    }
}

// ---------------------------------------------------------------------------
// stream
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct DestinationsFile {
    #[serde(default)]
    destinations: Vec<Destination>,
}

/// Destinations read from a file; events are passed in directly.
struct FileEventStore {
    destinations: Vec<Destination>,
}

#[async_trait]
impl AuditEventStore for FileEventStore {
    async fn find_event(&self, _id: u64) -> audit_stream::Result<Option<AuditEvent>> {
        Ok(None)
    }

    async fn destinations(&self) -> audit_stream::Result<Vec<Destination>> {
        Ok(self.destinations.clone())
    }
}

fn load_destinations(path: &Path) -> Result<Vec<Destination>> {
    let raw = read_file(path)?;
    let file: DestinationsFile =
        toml::from_str(&raw).with_context(|| format!("Invalid destinations file {:?}", path))?;

    for destination in &file.destinations {
        destination
            .validate()
            .with_context(|| format!("Invalid destination {}", destination.id))?;
    }
    Ok(file.destinations)
}

async fn stream_event(
    streamer: &AuditEventStreamer,
    event: &Path,
    event_type: &str,
) -> Result<Vec<DeliveryResult>> {
    let json = read_file(event)?;
    let results = streamer
        .perform(event_type, None, Some(&json))
        .await
        .context("Streaming failed")?;
    Ok(results)
}

async fn cmd_stream(
    destinations: &Path,
    event: &Path,
    event_type: &str,
    flags: FeatureFlags,
) -> Result<()> {
    let config = StreamingConfig::from_env().context("Invalid streaming configuration")?;
    let store = FileEventStore {
        destinations: load_destinations(destinations)?,
    };
    let transport = ReqwestTransport::new(config.timeout).context("Failed to build HTTP client")?;

    // Object storage and cloud logging need SDK clients that this binary
    // does not ship; those destinations report a configuration error.
    let streamer = AuditEventStreamer::new(Arc::new(store), flags, config)
        .with_sink(Arc::new(HttpSink::new(Arc::new(transport))));

    let results = stream_event(&streamer, event, event_type).await?;
    audit_stream::METRICS.flush();

    if results.is_empty() {
        println!("No deliveries");
        return Ok(());
    }

    for result in &results {
        let status = if result.success { "✓" } else { "✗" };
        println!(
            "  {} {} ({})",
            status,
            result.destination_id,
            result.status_code_or_error()
        );
    }

    let failed = results.iter().filter(|r| !r.success).count();
    println!();
    println!("Summary: {}/{} deliveries succeeded", results.len() - failed, results.len());

    if failed > 0 {
        anyhow::bail!("{} deliveries failed", failed)
    }
    Ok(())
}
