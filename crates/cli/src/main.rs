use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};
use vtx_api::{CallOptions, PlanReport, ProviderConfig, ReadOutcome, Reconciler};
use vtx_core::{DesiredEndpoint, Endpoint};
use vtx_hub::HttpTransport;
use vtx_persist::{format_ts, now_ts, SqliteStore, StateRecord, StateStore};

#[derive(Parser, Debug)]
#[command(name = "vtxctl", version, about = "Plan and apply Vertex AI Endpoint manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project override; wins over the manifest's project
    #[arg(long, global = true)]
    project: Option<String>,

    /// Region override; wins over the manifest's region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Create timeout in seconds
    #[arg(long = "create-timeout", global = true)]
    create_timeout: Option<u64>,

    /// Update timeout in seconds
    #[arg(long = "update-timeout", global = true)]
    update_timeout: Option<u64>,

    /// Delete timeout in seconds
    #[arg(long = "delete-timeout", global = true)]
    delete_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what apply would do for a manifest
    Plan {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Create or update the endpoint described by a manifest
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Refresh saved state from the remote; drops it when the endpoint is gone
    Get { key: String },
    /// Delete the endpoint saved under KEY
    Destroy { key: String },
    /// List saved endpoints
    Ls,
}

/// Manifest document: a state key plus the desired endpoint fields.
#[derive(Debug, Deserialize)]
struct Manifest {
    key: String,
    #[serde(flatten)]
    desired: DesiredEndpoint,
}

fn parse_manifest(text: &str) -> Result<Manifest> {
    let m: Manifest = serde_yaml::from_str(text).context("parsing manifest")?;
    if m.key.trim().is_empty() { return Err(anyhow!("manifest key must not be empty")); }
    Ok(m)
}

fn load_manifest(path: &PathBuf) -> Result<Manifest> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_manifest(&text).with_context(|| format!("in {}", path.display()))
}

fn init_tracing() {
    let env = std::env::var("VTX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VTX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VTX_METRICS_ADDR; expected host:port");
        }
    }
}

fn call_options(cli: &Cli) -> CallOptions {
    let mut opts = CallOptions { project: cli.project.clone(), region: cli.region.clone(), ..Default::default() };
    if let Some(s) = cli.create_timeout { opts.timeouts.create = Duration::from_secs(s); }
    if let Some(s) = cli.update_timeout { opts.timeouts.update = Duration::from_secs(s); }
    if let Some(s) = cli.delete_timeout { opts.timeouts.delete = Duration::from_secs(s); }
    opts
}

fn load_state(store: &dyn StateStore, key: &str) -> Result<Option<Endpoint>> {
    match store.get(key)? {
        Some(rec) => {
            let e: Endpoint = serde_json::from_str(&rec.state_json).with_context(|| format!("decoding saved state for {}", key))?;
            Ok(Some(e))
        }
        None => Ok(None),
    }
}

fn save_state(store: &dyn StateStore, key: &str, e: &Endpoint) -> Result<()> {
    store.put(StateRecord {
        key: key.to_string(),
        id: e.name.clone(),
        project: e.project.clone(),
        region: e.region.clone(),
        ts: now_ts(),
        state_json: serde_json::to_string(e)?,
    })
}

fn print_endpoint(e: &Endpoint, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(e)?),
        Output::Human => print!("{}", render_endpoint(e)),
    }
    Ok(())
}

fn render_endpoint(e: &Endpoint) -> String {
    let mut out = String::new();
    out.push_str(&format!("name:                {}\n", e.name));
    out.push_str(&format!("display_name:        {}\n", e.display_name));
    out.push_str(&format!("metadata_schema_uri: {}\n", e.metadata_schema_uri));
    if !e.labels.is_empty() {
        let labels: Vec<String> = e.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        out.push_str(&format!("labels:              {}\n", labels.join(",")));
    }
    if let Some(spec) = e.encryption_spec.as_ref().and_then(|v| v.first()) {
        out.push_str(&format!("kms_key_name:        {}\n", spec.kms_key_name));
    }
    out.push_str(&format!("project/region:      {}/{}\n", e.project, e.region));
    if !e.create_time.is_empty() { out.push_str(&format!("created:             {}\n", e.create_time)); }
    if !e.update_time.is_empty() { out.push_str(&format!("updated:             {}\n", e.update_time)); }
    out
}

fn render_plan(r: &PlanReport) -> String {
    let mut out = format!("{}{}\n", r.action, r.name.as_deref().map(|n| format!(" {}", n)).unwrap_or_default());
    for c in &r.changes {
        let tag = if c.immutable { " (immutable)" } else { "" };
        out.push_str(&format!("  ~ {}{}: {} -> {}\n", c.field, tag, c.before, c.after));
    }
    out
}

/// Run `fut`, giving up on Ctrl-C. Remote operations keep running after an interrupt.
async fn interruptible<T>(what: &str, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        res = fut => res,
        _ = signal::ctrl_c() => {
            warn!(what, "interrupted; the remote operation may still complete");
            Err(anyhow!("{} interrupted", what))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let opts = call_options(&cli);
    let store = SqliteStore::open_default()?;

    match &cli.command {
        Commands::Plan { file } => {
            let m = load_manifest(file)?;
            let prior = load_state(&store, &m.key)?;
            info!(key = %m.key, has_state = prior.is_some(), "plan invoked");
            let plan = vtx_api::plan(&m.desired, prior.as_ref())?;
            let report = PlanReport::new(&plan, &m.desired, prior.as_ref());
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                Output::Human => print!("{}", render_plan(&report)),
            }
        }
        Commands::Apply { file } => {
            let m = load_manifest(file)?;
            let prior = load_state(&store, &m.key)?;
            info!(key = %m.key, has_state = prior.is_some(), "apply invoked");
            let rec = Reconciler::new(HttpTransport::from_env()?, ProviderConfig::from_env());
            let applied = interruptible("apply", async { rec.apply(&m.desired, prior.as_ref(), &opts).await.map_err(anyhow::Error::from) }).await?;
            save_state(&store, &m.key, &applied.endpoint)?;
            if cli.output == Output::Human { println!("{}: {}", applied.plan.action(), m.key); }
            print_endpoint(&applied.endpoint, cli.output)?;
        }
        Commands::Get { key } => {
            let prior = load_state(&store, key)?.ok_or_else(|| anyhow!("no saved state for {}", key))?;
            let rec = Reconciler::new(HttpTransport::from_env()?, ProviderConfig::from_env());
            match rec.read(&prior, &opts).await? {
                ReadOutcome::Found(e) => {
                    save_state(&store, key, &e)?;
                    print_endpoint(&e, cli.output)?;
                }
                ReadOutcome::Gone => {
                    store.remove(key)?;
                    warn!(key = %key, name = %prior.name, "endpoint no longer exists; state dropped");
                    eprintln!("{} ({}) no longer exists; saved state removed", key, prior.name);
                }
            }
        }
        Commands::Destroy { key } => {
            let prior = load_state(&store, key)?.ok_or_else(|| anyhow!("no saved state for {}", key))?;
            let rec = Reconciler::new(HttpTransport::from_env()?, ProviderConfig::from_env());
            interruptible("destroy", async { rec.delete(&prior, &opts).await.map_err(anyhow::Error::from) }).await?;
            store.remove(key)?;
            println!("destroyed {} ({})", key, prior.name);
        }
        Commands::Ls => {
            let rows = store.list()?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                Output::Human => {
                    for r in rows {
                        println!("{} • {} • {}", r.key, r.id, format_ts(r.ts));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_tracks_present_fields() {
        let m = parse_manifest("key: svc-a\ndisplay_name: svc-a\nmetadata_schema_uri: gs://x/schema.yaml\nlabels:\n  env: prod\n").unwrap();
        assert_eq!(m.key, "svc-a");
        assert_eq!(m.desired.display_name.as_deref(), Some("svc-a"));
        assert_eq!(m.desired.labels.as_ref().map(|l| l.len()), Some(1));
        assert!(m.desired.encryption_spec.is_none());
    }

    #[test]
    fn manifest_requires_key() {
        assert!(parse_manifest("display_name: a\n").is_err());
        assert!(parse_manifest("key: ''\n").is_err());
    }

    #[test]
    fn timeout_flags_override_defaults() {
        let cli = Cli::parse_from(["vtxctl", "--delete-timeout", "30", "ls"]);
        let opts = call_options(&cli);
        assert_eq!(opts.timeouts.delete, Duration::from_secs(30));
        assert_eq!(opts.timeouts.create, Duration::from_secs(360));
    }

    #[test]
    fn location_overrides_come_only_from_flags() {
        // VTX_PROJECT / VTX_REGION are provider defaults and must not outrank the manifest
        let cli = Cli::parse_from(["vtxctl", "ls"]);
        let opts = call_options(&cli);
        assert_eq!(opts.project, None);
        assert_eq!(opts.region, None);
        let cli = Cli::parse_from(["vtxctl", "--project", "other", "--region", "europe-west4", "ls"]);
        let opts = call_options(&cli);
        assert_eq!(opts.project.as_deref(), Some("other"));
        assert_eq!(opts.region.as_deref(), Some("europe-west4"));
    }

    #[test]
    fn human_endpoint_rendering() {
        let e = Endpoint {
            name: "projects/p/locations/r/endpoints/1".into(),
            display_name: "svc-a".into(),
            labels: [("env".to_string(), "prod".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let s = render_endpoint(&e);
        assert!(s.contains("display_name:        svc-a"));
        assert!(s.contains("labels:              env=prod"));
        assert!(!s.contains("created:"));
    }
}
