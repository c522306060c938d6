use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tokio::signal;
use tracing::{info, warn};

use arca_api::{ListOptions, ResourceStore, VersionMatch, WatchEvent};
use arca_core::{Filter, Report, ResourceKind, VersionCounter};
use arca_kv::{EtcdKv, KvConfig, KvRepository};
use arca_migrate::{ClusterSource, Migrator};
use arca_persist::{DbConfig, SqlRepository};
use arca_store::{MemoryRepository, Repository};

#[derive(Parser, Debug)]
#[command(name = "arcactl", version, about = "Arca resource store CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Storage backend
    #[arg(long = "backend", value_enum, global = true, env = "ARCA_BACKEND", default_value_t = Backend::Memory)]
    backend: Backend,

    /// Namespace scope (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Resource plural, when it is not the kind lowercased plus "s"
    #[arg(long = "plural", global = true)]
    plural: Option<String>,

    /// Treat the kind as cluster-scoped
    #[arg(long = "cluster-scoped", global = true, action = ArgAction::SetTrue)]
    cluster_scoped: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Memory,
    Etcd,
    Postgres,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List records for a group/version/kind key
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "wgpolicyk8s.io/v1alpha2/PolicyReport"
        gvk: String,
        /// Label selector, comma-separated key=value pairs
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Only records at or past this resource version
        #[arg(long = "not-older-than")]
        not_older_than: Option<String>,
    },
    /// Fetch one record as JSON
    Get { gvk: String, name: String },
    /// Store a record read from a JSON file ("-" reads stdin)
    Put {
        gvk: String,
        file: String,
        /// Replace the stored record instead of failing on conflict
        #[arg(long = "replace", action = ArgAction::SetTrue)]
        replace: bool,
    },
    /// Delete one record
    Rm { gvk: String, name: String },
    /// Stream change events; a specific --from version replays current
    /// records as synthetic adds first
    Watch {
        gvk: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Resource version to resume from ("0": future events only)
        #[arg(long = "from", default_value = "0")]
        from: String,
    },
    /// Drain a live cluster's records into the selected backend
    Migrate {
        gvk: String,
        /// Worker pool size for the bulk batch
        #[arg(long = "concurrency", default_value_t = 8)]
        concurrency: usize,
        /// Stop after the batch instead of mirroring live changes
        #[arg(long = "no-tail", action = ArgAction::SetTrue)]
        no_tail: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("ARCA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARCA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARCA_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_gvk(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some((String::new(), (*version).to_string(), (*kind).to_string())),
        [group, version, kind] => {
            Some(((*group).to_string(), (*version).to_string(), (*kind).to_string()))
        }
        _ => None,
    }
}

fn resource_kind(plural: Option<&str>, cluster_scoped: bool, key: &str) -> Result<ResourceKind> {
    let (group, version, kind) = parse_gvk(key)
        .ok_or_else(|| anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))?;
    let plural =
        plural.map(str::to_string).unwrap_or_else(|| format!("{}s", kind.to_ascii_lowercase()));
    Ok(if cluster_scoped {
        ResourceKind::cluster_scoped(&group, &version, &kind, &plural)
    } else {
        ResourceKind::namespaced(&group, &version, &kind, &plural)
    })
}

fn parse_selector(raw: &str) -> Result<LabelSelector> {
    let mut labels = BTreeMap::new();
    for term in raw.split(',') {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        let (k, v) = term
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid selector term {:?} (expect key=value)", term))?;
        labels.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(LabelSelector { match_labels: Some(labels), ..LabelSelector::default() })
}

async fn open_repository(backend: Backend, kind: ResourceKind) -> Result<Arc<dyn Repository<Report>>> {
    Ok(match backend {
        Backend::Memory => Arc::new(MemoryRepository::new(kind)),
        Backend::Etcd => {
            let kv = EtcdKv::connect(&KvConfig::default()).await?;
            Arc::new(KvRepository::new(kind, Arc::new(kv)))
        }
        Backend::Postgres => {
            let cfg = DbConfig::from_env()?;
            let router = Arc::new(arca_persist::connect(&cfg).await?);
            Arc::new(SqlRepository::new(kind, router, &cfg.cluster_id).await?)
        }
    })
}

/// Build the store and start its version counter where the stored records
/// left off, so one-shot invocations keep issuing ascending versions
/// against a shared backend.
async fn open_store(backend: Backend, kind: ResourceKind) -> Result<ResourceStore<Report>> {
    let repo = open_repository(backend, kind).await?;
    let store = ResourceStore::new(repo, Arc::new(VersionCounter::new()));
    let items = store.repository().list(&Filter::new()).await?;
    let max = items
        .iter()
        .filter_map(|r| r.metadata.resource_version.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    if max > 0 {
        store.versions().set_resource_version(&format!("{}", max + 1));
    }
    Ok(store)
}

fn scope(namespace: Option<&str>) -> Filter {
    match namespace {
        Some(ns) => Filter::new().with_namespace(ns),
        None => Filter::new(),
    }
}

fn point(namespace: Option<&str>, name: &str) -> Filter {
    scope(namespace).with_name(name)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ls { gvk, selector, not_older_than } => {
            let kind = resource_kind(cli.plural.as_deref(), cli.cluster_scoped, &gvk)?;
            info!(gvk = %gvk, ns = ?cli.namespace, backend = ?cli.backend, "ls invoked");
            let store = open_store(cli.backend, kind).await?;
            let opts = ListOptions {
                label_selector: match selector.as_deref() {
                    Some(raw) => Some(parse_selector(raw)?),
                    None => None,
                },
                version_match: not_older_than.as_ref().map(|_| VersionMatch::NotOlderThan),
                resource_version: not_older_than,
            };
            let out = store.list(&scope(cli.namespace.as_deref()), &opts).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<13} {:<31} {:<8} {}", "NAMESPACE", "NAME", "VERSION", "AGE");
                    for item in &out.items {
                        let ns_col =
                            item.metadata.namespace.clone().unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<13} {:<31} {:<8} {}",
                            ns_col,
                            item.metadata.name,
                            item.metadata.resource_version,
                            render_age(item.metadata.creation_timestamp)
                        );
                    }
                    println!("-- {} item(s), aggregate version {}", out.items.len(), out.resource_version);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Get { gvk, name } => {
            let kind = resource_kind(cli.plural.as_deref(), cli.cluster_scoped, &gvk)?;
            info!(gvk = %gvk, name = %name, backend = ?cli.backend, "get invoked");
            let store = open_store(cli.backend, kind).await?;
            let obj = store.get(&point(cli.namespace.as_deref(), &name)).await?;
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
        Commands::Put { gvk, file, replace } => {
            let kind = resource_kind(cli.plural.as_deref(), cli.cluster_scoped, &gvk)?;
            info!(gvk = %gvk, file = %file, backend = ?cli.backend, "put invoked");
            let raw = read_payload(&file)?;
            let mut obj: Report = serde_json::from_str(&raw)?;
            if obj.metadata.namespace.is_none() {
                obj.metadata.namespace = cli.namespace.clone();
            }
            let store = open_store(cli.backend, kind).await?;
            match store.create(obj.clone()).await {
                Ok(stored) => println!(
                    "created {} (version {})",
                    render_key(&stored),
                    stored.metadata.resource_version
                ),
                Err(e) if e.is_already_exists() && replace => {
                    let stored = store.update(obj, true).await?;
                    println!(
                        "updated {} (version {})",
                        render_key(&stored),
                        stored.metadata.resource_version
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Rm { gvk, name } => {
            let kind = resource_kind(cli.plural.as_deref(), cli.cluster_scoped, &gvk)?;
            info!(gvk = %gvk, name = %name, backend = ?cli.backend, "rm invoked");
            let store = open_store(cli.backend, kind).await?;
            let gone = store.delete(&point(cli.namespace.as_deref(), &name)).await?;
            println!("deleted {}", render_key(&gone));
        }
        Commands::Watch { gvk, selector, from } => {
            let kind = resource_kind(cli.plural.as_deref(), cli.cluster_scoped, &gvk)?;
            info!(gvk = %gvk, from = %from, backend = ?cli.backend, "watch invoked");
            let store = open_store(cli.backend, kind).await?;
            let opts = ListOptions {
                label_selector: match selector.as_deref() {
                    Some(raw) => Some(parse_selector(raw)?),
                    None => None,
                },
                resource_version: Some(from),
                version_match: None,
            };
            let handle = store.watch(&scope(cli.namespace.as_deref()), &opts).await?;
            let mut rx = handle.rx;
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) => print_event(cli.output, &ev)?,
                        None => {
                            warn!("event stream closed; exiting watch loop");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            handle.cancel.cancel();
        }
        Commands::Migrate { gvk, concurrency, no_tail } => {
            let kind = resource_kind(cli.plural.as_deref(), cli.cluster_scoped, &gvk)?;
            info!(gvk = %gvk, backend = ?cli.backend, concurrency, "migrate invoked");
            let dest = open_repository(cli.backend, kind.clone()).await?;
            let source = Arc::new(ClusterSource::connect(kind, cli.namespace.as_deref()).await?);
            let versions = Arc::new(VersionCounter::new());
            let migrator = Migrator::new(source, dest, versions).with_concurrency(concurrency);
            let summary = migrator.run().await?;
            match cli.output {
                Output::Human => println!(
                    "migrated {} record(s), {} failed, highest source version {}",
                    summary.migrated, summary.failed, summary.last_version
                ),
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
            if !no_tail {
                let tail = migrator.tail().await?;
                info!("mirroring live changes; Ctrl-C to stop");
                signal::ctrl_c().await?;
                info!("Ctrl-C received; stopping tail");
                tail.cancel();
            }
        }
    }

    Ok(())
}

fn read_payload(file: &str) -> Result<String> {
    use std::io::Read;
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(file)?)
    }
}

fn render_key(obj: &Report) -> String {
    match obj.metadata.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.metadata.name),
        None => obj.metadata.name.clone(),
    }
}

fn print_event(output: Output, ev: &WatchEvent<Report>) -> Result<()> {
    match output {
        Output::Human => {
            let tag = match ev {
                WatchEvent::Added(_) => "+",
                WatchEvent::Modified(_) => "~",
                WatchEvent::Deleted(_) => "-",
            };
            println!(
                "{} {} (version {})",
                tag,
                render_key(ev.object()),
                ev.object().metadata.resource_version
            );
        }
        Output::Json => println!("{}", serde_json::to_string(ev)?),
    }
    Ok(())
}

fn render_age(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    let ts = match ts {
        Some(t) => t,
        None => return "-".to_string(),
    };
    let mut secs = (chrono::Utc::now() - ts).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
