use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rustc_hash::FxHashMap;
use tokio::signal;
use tracing::{info, warn};

use keel_apply::{load_manifests, KubeApplier};
use keel_cache::{ClusterCache, Resource, Settings};
use keel_core::{Gvk, Manifest, OperationState, ResourceKey};
use keel_health::{get_resource_health, worst};
use keel_kubehub::{KubeCluster, ResourceDiscovery};
use keel_sync::{reconcile, RunnerSettings, SyncContext, SyncOptions, SyncRunner};

/// Label tying live objects to the instance that manages them.
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: GitOps sync engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced resources without one
    #[arg(short = 'n', long = "namespace", env = "KEEL_NAMESPACE", global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync a file or directory of manifests into the cluster
    Sync {
        /// Manifest file or directory (.yaml, .yml, .json)
        path: PathBuf,
        /// Instance name recorded on every object; selects prune candidates
        #[arg(long = "instance", env = "KEEL_INSTANCE")]
        instance: String,
        /// Source revision, used to name generated hooks
        #[arg(long = "revision", default_value = "")]
        revision: String,
        /// Delete managed objects missing from the manifests
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        /// Validate everything against the server without persisting
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        #[arg(long = "skip-hooks", action = ArgAction::SetTrue)]
        skip_hooks: bool,
        /// Terminate the operation after this many seconds
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    /// Print a resource's ownership tree with per-node health
    Tree {
        /// GVK key, e.g. "apps/v1/Deployment" or "v1/Service"
        gvk: String,
        name: String,
    },
    /// List served API resources (incl. CRDs)
    Discover,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { path, instance, revision, prune, dry_run, force, skip_hooks, timeout_secs } => {
            let opts = SyncOptions::from_env()
                .with_revision(revision)
                .with_prune(prune)
                .with_dry_run(dry_run)
                .with_force(force)
                .with_skip_hooks(skip_hooks);
            let deadline = timeout_secs.map(Duration::from_secs);
            let state = sync(&path, &instance, &cli.namespace, opts, deadline).await?;
            match cli.output {
                Output::Human => print_state(&state),
                Output::Json => println!("{}", serde_json::to_string_pretty(&state)?),
            }
            if !state.phase.is_successful() {
                bail!("sync {}: {}", state.phase, state.message);
            }
        }
        Commands::Tree { gvk, name } => {
            let gvk = Gvk::parse(&gvk).ok_or_else(|| anyhow!("invalid GVK key {gvk:?}"))?;
            tree(&gvk, &name, &cli.namespace, cli.output).await?;
        }
        Commands::Discover => {
            info!("discover invoked");
            let cluster = KubeCluster::try_default().await?;
            let resources = cluster.api_resources().await.context("discovering API resources")?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.gvk().api_version(), r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
    }
    Ok(())
}

fn label_instance(mut obj: Manifest, instance: &str) -> Manifest {
    obj.metadata.labels.get_or_insert_with(Default::default).insert(INSTANCE_LABEL.to_string(), instance.to_string());
    obj
}

fn is_instance(res: &Resource, instance: &str) -> bool {
    res.manifest
        .as_ref()
        .and_then(|m| m.metadata.labels.as_ref())
        .and_then(|l| l.get(INSTANCE_LABEL))
        .is_some_and(|v| v == instance)
}

async fn sync(
    path: &Path,
    instance: &str,
    namespace: &str,
    opts: SyncOptions,
    deadline: Option<Duration>,
) -> Result<Arc<OperationState>> {
    let targets: Vec<Manifest> = load_manifests(path)?.into_iter().map(|o| label_instance(o, instance)).collect();
    info!(path = %path.display(), targets = targets.len(), %instance, "sync invoked");

    let cluster = KubeCluster::try_default().await?;
    let applier = Arc::new(KubeApplier::new(cluster.client().clone()));
    let cache = ClusterCache::new(Arc::new(cluster), Settings::from_env());
    cache.ensure_synced().await.context("syncing cluster cache")?;

    let live = cache.get_managed_live_objs(&targets, |r| is_instance(r, instance)).await?;
    let reconciliation = reconcile(targets, live, namespace, &*cache);
    let ctx = Arc::new(SyncContext::new(applier.clone(), applier, reconciliation, namespace, opts));
    info!(op = ctx.id(), "starting sync operation");

    let settings = RunnerSettings::from_env().with_deadline(deadline);
    let handle = SyncRunner::spawn(ctx, settings, Some(cache.subscribe_epoch()));
    let state = tokio::select! {
        done = handle.wait() => done,
        _ = signal::ctrl_c() => {
            warn!("interrupted; terminating sync");
            handle.cancel();
            handle.wait().await
        }
    };
    cache.stop();
    Ok(state)
}

fn print_state(state: &OperationState) {
    println!("{:<9} {:<24} {:<16} {:<32} {:<13} {:<10} MESSAGE", "PHASE", "KIND", "NAMESPACE", "NAME", "STATUS", "HOOK");
    for r in &state.results {
        let k = &r.resource_key;
        let kind = if k.group.is_empty() { k.kind.clone() } else { format!("{}/{}", k.group, k.kind) };
        let ns = if k.namespace.is_empty() { "-" } else { k.namespace.as_str() };
        let status = r.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        let hook = r.hook_type.map(|h| format!("{h:?}")).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<9} {:<24} {:<16} {:<32} {:<13} {:<10} {}",
            r.sync_phase.to_string(), kind, ns, k.name, status, hook, r.message
        );
    }
    println!();
    println!("Operation: {} {}", state.phase, state.message);
    if let (Some(start), Some(end)) = (state.started_at, state.finished_at) {
        println!("Duration:  {}s", (end - start).num_seconds().max(0));
    }
}

async fn tree(gvk: &Gvk, name: &str, namespace: &str, output: Output) -> Result<()> {
    let cluster = KubeCluster::try_default().await?;
    let namespaced = cluster.is_namespaced(&gvk.group_kind()).await.context("resolving resource scope")?;
    let ns = if namespaced { namespace } else { "" };
    let key = ResourceKey::new(&gvk.group, &gvk.kind, ns, name);
    info!(%key, "tree invoked");

    let cache = ClusterCache::new(Arc::new(cluster), Settings::from_env());
    cache.ensure_synced().await.context("syncing cluster cache")?;
    let Some(root) = cache.get_resource(&key) else {
        cache.stop();
        bail!("{key} not found");
    };

    let mut nodes = vec![(0usize, root.as_ref().clone())];
    let mut depth_by_uid: FxHashMap<String, usize> = FxHashMap::default();
    depth_by_uid.insert(root.reference.uid.clone(), 0);
    cache.iterate_hierarchy(&key, |child, _| {
        // Inferred children carry no owner reference and sit right under the root.
        let depth = child
            .owner_refs
            .iter()
            .filter_map(|o| o.uid().and_then(|uid| depth_by_uid.get(uid)))
            .max()
            .map_or(1, |d| d + 1);
        depth_by_uid.insert(child.reference.uid.clone(), depth);
        nodes.push((depth, child.clone()));
        true
    });
    cache.stop();

    let health: Vec<_> =
        nodes.iter().map(|(_, r)| r.manifest.as_deref().and_then(|m| get_resource_health(m, None))).collect();
    let aggregated = worst(health.iter().flatten().map(|h| h.status));

    match output {
        Output::Human => {
            for ((depth, res), h) in nodes.iter().zip(&health) {
                let r = &res.reference;
                let status = h.as_ref().map(|h| h.status.to_string()).unwrap_or_else(|| "-".to_string());
                let message = h.as_ref().map(|h| h.message.as_str()).unwrap_or_default();
                println!("{}{}/{}  {}  {}", "  ".repeat(*depth), r.gvk.kind, r.name, status, message);
            }
            println!();
            println!("Health: {}", aggregated.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()));
        }
        Output::Json => {
            let items: Vec<_> = nodes
                .iter()
                .zip(&health)
                .map(|((depth, res), h)| {
                    serde_json::json!({
                        "key": res.key().to_string(),
                        "depth": depth,
                        "health": h.as_ref().map(|h| h.status.to_string()),
                        "message": h.as_ref().map(|h| h.message.clone()),
                    })
                })
                .collect();
            let out = serde_json::json!({
                "nodes": items,
                "health": aggregated.map(|c| c.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}
