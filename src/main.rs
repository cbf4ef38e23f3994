use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::{info, warn};
use std::path::PathBuf;

use clusterset_ipam::config_loader;
use clusterset_ipam::orchestrator::{JoinRequest, Orchestrator};
use clusterset_ipam::store::{FileStore, RegistryStore};

/// Global IP pool allocator for multi-cluster network fabrics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the allocator configuration YAML file
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the registry record if it does not exist yet
    Init,

    /// Allocate (or confirm) the CIDR for a joining cluster
    Allocate {
        /// Cluster ID of the joining cluster
        #[arg(long)]
        cluster_id: String,

        /// Explicit CIDR to claim; takes precedence over --size
        #[arg(long)]
        cidr: Option<String>,

        /// Number of addresses to allocate; defaults to the pool setting
        #[arg(long, default_value_t = 0)]
        size: u64,
    },

    /// Print the current registry
    Show,
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = config_loader::load_config(&args.config)?;
    let store = FileStore::new(&config.store.path);
    let namespace = config.store.namespace.as_str();
    let kind = config.registry.kind;

    match args.command {
        Command::Init => {
            let registry = config.initial_registry()?;
            RegistryStore::new(&store, kind)
                .ensure_created(namespace, &registry)
                .wrap_err("Failed to create registry")?;
            info!("{} registry ready in namespace {}", kind, namespace);
        }
        Command::Allocate { cluster_id, cidr, size } => {
            let mut request = JoinRequest::new(cluster_id).with_size(size);
            if let Some(cidr) = cidr {
                request = request.with_cidr(cidr);
            }

            let outcome = Orchestrator::new(&store, kind)
                .with_retry_policy(config.retry_policy())
                .allocate_cidr(namespace, &request)
                .wrap_err_with(|| format!("Failed to allocate a CIDR for cluster {}", request.cluster_id))?;

            if let Some(warning) = &outcome.warning {
                warn!("{}", warning);
            }
            match outcome.cidr {
                Some(cidr) => println!("{}", cidr),
                None => info!("{} is not enabled; no CIDR allocated", kind),
            }
        }
        Command::Show => {
            let (registry, version) = RegistryStore::new(&store, kind)
                .get(namespace)
                .wrap_err("Failed to read registry")?;
            let clusters: Vec<_> = registry.clusters.values().collect();
            let view = serde_json::json!({
                "kind": kind,
                "version": version.to_string(),
                "enabled": registry.enabled,
                "pool": registry.pool.cidr.to_string(),
                "allocation_size": registry.pool.allocation_size,
                "clusters": clusters,
            });
            let rendered = serde_json::to_string_pretty(&view).map_err(|e| eyre!("Failed to render registry: {}", e))?;
            println!("{}", rendered);
        }
    }

    Ok(())
}
