use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;

mod config;

use config::Flags;

#[derive(Parser, Debug)]
#[command(name = "storaged", version)]
struct Cli {
    #[command(flatten)]
    flags: Flags,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the storage daemon (the default).
    Serve {
        /// Single-node bootstrap: create `name:parts:replica:vid_len`
        /// in the embedded catalog before serving.
        #[arg(long)]
        bootstrap_space: Option<String>,
    },
    /// Dump decoded edge keys from an engine directory.
    DumpEdges {
        /// Path to a space's `data` directory.
        #[arg(long)]
        path: std::path::PathBuf,
        /// Partition to dump; 0 dumps every partition.
        #[arg(long, default_value_t = 0)]
        part: i32,
        #[arg(long, default_value_t = 8)]
        vid_len: usize,
        /// Highest partition id scanned when `--part 0`.
        #[arg(long, default_value_t = 1024)]
        max_part: i32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match cli.command {
        Some(Command::DumpEdges {
            path,
            part,
            vid_len,
            max_part,
        }) => dump_edges(&path, part, vid_len, max_part),
        Some(Command::Serve { bootstrap_space }) => run(cli.flags, bootstrap_space),
        None => run(cli.flags, None),
    }
}

fn run(flags: Flags, bootstrap_space: Option<String>) -> anyhow::Result<()> {
    let worker_threads = if flags.num_worker_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        flags.num_worker_threads
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(serve(flags, bootstrap_space))
}

async fn serve(flags: Flags, bootstrap_space: Option<String>) -> anyhow::Result<()> {
    let local = flags.local();
    tracing::info!(
        host = %local,
        read_pools = %flags.num_threads_per_priority,
        "storage daemon starting"
    );

    // The embedded catalog; a clustered deployment dials the metadata
    // service here instead.
    let meta_svc = Arc::new(catalog::MemMetaService::new());
    if let Some(spec) = bootstrap_space {
        bootstrap(&meta_svc, &local, &spec)?;
    }

    let meta = Arc::new(catalog::MetaCache::new());
    let store = storage::GraphStore::new(
        local.clone(),
        meta.clone(),
        raft::LocalNetwork::new(),
        flags.store_config()?,
    );
    meta.register_handler(storage::StoreHandler::new(&store));
    let watcher = meta.spawn_watcher(meta_svc.clone());

    // Report liveness and led partitions to the catalog.
    let heartbeat = {
        let meta_svc = meta_svc.clone();
        let store = store.clone();
        let local = local.clone();
        tokio::spawn(async move {
            loop {
                use catalog::MetaService;
                if let Err(err) = meta_svc.heartbeat(&local, store.leader_parts()).await {
                    tracing::warn!(%err, "heartbeat failed");
                }
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            }
        })
    };

    tracing::info!("ready");
    wait_for_shutdown().await;

    heartbeat.abort();
    watcher.abort();
    tracing::info!("storage daemon stopping");
    Ok(())
}

fn bootstrap(
    meta_svc: &catalog::MemMetaService,
    local: &models::HostAddr,
    spec: &str,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [name, part_num, replica, vid_len] = parts.as_slice() else {
        anyhow::bail!("bootstrap space must be name:parts:replica:vid_len");
    };
    let part_num: i32 = part_num.parse()?;
    let desc = models::SpaceDesc::new(1, name, part_num, replica.parse()?, vid_len.parse()?);

    let placement: BTreeMap<models::PartitionId, Vec<models::HostAddr>> =
        (1..=part_num).map(|part| (part, vec![local.clone()])).collect();
    meta_svc
        .create_space(desc, placement)
        .map_err(|err| anyhow::anyhow!("bootstrap failed: {err}"))?;
    tracing::info!(space = name, parts = part_num, "bootstrapped space");
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("caught SIGTERM; stopping"),
        _ = sigint.recv() => tracing::info!("caught SIGINT; stopping"),
    }
}

/// Operator tool: decode and print every edge record of an engine.
fn dump_edges(
    path: &std::path::Path,
    part: i32,
    vid_len: usize,
    max_part: i32,
) -> anyhow::Result<()> {
    use engine::KvEngine;

    let engine = engine::RocksEngine::open(path)
        .map_err(|err| anyhow::anyhow!("open {}: {err}", path.display()))?;

    let parts: Vec<i32> = if part > 0 {
        vec![part]
    } else {
        (1..=max_part).collect()
    };

    let mut total = 0u64;
    for part in parts {
        let prefix = codec::edge_prefix(part);
        let mut iter = engine
            .prefix(&prefix)
            .map_err(|err| anyhow::anyhow!("scan partition {part}: {err}"))?;
        loop {
            let pair = iter
                .next_pair()
                .map_err(|err| anyhow::anyhow!("scan partition {part}: {err}"))?;
            let Some((key, value)) = pair else { break };
            let edge = codec::parse_edge(&key, vid_len)
                .map_err(|err| anyhow::anyhow!("bad edge key: {err}"))?;
            println!(
                "part={} src={:?} type={} rank={} dst={:?} version={} row={}B",
                edge.part,
                String::from_utf8_lossy(edge.src.as_bytes()),
                edge.edge_type,
                edge.ranking,
                String::from_utf8_lossy(edge.dst.as_bytes()),
                edge.version,
                value.len(),
            );
            total += 1;
        }
    }
    eprintln!("{total} edge records");
    Ok(())
}
