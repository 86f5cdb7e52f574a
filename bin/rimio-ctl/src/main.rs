//! RimIO CTL - Pool-map admin CLI
//!
//! Operates on serialized pool-map files: generate topologies, inspect
//! and mutate target states, and answer placement and remap queries.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rimio_common::{ComponentType, Config, ObjectClass, ObjectId, Rank};
use rimio_placement::RimMap;
use rimio_pool::buf::PoolBufBuilder;
use rimio_pool::{PoolBuf, PoolMap, TargetStateOp};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rimio-ctl")]
#[command(about = "RimIO pool-map admin CLI")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of rims used for placement queries (overrides config)
    #[arg(long)]
    nrims: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a pool-map file for a uniform topology
    Gen {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
        /// Grouping domains
        #[arg(long, default_value_t = 1)]
        grps: u32,
        /// Fault domains per grouping domain
        #[arg(long, default_value_t = 4)]
        domains: u32,
        /// Server ranks per fault domain
        #[arg(long, default_value_t = 2)]
        ranks: u32,
        /// Targets per server rank
        #[arg(long, default_value_t = 8)]
        targets: u32,
    },
    /// Print the pool query for a map file
    Query {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
    },
    /// Resolve the layout of an object
    Place {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
        /// Object id as hi.lo (hex)
        #[arg(long)]
        oid: String,
        /// Object class, e.g. EC_4P2G1 or RP_3G1
        #[arg(long, default_value = "EC_4P2G1")]
        class: ObjectClass,
    },
    /// Mark targets failed
    Exclude {
        #[command(flatten)]
        sel: TargetSelection,
    },
    /// Start draining targets
    Drain {
        #[command(flatten)]
        sel: TargetSelection,
    },
    /// Start reintegrating targets
    Reintegrate {
        #[command(flatten)]
        sel: TargetSelection,
    },
    /// Finish exclusion of DOWN/DRAIN targets
    ExcludeOut {
        #[command(flatten)]
        sel: TargetSelection,
    },
    /// Finish integration of UP targets
    AddIn {
        #[command(flatten)]
        sel: TargetSelection,
    },
    /// Activate NEW targets under the given ranks
    Extend {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
        /// Server ranks to activate
        #[arg(long, value_delimiter = ',')]
        ranks: Vec<u32>,
    },
    /// Splice new fault domains into the map
    ExtendMap {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
        /// Fault domains to add under the first grouping domain
        #[arg(long, default_value_t = 1)]
        domains: u32,
        /// Server ranks per new fault domain
        #[arg(long, default_value_t = 2)]
        ranks: u32,
        /// Targets per new server rank
        #[arg(long, default_value_t = 8)]
        targets: u32,
    },
    /// Shards of an object needing rebuild since a map version
    Rebuild {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
        /// Object id as hi.lo (hex)
        #[arg(long)]
        oid: String,
        /// Object class
        #[arg(long, default_value = "EC_4P2G1")]
        class: ObjectClass,
        /// Base map version
        #[arg(long)]
        since: u32,
    },
    /// Shards of an object moving back to reintegrated targets
    Reint {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
        /// Object id as hi.lo (hex)
        #[arg(long)]
        oid: String,
        /// Object class
        #[arg(long, default_value = "EC_4P2G1")]
        class: ObjectClass,
        /// Base map version
        #[arg(long)]
        since: u32,
    },
    /// Shards of an object preferring targets added since a map version
    Addition {
        /// Pool-map file
        #[arg(short, long)]
        map: PathBuf,
        /// Object id as hi.lo (hex)
        #[arg(long)]
        oid: String,
        /// Object class
        #[arg(long, default_value = "EC_4P2G1")]
        class: ObjectClass,
        /// Base map version
        #[arg(long)]
        since: u32,
    },
}

/// Rank/target selection shared by the state-change commands
#[derive(clap::Args, Debug)]
struct TargetSelection {
    /// Pool-map file
    #[arg(short, long)]
    map: PathBuf,
    /// Server ranks (all their targets when --targets is omitted)
    #[arg(long, value_delimiter = ',')]
    ranks: Vec<u32>,
    /// Explicit target ids
    #[arg(long, value_delimiter = ',')]
    targets: Vec<u32>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(args) {
        let code = err
            .downcast_ref::<rimio_common::Error>()
            .map_or(1, rimio_common::Error::exit_code);
        eprintln!("rimio-ctl: {err:#}");
        std::process::exit(code);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<Config>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    let nrims = args.nrims.unwrap_or(config.placement.nrims);
    let domain = config.placement.domain;

    match args.command {
        Commands::Gen { out, grps, domains, ranks, targets } => {
            let buf = PoolBufBuilder::new(1).build(grps, domains, ranks, targets)?;
            std::fs::write(&out, buf.serialize())
                .with_context(|| format!("writing {}", out.display()))?;
            println!(
                "wrote {} ({} domains, {} targets)",
                out.display(),
                buf.domain_count(),
                buf.target_count()
            );
        }
        Commands::Query { map } => {
            let pool = load(&map)?;
            println!("{}", serde_json::to_string_pretty(&pool.query())?);
        }
        Commands::Place { map, oid, class } => {
            let pool = load(&map)?;
            let rim = rim_for(&pool, nrims, domain)?;
            let mut schema = class.schema();
            let layout = rim.place(&pool, parse_oid(&oid)?, &mut schema)?;
            println!("{}", serde_json::to_string_pretty(&layout)?);
        }
        Commands::Exclude { sel } => {
            // Whole-rank exclusion evicts the rank-level domain as well.
            apply(&sel, TargetStateOp::Exclude, sel.targets.is_empty())?;
        }
        Commands::Drain { sel } => apply(&sel, TargetStateOp::Drain, false)?,
        Commands::Reintegrate { sel } => apply(&sel, TargetStateOp::Reint, false)?,
        Commands::ExcludeOut { sel } => apply(&sel, TargetStateOp::ExcludeOut, false)?,
        Commands::AddIn { sel } => apply(&sel, TargetStateOp::AddIn, false)?,
        Commands::Extend { map, ranks } => {
            let sel = TargetSelection { map, ranks, targets: Vec::new() };
            apply(&sel, TargetStateOp::Extend, false)?;
        }
        Commands::ExtendMap { map, domains, ranks, targets } => {
            let mut pool = load(&map)?;
            let version = pool.version() + 1;

            let next_id = pool_max_id(&pool) + 1;
            let next_rank = pool
                .targets()
                .iter()
                .map(|t| t.co_rank.get())
                .max()
                .unwrap_or(0)
                + 1;
            let next_dom_rank = pool
                .domains(ComponentType::Rank)
                .map(|d| d.comp().co_rank.get())
                .max()
                .unwrap_or(0)
                + 1;
            let root = *pool.root().comp();
            let Some(grp) = pool.domains(ComponentType::Grp).next().map(|d| *d.comp()) else {
                bail!("map has no grouping domain");
            };

            let delta = PoolBufBuilder::extension(version, next_id, next_rank, next_dom_rank)
                .build_under(root, grp, domains, ranks, targets)?;
            pool.extend(version, &delta)?;
            store(&map, &pool)?;
            println!(
                "extended to version {version}: {} targets",
                pool.target_count()
            );
        }
        Commands::Rebuild { map, oid, class, since } => {
            let pool = load(&map)?;
            let rim = rim_for(&pool, nrims, domain)?;
            let mut schema = class.schema();
            let entries =
                rim.find_rebuild(&pool, parse_oid(&oid)?, &mut schema, since, None, usize::MAX)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Reint { map, oid, class, since } => {
            let pool = load(&map)?;
            let rim = rim_for(&pool, nrims, domain)?;
            let mut schema = class.schema();
            let entries =
                rim.find_reint(&pool, parse_oid(&oid)?, &mut schema, since, usize::MAX)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Addition { map, oid, class, since } => {
            let pool = load(&map)?;
            let rim = rim_for(&pool, nrims, domain)?;
            let old = RimMap::build(&pool, since, nrims, domain)?;
            let mut schema = class.schema();
            let entries =
                rim.find_addition(&old, &pool, parse_oid(&oid)?, &mut schema, usize::MAX)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<PoolMap> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let buf = PoolBuf::parse(&bytes)?;
    let version = buf.max_version();
    Ok(PoolMap::create(&buf, version)?)
}

fn store(path: &Path, pool: &PoolMap) -> Result<()> {
    let buf = pool.to_buf()?;
    std::fs::write(path, buf.serialize())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn rim_for(pool: &PoolMap, nrims: u32, domain: ComponentType) -> Result<RimMap> {
    Ok(RimMap::build(pool, pool.version(), nrims, domain)?)
}

fn apply(sel: &TargetSelection, op: TargetStateOp, exclude_rank: bool) -> Result<()> {
    let mut pool = load(&sel.map)?;

    let ids = if sel.targets.is_empty() {
        if sel.ranks.is_empty() {
            bail!("either --ranks or --targets is required");
        }
        let mut ids = Vec::new();
        for &rank in &sel.ranks {
            let dom = pool
                .find_domain_by_rank(Rank::new(rank))
                .with_context(|| format!("rank {rank} not in map"))?;
            ids.extend(
                dom.target_indices()
                    .iter()
                    .map(|&t| pool.targets()[t as usize].co_id),
            );
        }
        ids
    } else {
        sel.targets.clone()
    };

    let version = pool.target_state_update(&ids, op, exclude_rank)?;
    if version == 0 {
        println!("no change");
        return Ok(());
    }
    store(&sel.map, &pool)?;
    println!("map version {version}");
    Ok(())
}

fn pool_max_id(pool: &PoolMap) -> u32 {
    let dom_max = pool
        .domains(ComponentType::Root)
        .chain(pool.domains(ComponentType::Grp))
        .chain(pool.domains(ComponentType::Node))
        .chain(pool.domains(ComponentType::Rank))
        .map(|d| d.comp().co_id)
        .max()
        .unwrap_or(0);
    let tgt_max = pool.targets().iter().map(|t| t.co_id).max().unwrap_or(0);
    dom_max.max(tgt_max)
}

fn parse_oid(s: &str) -> Result<ObjectId> {
    let (hi, lo) = s
        .split_once('.')
        .with_context(|| format!("object id {s:?} is not hi.lo"))?;
    Ok(ObjectId::new(
        u64::from_str_radix(hi, 16).with_context(|| format!("bad object id half {hi:?}"))?,
        u64::from_str_radix(lo, 16).with_context(|| format!("bad object id half {lo:?}"))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oid() {
        let oid = parse_oid("ab12.cd34").unwrap();
        assert_eq!(oid.hi, 0xab12);
        assert_eq!(oid.lo, 0xcd34);
        assert!(parse_oid("ab12").is_err());
        assert!(parse_oid("xyz.1").is_err());
    }
}
