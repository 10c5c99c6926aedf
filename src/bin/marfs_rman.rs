//! marfs-rman: the MarFS resource manager
//!
//! Walks namespace reference trees to garbage-collect deleted streams,
//! verify rebuild candidates, account quota usage, and replay the
//! journals of interrupted runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};

use marfs::{
    default_iteration, resolve_thresholds, ConfigLoader, MarfsContext, PoolConfig, PosixDal,
    PosixMdal, RebuildLoc, RmanConfig, RunOutcome,
};

const DEFAULT_LOG_ROOT: &str = "/var/marfs/rman-logs";

fn build_cli() -> Command {
    Command::new("marfs-rman")
        .about("MarFS resource manager: GC, rebuild, repack, and quota accounting")
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("CONFIG")
                .help("MarFS config path (falls back to MARFS_CONFIG_PATH)"),
        )
        .arg(
            Arg::new("namespace")
                .short('n')
                .value_name("NS-PATH")
                .default_value(".")
                .help("Namespace target (defaults to the root namespace)"),
        )
        .arg(
            Arg::new("recurse")
                .short('r')
                .action(ArgAction::SetTrue)
                .help("Operate recursively on subspaces"),
        )
        .arg(
            Arg::new("iteration")
                .short('i')
                .value_name("NAME")
                .help("Iteration name (defaults to a timestamp)"),
        )
        .arg(
            Arg::new("logroot")
                .short('l')
                .value_name("DIR")
                .default_value(DEFAULT_LOG_ROOT)
                .help("Resource log storage root"),
        )
        .arg(
            Arg::new("preserve")
                .short('p')
                .value_name("DIR")
                .help("Preserve logs here post-run (deleted otherwise)"),
        )
        .arg(
            Arg::new("dryrun")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Dry-run: log the plan, execute nothing"),
        )
        .arg(
            Arg::new("execprev")
                .short('X')
                .value_name("ITERATION-DIR")
                .help("Execute a previous dry-run's logged plan"),
        )
        .arg(Arg::new("quotas").short('Q').action(ArgAction::SetTrue).help("Set NS usage values"))
        .arg(Arg::new("gc").short('G').action(ArgAction::SetTrue).help("Perform garbage collection"))
        .arg(Arg::new("rebuild").short('R').action(ArgAction::SetTrue).help("Perform rebuilds"))
        .arg(Arg::new("repack").short('P').action(ArgAction::SetTrue).help("Perform repacks (currently rejected at execution)"))
        .arg(Arg::new("cleanup").short('C').action(ArgAction::SetTrue).help("Clean up failed operations"))
        .arg(
            Arg::new("thresholds")
                .short('T')
                .value_name("SPEC")
                .help("Per-op time thresholds: <op><n>[smhd][-<op><n>[smhd>]]* with op in G/R/P/C"),
        )
        .arg(
            Arg::new("location")
                .short('L')
                .value_name("LOC")
                .num_args(0..=1)
                .default_missing_value("")
                .help("Rebuild location filter p<n>-c<n>-s<n> (empty = all objects)"),
        )
}

/// Parse a `-T` value like `G30d-R12h-C90m`.
fn parse_thresholds(spec: &str) -> anyhow::Result<[Option<i64>; 4]> {
    let mut ages = [None, None, None, None]; // G, R, P, C
    for part in spec.split('-').filter(|p| !p.is_empty()) {
        let mut chars = part.chars();
        let flag = chars.next().context("empty threshold component")?;
        let rest: String = chars.collect();
        let (digits, unit) = match rest.chars().last() {
            Some(u @ ('s' | 'm' | 'h' | 'd')) => (&rest[..rest.len() - 1], u),
            _ => (rest.as_str(), 's'),
        };
        let value: i64 = digits.parse().with_context(|| format!("bad threshold \"{}\"", part))?;
        let secs = match unit {
            's' => value,
            'm' => value * 60,
            'h' => value * 60 * 60,
            'd' => value * 60 * 60 * 24,
            _ => unreachable!(),
        };
        let idx = match flag {
            'G' => 0,
            'R' => 1,
            'P' => 2,
            'C' => 3,
            other => bail!("unknown threshold op flag '{}'", other),
        };
        ages[idx] = Some(secs);
    }
    Ok(ages)
}

/// Parse a `-L` value like `p1-c2-s3`; an empty value matches all
/// objects.
fn parse_location(spec: &str) -> anyhow::Result<RebuildLoc> {
    let mut loc = RebuildLoc::default();
    for part in spec.split('-').filter(|p| !p.is_empty()) {
        if !part.is_char_boundary(1) {
            bail!("bad location component \"{}\"", part);
        }
        let (flag, value) = part.split_at(1);
        let parsed: usize =
            value.parse().with_context(|| format!("bad location component \"{}\"", part))?;
        match flag {
            "p" => loc.pod = Some(parsed),
            "c" => loc.cap = Some(parsed),
            "s" => loc.scatter = Some(parsed),
            other => bail!("unknown location flag '{}'", other),
        }
    }
    Ok(loc)
}

fn print_outcome(outcome: &RunOutcome) {
    for ns in &outcome.namespaces {
        let r = &ns.report;
        println!("Namespace {}", ns.ns_id);
        println!("  files found / in use:    {} / {}", r.filecount, r.fileusage);
        println!("  bytes found / in use:    {} / {}", r.bytecount, r.byteusage);
        println!("  streams / objects:       {} / {}", r.streamcount, r.objcount);
        println!("  deleted objs/files/strm: {} / {} / {}", r.delobjs, r.delfiles, r.delstreams);
        println!("  volatile files:          {}", r.volfiles);
        println!("  repack files / bytes:    {} / {}", r.rpckfiles, r.rpckbytes);
        println!("  rebuild objs / bytes:    {} / {}", r.rbldobjs, r.rbldbytes);
    }
    let s = &outcome.summary;
    println!("Iteration {}", outcome.iteration);
    println!(
        "  executed: {} obj-del, {} ref-del, {} rebuild, {} repack ({} failures)",
        s.deletion_object_count,
        s.deletion_reference_count,
        s.rebuild_count,
        s.repack_count,
        s.failures()
    );
}

fn run() -> anyhow::Result<RunOutcome> {
    let matches = build_cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .or_else(|| std::env::var("MARFS_CONFIG_PATH").ok())
        .context("no config path: pass -c or set MARFS_CONFIG_PATH")?;
    let config = Arc::new(ConfigLoader::from_file(config_path.as_ref())?);

    // the POSIX layers take their roots from the root namespace's repo
    let root_repo = config.repo(config.namespace(config.root()).repo).clone();
    let mdal = Arc::new(PosixMdal::from_config(&root_repo.mdal)?);
    let dal = Arc::new(PosixDal::from_config(&root_repo.dal)?);
    let ctx = Arc::new(MarfsContext::new(config, mdal, dal));

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let location = match matches.get_one::<String>("location") {
        Some(spec) => Some(parse_location(spec)?),
        None => None,
    };
    let ages = match matches.get_one::<String>("thresholds") {
        Some(spec) => parse_thresholds(spec)?,
        None => [None; 4],
    };

    let exec_prev = matches.get_one::<String>("execprev").map(PathBuf::from);
    if exec_prev.is_some()
        && (matches.get_flag("gc")
            || matches.get_flag("rebuild")
            || matches.get_flag("repack")
            || matches.get_flag("cleanup")
            || matches.get_one::<String>("iteration").is_some())
    {
        bail!("-G, -R, -P, -C, and -i are incompatible with -X");
    }

    let thresholds = resolve_thresholds(
        now,
        matches.get_flag("gc"),
        matches.get_flag("rebuild"),
        matches.get_flag("repack"),
        matches.get_flag("cleanup"),
        ages[0],
        ages[1],
        ages[2],
        ages[3],
        location.is_some(),
    );

    let iteration = match &exec_prev {
        Some(prev) => prev
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("-X path has no iteration component")?,
        None => matches
            .get_one::<String>("iteration")
            .cloned()
            .unwrap_or_else(default_iteration),
    };

    let outcome = marfs::run_resource_manager(RmanConfig {
        ctx,
        ns_target: matches.get_one::<String>("namespace").cloned().unwrap_or_else(|| ".".into()),
        recurse: matches.get_flag("recurse"),
        iteration,
        logroot: PathBuf::from(matches.get_one::<String>("logroot").cloned().unwrap_or_else(|| DEFAULT_LOG_ROOT.into())),
        preserve_root: matches.get_one::<String>("preserve").map(PathBuf::from),
        dryrun: matches.get_flag("dryrun"),
        exec_prev,
        quotas: matches.get_flag("quotas"),
        thresholds,
        rebuild_loc: location,
        pool: PoolConfig::default(),
        workers: std::thread::available_parallelism().map(|n| n.get().min(8)).unwrap_or(2),
        skip_thresh: marfs_resource::manager::INACTIVE_RUN_SKIP_THRESH,
    })?;

    print_outcome(&outcome);
    Ok(outcome)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(outcome) if outcome.fatal => ExitCode::from(255),
        Ok(outcome) => {
            let nonfatal = outcome.nonfatal.min(254) as u8;
            ExitCode::from(nonfatal)
        }
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::from(255)
        }
    }
}
