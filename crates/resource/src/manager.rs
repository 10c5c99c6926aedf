//! Resource manager: rank-0 dispatch plus worker ranks
//!
//! Rank 0 distributes work over request/response exchanges: a worker
//! sends a response (carrying its results when it just completed), the
//! manager replies with the next request. Five request kinds mirror the
//! work protocol: replay an old log, walk a reference range, complete
//! outstanding work, terminate, or abort.
//!
//! Ranks are OS threads here; the same entry points would sit behind a
//! transport for a multi-host deployment. A single-rank run degenerates
//! to the manager handling requests itself through the identical code
//! path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use marfs_core::config::NsId;
use marfs_core::error::{Error, Result};
use marfs_datastream::MarfsContext;

use crate::log::{
    self, iteration_root, log_path, outstanding, LogMode, ResourceLog, RECORD_ITERATION_PARENT,
    SUMMARY_FILENAME,
};
use crate::ops::{OperationSummary, WalkReport};
use crate::summary::RunArgs;
use crate::threads::{GlobalState, PoolConfig, ThreadPool};
use crate::walker::{RebuildLoc, Thresholds};

/// Old iterations without a summary, younger than this, block the run;
/// older ones are presumed dead and removed.
pub const INACTIVE_RUN_SKIP_THRESH: i64 = 24 * 60 * 60;

/// Default garbage-collection age (seconds).
pub const GC_THRESH: i64 = 30 * 24 * 60 * 60;

/// Default rebuild age for marker-driven rebuilds (seconds).
pub const RB_M_THRESH: i64 = 2 * 60 * 60;

/// Default rebuild age for location-driven rebuilds (seconds).
pub const RB_L_THRESH: i64 = 10 * 60;

/// Default repack age (seconds).
pub const RP_THRESH: i64 = 60 * 60;

/// Default cleanup age for zombie references (seconds).
pub const CL_THRESH: i64 = 2 * 24 * 60 * 60;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Assembled inputs of one resource-manager run.
pub struct RmanConfig {
    /// Engine context
    pub ctx: Arc<MarfsContext>,
    /// Namespace target sub-path (`"."` = the root namespace)
    pub ns_target: String,
    /// Recurse into subspaces
    pub recurse: bool,
    /// Iteration name (timestamp default is applied by the caller)
    pub iteration: String,
    /// Log root; the MODIFY/RECORD component is appended internally
    pub logroot: PathBuf,
    /// Post-run log preservation root
    pub preserve_root: Option<PathBuf>,
    /// Dry-run: record the plan, execute nothing
    pub dryrun: bool,
    /// Execute a previous dry-run's logs instead of scanning (`-X`)
    pub exec_prev: Option<PathBuf>,
    /// Write usage totals back as the namespace quota view
    pub quotas: bool,
    /// Operation cutoffs
    pub thresholds: Thresholds,
    /// Rebuild location filter
    pub rebuild_loc: Option<RebuildLoc>,
    /// Per-worker pool sizing
    pub pool: PoolConfig,
    /// Worker rank count (at least one)
    pub workers: usize,
    /// Age below which a prior summaryless iteration is considered live
    /// (defaults to [`INACTIVE_RUN_SKIP_THRESH`])
    pub skip_thresh: i64,
}

/// Per-namespace outcome of a run.
#[derive(Debug, Clone)]
pub struct NsOutcome {
    /// Namespace id
    pub ns: NsId,
    /// Namespace id string, for display
    pub ns_id: String,
    /// Walk accumulation
    pub report: WalkReport,
}

/// Whole-run outcome.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Iteration that ran
    pub iteration: String,
    /// A rank died or the journal desynchronized
    pub fatal: bool,
    /// Count of non-fatal operation failures
    pub nonfatal: u64,
    /// Execution tallies over all ranks
    pub summary: OperationSummary,
    /// Per-namespace results
    pub namespaces: Vec<NsOutcome>,
    /// Usage totals were written back
    pub quota_written: bool,
}

// ============================================================================
// Work protocol
// ============================================================================

enum WorkRequest {
    /// Replay an old rank log
    Rlog { old_log: PathBuf },
    /// Walk a slot range of one namespace
    Ns { ns: NsId, start: u64, end: u64 },
    /// Drain threads, finalize the rank log, report results
    Complete,
    /// Exit cleanly
    Terminate,
    /// Purge inputs and exit
    Abort,
}

struct RankResults {
    results: Vec<(NsId, WalkReport)>,
    summary: OperationSummary,
    fatal: Option<String>,
}

struct WorkResponse {
    rank: usize,
    info: Option<RankResults>,
}

// ============================================================================
// Worker rank
// ============================================================================

struct WorkerEnv {
    ctx: Arc<MarfsContext>,
    iteration: String,
    logroot: PathBuf,
    mode: LogMode,
    thresholds: Thresholds,
    rebuild_loc: Option<RebuildLoc>,
    pool: PoolConfig,
    preserve_root: Option<PathBuf>,
}

struct Worker {
    rank: usize,
    env: Arc<WorkerEnv>,
    active: Option<(NsId, Arc<GlobalState>, ThreadPool)>,
    replayed_logs: Vec<PathBuf>,
    gathered: Vec<(NsId, WalkReport)>,
    summary: OperationSummary,
    fatal: Option<String>,
}

impl Worker {
    fn new(rank: usize, env: Arc<WorkerEnv>) -> Self {
        Worker {
            rank,
            env,
            active: None,
            replayed_logs: Vec::new(),
            gathered: Vec::new(),
            summary: OperationSummary::default(),
            fatal: None,
        }
    }

    /// Main loop: respond, receive, handle. Returns when told to exit.
    fn behave(mut self, req_rx: Receiver<WorkRequest>, resp_tx: Sender<WorkResponse>) {
        // the startup hello invites the first request
        if resp_tx.send(WorkResponse { rank: self.rank, info: None }).is_err() {
            return;
        }

        while let Ok(request) = req_rx.recv() {
            let (reply, done) = match request {
                WorkRequest::Rlog { old_log } => (self.handle_rlog(&old_log), false),
                WorkRequest::Ns { ns, start, end } => (self.handle_ns(ns, start, end), false),
                WorkRequest::Complete => (self.handle_complete(), false),
                WorkRequest::Terminate => (None, true),
                WorkRequest::Abort => {
                    if let Some((_, _, pool)) = self.active.take() {
                        let _ = pool.abort();
                    }
                    (None, true)
                }
            };

            if done {
                return;
            }
            if resp_tx.send(WorkResponse { rank: self.rank, info: reply }).is_err() {
                return;
            }
            if self.fatal.is_some() {
                // the manager learns from the response; wait for Abort
                continue;
            }
        }
    }

    fn note_fatal(&mut self, msg: String) {
        warn!(rank = self.rank, "{}", msg);
        if self.fatal.is_none() {
            self.fatal = Some(msg);
        }
    }

    /// Open (or reuse) the pool bound to one namespace's rank log.
    fn ensure_pool(&mut self, ns: NsId) -> Result<()> {
        if let Some((active_ns, _, _)) = &self.active {
            if *active_ns == ns {
                return Ok(());
            }
            self.quiesce()?;
        }

        let ns_escaped = self.env.ctx.ns(ns).escaped_id();
        let path = log_path(
            &self.env.logroot,
            self.env.mode,
            &self.env.iteration,
            &ns_escaped,
            self.rank,
        );
        let rlog = ResourceLog::open(&path, self.env.mode)?;
        let gstate = Arc::new(GlobalState::new(
            Arc::clone(&self.env.ctx),
            rlog,
            self.env.mode == LogMode::Record,
            self.env.thresholds,
            self.env.rebuild_loc,
        ));
        let pool = ThreadPool::spawn(Arc::clone(&gstate), self.env.pool);
        self.active = Some((ns, gstate, pool));
        Ok(())
    }

    /// Drain the active pool and absorb its results.
    fn quiesce(&mut self) -> Result<()> {
        let Some((ns, gstate, pool)) = self.active.take() else {
            return Ok(());
        };
        let drained = pool.drain();

        for (ns, report) in gstate.reports.lock().drain() {
            self.gathered.push((ns, report));
        }
        self.summary.absorb(&gstate.summary.lock());

        // release the journal's exclusive lock before it is re-read
        drop(gstate);

        drained?;

        // the round is journaled and executed; old logs it replayed are
        // done for good
        for old in self.replayed_logs.drain(..) {
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "failed to remove replayed log");
            }
            prune_empty_dirs(&old);
        }

        self.finalize_rank_log(ns)?;
        Ok(())
    }

    /// Move or remove the finished rank log per preservation policy.
    /// Record-mode logs always stay: they are the plan `-X` executes.
    fn finalize_rank_log(&self, ns: NsId) -> Result<()> {
        if self.env.mode == LogMode::Record {
            return Ok(());
        }
        let ns_escaped = self.env.ctx.ns(ns).escaped_id();
        let path = log_path(
            &self.env.logroot,
            self.env.mode,
            &self.env.iteration,
            &ns_escaped,
            self.rank,
        );
        if !outstanding(&path)?.is_empty() {
            // incomplete ops stay for the next run's pickup
            return Ok(());
        }

        if let Some(preserve) = &self.env.preserve_root {
            let target = log_path(preserve, self.env.mode, &self.env.iteration, &ns_escaped, self.rank);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&path, &target)?;
        } else {
            fs::remove_file(&path)?;
        }
        prune_empty_dirs(&path);
        Ok(())
    }

    fn handle_rlog(&mut self, old_log: &Path) -> Option<RankResults> {
        let outcome = (|| -> Result<()> {
            let ns_escaped = old_log
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::integrity("old log path lacks a namespace component"))?;
            let ns = self
                .env
                .ctx
                .config
                .namespace_by_id_str(&ns_escaped.replace('#', "/"))
                .ok_or_else(|| Error::NotFound(format!("namespace {}", ns_escaped)))?;

            let chain = outstanding(old_log)?;
            info!(rank = self.rank, log = %old_log.display(), ops = chain.len(), "replaying old log");

            self.ensure_pool(ns)?;
            let (_, gstate, _) = self.active.as_ref().unwrap_or_else(|| unreachable!());
            if !chain.is_empty() {
                // journal recovered starts before the old file goes away
                gstate.rlog.lock().log_start(&chain)?;
                gstate.input.push_replay(chain);
            }
            self.replayed_logs.push(old_log.to_path_buf());
            Ok(())
        })();

        if let Err(e) = outcome {
            self.note_fatal(format!("rank {}: log replay failed: {}", self.rank, e));
            return Some(self.take_results());
        }
        None
    }

    fn handle_ns(&mut self, ns: NsId, start: u64, end: u64) -> Option<RankResults> {
        debug!(rank = self.rank, start, end, "namespace range assigned");
        if let Err(e) = self.ensure_pool(ns) {
            self.note_fatal(format!("rank {}: pool setup failed: {}", self.rank, e));
            return Some(self.take_results());
        }
        let (_, gstate, _) = self.active.as_ref().unwrap_or_else(|| unreachable!());
        gstate.input.push_range(ns, start, end);
        None
    }

    fn handle_complete(&mut self) -> Option<RankResults> {
        if let Err(e) = self.quiesce() {
            self.note_fatal(format!("rank {}: drain failed: {}", self.rank, e));
        }
        Some(self.take_results())
    }

    fn take_results(&mut self) -> RankResults {
        RankResults {
            results: std::mem::take(&mut self.gathered),
            summary: std::mem::take(&mut self.summary),
            fatal: self.fatal.clone(),
        }
    }
}

/// Drop now-empty parents of a removed log file (namespace dir, then the
/// iteration dir).
fn prune_empty_dirs(log: &Path) {
    let mut dir = log.parent();
    for _ in 0..2 {
        match dir {
            Some(d) => {
                if fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
            None => break,
        }
    }
}

// ============================================================================
// Manager rank
// ============================================================================

struct RankState {
    sender: Sender<WorkRequest>,
    handle: JoinHandle<()>,
    active_ns: Option<NsId>,
    busy: bool,
    terminated: bool,
}

/// Run a full resource-manager iteration.
pub fn run(cfg: RmanConfig) -> Result<RunOutcome> {
    let mode = if cfg.dryrun { LogMode::Record } else { LogMode::Modify };
    let ctx = &cfg.ctx;

    if cfg.exec_prev.is_some() && cfg.dryrun {
        return Err(Error::config("-X is incompatible with a new dry-run"));
    }

    // the namespaces this run walks
    let namespaces = find_namespaces(ctx, &cfg.ns_target, cfg.recurse)?;
    if namespaces.is_empty() {
        return Err(Error::NotFound(format!("namespace target \"{}\"", cfg.ns_target)));
    }

    // old-log pickup, or the -X plan. A run that modifies content bounds
    // the pickup by the cleanup threshold: anything newer may hold
    // conflicting operations and refuses the run.
    let modifying = cfg.thresholds.gc.is_some()
        || cfg.thresholds.rebuild.is_some()
        || cfg.thresholds.repack.is_some()
        || cfg.thresholds.cleanup.is_some();
    let modify_cutoff = modifying.then(|| cfg.thresholds.cleanup.unwrap_or(0));
    let (mut oldlogs, prev_cleanup) = match &cfg.exec_prev {
        Some(prev) => (collect_exec_prev(prev)?, Some(prev.clone())),
        None => (
            find_old_logs(
                &cfg.logroot,
                LogMode::Modify,
                &cfg.iteration,
                cfg.skip_thresh,
                modify_cutoff,
            )?,
            None,
        ),
    };

    // the summary marks this iteration as started
    let it_root = iteration_root(&cfg.logroot, mode, &cfg.iteration);
    let args = RunArgs {
        config_version: ctx.config.version,
        ns_target: cfg.ns_target.clone(),
        recurse: cfg.recurse,
        iteration: cfg.iteration.clone(),
        dryrun: cfg.dryrun,
        quotas: cfg.quotas,
        thresholds: cfg.thresholds,
        rebuild_location: cfg.rebuild_loc,
    };
    args.write_summary(&it_root)?;

    let env = Arc::new(WorkerEnv {
        ctx: Arc::clone(ctx),
        iteration: cfg.iteration.clone(),
        logroot: cfg.logroot.clone(),
        mode,
        thresholds: cfg.thresholds,
        rebuild_loc: cfg.rebuild_loc,
        pool: cfg.pool,
        preserve_root: cfg.preserve_root.clone(),
    });

    // spawn worker ranks
    let (resp_tx, resp_rx) = mpsc::channel::<WorkResponse>();
    let mut ranks: Vec<RankState> = (0..cfg.workers.max(1))
        .map(|rank| {
            let (req_tx, req_rx) = mpsc::channel::<WorkRequest>();
            let env = Arc::clone(&env);
            let resp_tx = resp_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rman-worker-{}", rank))
                .spawn(move || Worker::new(rank, env).behave(req_rx, resp_tx))
                .expect("failed to spawn worker rank");
            RankState { sender: req_tx, handle, active_ns: None, busy: false, terminated: false }
        })
        .collect();
    drop(resp_tx);

    // distribution state
    let slot_totals: HashMap<NsId, u64> =
        namespaces.iter().map(|ns| (*ns, ctx.config.reference_slots(*ns))).collect();
    let mut distributed: HashMap<NsId, u64> = namespaces.iter().map(|ns| (*ns, 0)).collect();
    let scan_enabled = cfg.exec_prev.is_none();
    let dispatch_span: u64 = {
        let total: u64 = slot_totals.values().sum();
        (total / (cfg.workers.max(1) as u64 * 4)).max(1)
    };

    let mut walkreports: HashMap<NsId, WalkReport> = HashMap::new();
    let mut summary = OperationSummary::default();
    let mut fatal = false;

    // request/response loop until every rank terminates
    while ranks.iter().any(|r| !r.terminated) {
        let response = match resp_rx.recv() {
            Ok(r) => r,
            Err(_) => break, // every worker hung up
        };
        let rank_no = response.rank;

        if let Some(info) = response.info {
            for (ns, report) in &info.results {
                walkreports.entry(*ns).or_default().absorb(report);
            }
            summary.absorb(&info.summary);
            if let Some(msg) = info.fatal {
                warn!(rank = rank_no, "rank reported fatal: {}", msg);
                fatal = true;
            }
            let rank = &mut ranks[rank_no];
            rank.busy = false;
            rank.active_ns = None;
        }

        let request = next_request(
            rank_no,
            &mut ranks,
            fatal,
            &mut oldlogs,
            &namespaces,
            &slot_totals,
            &mut distributed,
            scan_enabled,
            dispatch_span,
        );

        let rank = &mut ranks[rank_no];
        match &request {
            WorkRequest::Terminate | WorkRequest::Abort => rank.terminated = true,
            WorkRequest::Complete => {}
            _ => rank.busy = true,
        }
        if rank.sender.send(request).is_err() {
            rank.terminated = true;
            fatal = true;
        }
    }

    for rank in ranks {
        if rank.handle.join().is_err() {
            fatal = true;
        }
    }

    // quota post-pass
    let mut quota_written = false;
    if cfg.quotas && !fatal {
        for ns in &namespaces {
            let report = walkreports.get(ns).copied().unwrap_or_default();
            let namespace = ctx.ns(*ns);
            ctx.mdal.set_inode_usage(namespace, report.fileusage)?;
            ctx.mdal.set_data_usage(namespace, report.byteusage)?;
        }
        quota_written = true;
    }

    if !fatal {
        cleanup_iteration(&cfg, mode, &it_root)?;
        if let Some(prev) = prev_cleanup {
            cleanup_prev_iteration(&prev);
        }
    }

    let namespaces = namespaces
        .iter()
        .map(|ns| NsOutcome {
            ns: *ns,
            ns_id: ctx.ns(*ns).id_str.clone(),
            report: walkreports.get(ns).copied().unwrap_or_default(),
        })
        .collect();

    Ok(RunOutcome {
        iteration: cfg.iteration,
        fatal,
        nonfatal: summary.failures(),
        summary,
        namespaces,
        quota_written,
    })
}

/// Decide the next request for a responding rank.
#[allow(clippy::too_many_arguments)]
fn next_request(
    rank_no: usize,
    ranks: &mut [RankState],
    fatal: bool,
    oldlogs: &mut Vec<PathBuf>,
    namespaces: &[NsId],
    slot_totals: &HashMap<NsId, u64>,
    distributed: &mut HashMap<NsId, u64>,
    scan_enabled: bool,
    dispatch_span: u64,
) -> WorkRequest {
    let rank = &mut ranks[rank_no];

    if fatal {
        return WorkRequest::Abort;
    }

    if let Some(old) = oldlogs.pop() {
        rank.active_ns = None;
        return WorkRequest::Rlog { old_log: old };
    }

    if scan_enabled {
        // keep a rank on its namespace while slots remain
        if let Some(ns) = rank.active_ns {
            if let Some(range) = take_range(ns, slot_totals, distributed, dispatch_span) {
                return WorkRequest::Ns { ns, start: range.0, end: range.1 };
            }
        }
        if rank.busy {
            return WorkRequest::Complete;
        }
        for ns in namespaces {
            if let Some(range) = take_range(*ns, slot_totals, distributed, dispatch_span) {
                rank.active_ns = Some(*ns);
                return WorkRequest::Ns { ns: *ns, start: range.0, end: range.1 };
            }
        }
    }

    if rank.busy {
        return WorkRequest::Complete;
    }
    WorkRequest::Terminate
}

fn take_range(
    ns: NsId,
    slot_totals: &HashMap<NsId, u64>,
    distributed: &mut HashMap<NsId, u64>,
    span: u64,
) -> Option<(u64, u64)> {
    let total = *slot_totals.get(&ns)?;
    let next = distributed.get_mut(&ns)?;
    if *next >= total {
        return None;
    }
    let start = *next;
    let end = (start + span).min(total);
    *next = end;
    Some((start, end))
}

/// Resolve the namespace target (and subspaces under `-r`), skipping
/// ghosts: they own no storage to walk.
fn find_namespaces(ctx: &MarfsContext, target: &str, recurse: bool) -> Result<Vec<NsId>> {
    let base = if target == "." || target == "/" || target.is_empty() {
        ctx.config.root()
    } else {
        ctx.config.find_namespace(target)?
    };

    let ids = if recurse { ctx.config.subtree(base) } else { vec![base] };
    Ok(ids
        .into_iter()
        .filter(|ns| !ctx.config.namespace(*ns).is_ghost())
        .collect())
}

/// Scan the modify tree for prior iterations: replay those with a closed
/// summary that are safely old, delete long-dead summaryless ones, and
/// refuse the run outright when an unfinished iteration is recent enough
/// to hold conflicting operations.
///
/// `modify_cutoff` is the cleanup-threshold bound applied on
/// content-modifying runs: a summary-bearing iteration whose summary is
/// newer than the cutoff may still have operations racing ours, and only
/// the operator can resolve that.
fn find_old_logs(
    logroot: &Path,
    mode: LogMode,
    current: &str,
    skip_thresh: i64,
    modify_cutoff: Option<i64>,
) -> Result<Vec<PathBuf>> {
    let root = log::mode_root(logroot, mode);
    let entries = match fs::read_dir(&root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let now = now_secs();
    let mut logs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == current || !entry.file_type()?.is_dir() {
            continue;
        }
        let it_root = entry.path();
        let summary_path = it_root.join(SUMMARY_FILENAME);

        match fs::metadata(&summary_path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if let Some(cutoff) = modify_cutoff {
                    if mtime > cutoff {
                        return Err(Error::Fatal(format!(
                            "iteration \"{}\" holds possibly conflicting operations newer than the cleanup threshold; operator must resolve",
                            name
                        )));
                    }
                }
                info!(iteration = %name, "picking up prior iteration's logs");
                collect_rank_logs(&it_root, &mut logs)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let age = entry
                    .metadata()?
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| now - d.as_secs() as i64)
                    .unwrap_or(i64::MAX);
                if age > skip_thresh {
                    warn!(iteration = %name, "removing dead summaryless iteration");
                    let _ = fs::remove_dir_all(&it_root);
                } else {
                    return Err(Error::Fatal(format!(
                        "iteration \"{}\" has no summary and is recent; operator must resolve",
                        name
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(logs)
}

/// All rank logs of a `-X` target iteration. The path must contain the
/// record-mode component; only dry-run plans are executable this way.
fn collect_exec_prev(prev: &Path) -> Result<Vec<PathBuf>> {
    let has_record = prev
        .components()
        .any(|c| c.as_os_str() == RECORD_ITERATION_PARENT);
    if !has_record {
        return Err(Error::config(format!(
            "execution target \"{}\" lacks the {} component",
            prev.display(),
            RECORD_ITERATION_PARENT
        )));
    }
    RunArgs::read_summary(prev)?;

    let mut logs = Vec::new();
    collect_rank_logs(prev, &mut logs)?;
    if logs.is_empty() {
        return Err(Error::NotFound(format!("no rank logs under \"{}\"", prev.display())));
    }
    Ok(logs)
}

fn collect_rank_logs(it_root: &Path, logs: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(it_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        for log in fs::read_dir(entry.path())? {
            let log = log?;
            if log.path().extension().is_some_and(|e| e == "log") {
                logs.push(log.path());
            }
        }
    }
    Ok(())
}

/// Remove (or preserve) this iteration's summary and directory. Record
/// mode keeps everything: the tree is the product.
fn cleanup_iteration(cfg: &RmanConfig, mode: LogMode, it_root: &Path) -> Result<()> {
    if mode == LogMode::Record {
        return Ok(());
    }
    let summary_path = it_root.join(SUMMARY_FILENAME);
    if let Some(preserve) = &cfg.preserve_root {
        let target_root = iteration_root(preserve, mode, &cfg.iteration);
        fs::create_dir_all(&target_root)?;
        fs::copy(&summary_path, target_root.join(SUMMARY_FILENAME))?;
    }
    if let Err(e) = fs::remove_file(&summary_path) {
        warn!(path = %summary_path.display(), error = %e, "failed to remove summary log");
    }
    if let Err(e) = fs::remove_dir(it_root) {
        debug!(path = %it_root.display(), error = %e, "iteration root not yet empty");
    }
    Ok(())
}

/// Remove the `-X` target's summary and directory after its plan has
/// fully executed.
fn cleanup_prev_iteration(prev: &Path) {
    let _ = fs::remove_file(prev.join(SUMMARY_FILENAME));
    let _ = fs::remove_dir(prev);
}

/// Default iteration name: a local timestamp.
pub fn default_iteration() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H:%M:%S").to_string()
}

/// Compute threshold cutoffs from enable flags and per-op overrides,
/// mirroring the `-G/-R/-P/-C` and `-T` argument semantics.
#[allow(clippy::too_many_arguments)]
pub fn resolve_thresholds(
    now: i64,
    gc: bool,
    rebuild: bool,
    repack: bool,
    cleanup: bool,
    gc_age: Option<i64>,
    rebuild_age: Option<i64>,
    repack_age: Option<i64>,
    cleanup_age: Option<i64>,
    location_rebuild: bool,
) -> Thresholds {
    let default_rb = if location_rebuild { RB_L_THRESH } else { RB_M_THRESH };
    Thresholds {
        gc: gc.then(|| now - gc_age.unwrap_or(GC_THRESH)),
        rebuild: rebuild.then(|| now - rebuild_age.unwrap_or(default_rb)),
        repack: repack.then(|| now - repack_age.unwrap_or(RP_THRESH)),
        cleanup: cleanup.then(|| now - cleanup_age.unwrap_or(CL_THRESH)),
    }
}
