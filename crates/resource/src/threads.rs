//! Per-worker thread pool
//!
//! One bounded channel carries operation chains from producer threads
//! (which scan reference directories and walk streams) to consumer
//! threads (which execute operations and journal completions). Explicit
//! poison messages end consumers; producers end when the resource input
//! closes or purges.
//!
//! A thread that cannot continue purges the resource input so no peer
//! blocks forever, flags the rank fatal, and exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use marfs_core::config::NsId;
use marfs_core::error::{Error, Result};
use marfs_access::mdal::RefEntryKind;
use marfs_datastream::{paths, MarfsContext};

use crate::exec;
use crate::input::{InputItem, ResourceInput};
use crate::log::ResourceLog;
use crate::ops::{Operation, OperationSummary, WalkReport};
use crate::walker::{marker_op, RebuildLoc, StreamWalker, Thresholds};

/// Messages on the work channel.
enum QueueMsg {
    /// An operation chain to execute
    Work(Vec<Operation>),
    /// Terminate the receiving consumer
    Poison,
}

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Producer (scanning/walking) threads
    pub producers: usize,
    /// Consumer (executing) threads
    pub consumers: usize,
    /// Bounded queue depth
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { producers: 2, consumers: 2, queue_depth: 64 }
    }
}

/// State shared by every thread of one rank.
pub struct GlobalState {
    /// Engine context
    pub ctx: Arc<MarfsContext>,
    /// Record mode: log the plan, execute nothing
    pub dryrun: bool,
    /// Operation cutoffs
    pub thresholds: Thresholds,
    /// Location filter for rebuilds
    pub rebuild_loc: Option<RebuildLoc>,
    /// Input feed
    pub input: ResourceInput,
    /// This rank's journal
    pub rlog: Mutex<ResourceLog>,
    /// Per-namespace walk accumulation
    pub reports: Mutex<HashMap<NsId, WalkReport>>,
    /// Execution tallies
    pub summary: Mutex<OperationSummary>,
    /// Rank-fatal flag
    pub fatal: AtomicBool,
    /// First fatal error description
    pub error: Mutex<String>,
}

impl GlobalState {
    /// Fresh state around a context and an open journal.
    pub fn new(
        ctx: Arc<MarfsContext>,
        rlog: ResourceLog,
        dryrun: bool,
        thresholds: Thresholds,
        rebuild_loc: Option<RebuildLoc>,
    ) -> Self {
        GlobalState {
            ctx,
            dryrun,
            thresholds,
            rebuild_loc,
            input: ResourceInput::new(),
            rlog: Mutex::new(rlog),
            reports: Mutex::new(HashMap::new()),
            summary: Mutex::new(OperationSummary::default()),
            fatal: AtomicBool::new(false),
            error: Mutex::new(String::new()),
        }
    }

    fn flag_fatal(&self, msg: String) {
        error!("{}", msg);
        let mut error = self.error.lock();
        if error.is_empty() {
            *error = msg;
        }
        drop(error);
        self.fatal.store(true, Ordering::SeqCst);
        self.input.purge();
    }

    /// Log the start of a chain before distribution.
    fn journal_start(&self, chain: &[Operation]) -> Result<()> {
        self.rlog.lock().log_start(chain)
    }
}

/// Running producer/consumer threads of one rank.
pub struct ThreadPool {
    gstate: Arc<GlobalState>,
    producers: Vec<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
    tx: SyncSender<QueueMsg>,
}

impl ThreadPool {
    /// Start the pool.
    pub fn spawn(gstate: Arc<GlobalState>, config: PoolConfig) -> ThreadPool {
        let (tx, rx) = mpsc::sync_channel::<QueueMsg>(config.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let producers = (0..config.producers.max(1))
            .map(|id| {
                let gstate = Arc::clone(&gstate);
                let tx = tx.clone();
                std::thread::Builder::new()
                    .name(format!("rprod-{}", id))
                    .spawn(move || producer_loop(id, &gstate, &tx))
                    .expect("failed to spawn producer thread")
            })
            .collect();

        let consumers = (0..config.consumers.max(1))
            .map(|id| {
                let gstate = Arc::clone(&gstate);
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("rcons-{}", id))
                    .spawn(move || consumer_loop(id, &gstate, &rx))
                    .expect("failed to spawn consumer thread")
            })
            .collect();

        ThreadPool { gstate, producers, consumers, tx }
    }

    /// Drain: close the input, wait for producers to finish feeding,
    /// poison every consumer, and join them all.
    pub fn drain(self) -> Result<()> {
        self.gstate.input.close();
        for handle in self.producers {
            if handle.join().is_err() {
                self.gstate.fatal.store(true, Ordering::SeqCst);
            }
        }
        for _ in 0..self.consumers.len() {
            // consumers may already be gone after a fatal purge
            let _ = self.tx.send(QueueMsg::Poison);
        }
        drop(self.tx);
        for handle in self.consumers {
            if handle.join().is_err() {
                self.gstate.fatal.store(true, Ordering::SeqCst);
            }
        }

        if self.gstate.fatal.load(Ordering::SeqCst) {
            Err(Error::Fatal(self.gstate.error.lock().clone()))
        } else {
            Ok(())
        }
    }

    /// Abort: purge the input first, then drain.
    pub fn abort(self) -> Result<()> {
        self.gstate.input.purge();
        self.drain()
    }
}

fn producer_loop(id: usize, gstate: &GlobalState, tx: &SyncSender<QueueMsg>) {
    debug!(thread = id, "producer started");
    loop {
        match gstate.input.next() {
            InputItem::Finished => break,
            InputItem::Replay(chain) => {
                if let Err(e) = gstate.journal_start(&chain) {
                    gstate.flag_fatal(format!("producer {}: failed to journal replay chain: {}", id, e));
                    return;
                }
                if tx.send(QueueMsg::Work(chain)).is_err() {
                    return;
                }
            }
            InputItem::RefSlot(ns, slot) => {
                if let Err(e) = process_refdir(gstate, tx, ns, slot) {
                    gstate.flag_fatal(format!(
                        "producer {}: failed to process reference slot {}: {}",
                        id, slot, e
                    ));
                    return;
                }
            }
        }
    }
    debug!(thread = id, "producer finished");
}

/// Scan one reference directory: dispatch marker ops, walk every stream
/// head, and finally drop the directory if it emptied out.
fn process_refdir(
    gstate: &GlobalState,
    tx: &SyncSender<QueueMsg>,
    ns: NsId,
    slot: u64,
) -> Result<()> {
    let ctx = &gstate.ctx;
    let ref_dir = paths::ref_dir_for_slot(&ctx.config, ns, slot);
    let mut scanner = ctx.mdal.scan(&ref_dir)?;

    while let Some(entry) = scanner.next_entry()? {
        match entry.kind {
            RefEntryKind::StreamStart => {
                let mut walker =
                    StreamWalker::open(ctx, ns, &entry.name, gstate.thresholds, gstate.rebuild_loc)?;
                while let Some(chain) = walker.iterate()? {
                    gstate.journal_start(&chain)?;
                    if tx.send(QueueMsg::Work(chain)).is_err() {
                        return Ok(());
                    }
                }
                let report = walker.close();
                gstate.reports.lock().entry(ns).or_default().absorb(&report);
            }
            RefEntryKind::RebuildMarker | RefEntryKind::RepackMarker => {
                if let Some(op) = marker_op(ctx, &ref_dir, &entry, gstate.thresholds)? {
                    let mut reports = gstate.reports.lock();
                    let report = reports.entry(ns).or_default();
                    report.rbldobjs += 1;
                    report.rbldbytes += op.ftag.chunk_size;
                    drop(reports);

                    let chain = vec![op];
                    gstate.journal_start(&chain)?;
                    if tx.send(QueueMsg::Work(chain)).is_err() {
                        return Ok(());
                    }
                }
            }
            RefEntryKind::StreamFile => {
                // walked through its stream head
            }
            RefEntryKind::Unknown => {
                tracing::warn!(dir = %ref_dir.display(), entry = %entry.name, "ignoring unknown reference entry");
            }
        }
    }

    exec::cleanup_refdir(ctx, &ref_dir, gstate.thresholds.gc.is_some());
    Ok(())
}

fn consumer_loop(id: usize, gstate: &GlobalState, rx: &Mutex<Receiver<QueueMsg>>) {
    debug!(thread = id, "consumer started");
    loop {
        let msg = {
            let guard = rx.lock();
            guard.recv()
        };
        let chain = match msg {
            Ok(QueueMsg::Work(chain)) => chain,
            Ok(QueueMsg::Poison) | Err(_) => break,
        };

        for op in &chain {
            if gstate.dryrun {
                info!(op = op.kind.name(), stream = %op.ftag.stream_id, "discarding operation (dry-run)");
                continue;
            }

            info!(op = op.kind.name(), stream = %op.ftag.stream_id, "executing operation");
            let result = {
                let mut summary = gstate.summary.lock();
                exec::execute(&gstate.ctx, op, &mut summary)
            };

            // a journaling failure desynchronizes the log from reality:
            // fatal for the rank
            if let Err(e) = gstate.rlog.lock().log_complete(op, result.is_ok()) {
                gstate.flag_fatal(format!("consumer {}: failed to journal completion: {}", id, e));
                return;
            }

            if let Err(e) = result {
                if e.is_fatal() {
                    gstate.flag_fatal(format!("consumer {}: fatal operation failure: {}", id, e));
                    return;
                }
                tracing::warn!(op = op.kind.name(), error = %e, "operation failed");
            }
        }
    }
    debug!(thread = id, "consumer finished");
}
