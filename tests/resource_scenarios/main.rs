//! End-to-end resource-manager scenarios: GC sweeps, dry-run planning,
//! crash pickup from partial journals, `-X` execution, and the quota
//! post-pass.

#[path = "../common/mod.rs"]
mod common;

use common::{collect_now, pattern, Deployment};

use marfs::{
    load_tags, LogMode, ObjectTarget, OpKind, RmanConfig, StreamReader, Thresholds,
};
use marfs_resource::log::{self, iteration_root, outstanding, LogEntry, ResourceLog};

fn run(cfg: RmanConfig) -> marfs::RunOutcome {
    let outcome = marfs::run_resource_manager(cfg).unwrap();
    assert!(!outcome.fatal, "run reported fatal");
    outcome
}

// ----------------------------------------------------------------------------
// Scenario: unlink + GC
// ----------------------------------------------------------------------------

#[test]
fn unlink_then_gc_removes_object_and_reference() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    let ref_path = dep.write_file("uni", &pattern(1024));
    let ftag = load_tags(&dep.ctx, &ref_path).unwrap().ftag.unwrap();

    marfs::trash_unlink(&dep.ctx, ns, "uni").unwrap();

    let outcome = run(dep.rman_config(collect_now()));

    // one DEL-OBJ of length one, one DEL-REF of length one
    let report = &outcome.namespaces[0].report;
    assert_eq!(report.delobjs, 1);
    assert_eq!(report.delfiles, 1);
    assert_eq!(report.delstreams, 1);
    assert_eq!(outcome.summary.deletion_object_count, 1);
    assert_eq!(outcome.summary.deletion_reference_count, 1);
    assert_eq!(outcome.nonfatal, 0);

    // the object is gone from the DAL and the reference fails to resolve
    let target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, 0).unwrap();
    assert!(dep.ctx.dal.stat(&target).is_err());
    assert!(dep.ctx.mdal.stat(&ref_path).is_err());
    assert!(StreamReader::open(&dep.ctx, ns, "uni").is_err());
}

#[test]
fn gc_spares_live_files() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    let data = pattern(3000);
    dep.write_file("keeper", &data);
    dep.write_file("victim", &pattern(100));
    marfs::trash_unlink(&dep.ctx, ns, "victim").unwrap();

    let outcome = run(dep.rman_config(collect_now()));
    let report = &outcome.namespaces[0].report;
    assert_eq!(report.delstreams, 1);
    assert_eq!(report.fileusage, 1);
    assert_eq!(report.byteusage, 3000);

    assert_eq!(dep.read_file("keeper"), data);
}

#[test]
fn second_modify_run_is_a_noop() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    dep.write_file("once", &pattern(64));
    marfs::trash_unlink(&dep.ctx, ns, "once").unwrap();

    let first = run(dep.rman_config(collect_now()));
    assert_eq!(first.summary.deletion_reference_count, 1);

    // everything already applied: the second sweep finds nothing
    let second = run(dep.rman_config(collect_now()));
    assert_eq!(second.summary.deletion_object_count, 0);
    assert_eq!(second.summary.deletion_reference_count, 0);
    assert_eq!(second.namespaces[0].report.delstreams, 0);
}

// ----------------------------------------------------------------------------
// Scenario: dry-run plans, -X executes
// ----------------------------------------------------------------------------

#[test]
fn dry_run_plans_without_executing() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    let ref_path = dep.write_file("planned", &pattern(256));
    marfs::trash_unlink(&dep.ctx, ns, "planned").unwrap();

    let mut cfg = dep.rman_config(collect_now());
    cfg.dryrun = true;
    cfg.iteration = "plan-1".to_string();
    let outcome = run(cfg);

    // the walk classified the deletion, but nothing was executed
    assert_eq!(outcome.namespaces[0].report.delstreams, 1);
    assert_eq!(outcome.summary.deletion_object_count, 0);
    assert!(dep.ctx.mdal.stat(&ref_path).is_ok());

    // the record tree holds the full plan
    let it_root = iteration_root(&dep.logroot(), LogMode::Record, "plan-1");
    let mut planned = 0;
    for ns_dir in std::fs::read_dir(&it_root).unwrap() {
        let ns_dir = ns_dir.unwrap();
        if !ns_dir.file_type().unwrap().is_dir() {
            continue;
        }
        for log in std::fs::read_dir(ns_dir.path()).unwrap() {
            planned += outstanding(&log.unwrap().path()).unwrap().len();
        }
    }
    assert_eq!(planned, 2); // DEL-OBJ + DEL-REF
}

#[test]
fn exec_prev_runs_the_dry_run_plan() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    let ref_path = dep.write_file("deferred", &pattern(512));
    let ftag = load_tags(&dep.ctx, &ref_path).unwrap().ftag.unwrap();
    marfs::trash_unlink(&dep.ctx, ns, "deferred").unwrap();

    let mut plan = dep.rman_config(collect_now());
    plan.dryrun = true;
    plan.iteration = "plan-2".to_string();
    run(plan);

    // -X: no scanning, execute exactly the recorded plan
    let mut exec = dep.rman_config(Thresholds::default());
    exec.exec_prev = Some(iteration_root(&dep.logroot(), LogMode::Record, "plan-2"));
    exec.iteration = "plan-2".to_string();
    let outcome = run(exec);

    assert_eq!(outcome.summary.deletion_object_count, 1);
    assert_eq!(outcome.summary.deletion_reference_count, 1);
    let target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, 0).unwrap();
    assert!(dep.ctx.dal.stat(&target).is_err());
    assert!(dep.ctx.mdal.stat(&ref_path).is_err());

    // the consumed plan directory is cleaned up
    let prev_root = iteration_root(&dep.logroot(), LogMode::Record, "plan-2");
    assert!(!prev_root.join(log::SUMMARY_FILENAME).exists());
}

// ----------------------------------------------------------------------------
// Scenario: pickup of a partially executed journal
// ----------------------------------------------------------------------------

#[test]
fn pickup_executes_only_uncompleted_ops() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();

    // two deleted streams: "done" will be journaled as completed,
    // "undone" as started only
    let ref_done = dep.write_file("done", &pattern(64));
    let ref_undone = dep.write_file("undone", &pattern(64));
    let ftag_done = load_tags(&dep.ctx, &ref_done).unwrap().ftag.unwrap();
    let ftag_undone = load_tags(&dep.ctx, &ref_undone).unwrap().ftag.unwrap();
    marfs::trash_unlink(&dep.ctx, ns, "done").unwrap();
    marfs::trash_unlink(&dep.ctx, ns, "undone").unwrap();

    // hand-build a prior iteration's journal, as a crashed rank would
    // have left it
    let ns_escaped = dep.ctx.ns(ns).escaped_id();
    let old_log = log::log_path(&dep.logroot(), LogMode::Modify, "crashed", &ns_escaped, 0);
    {
        use marfs::{OpExtra, Operation};
        let op_done_obj = Operation {
            kind: OpKind::DeleteObj,
            ftag: ftag_done.clone(),
            extra: OpExtra::DeleteObj { offset: 0, count: 1 },
        };
        let op_done_ref = Operation {
            kind: OpKind::DeleteRef,
            ftag: ftag_done.clone(),
            extra: OpExtra::DeleteRef { file_nos: vec![0], del_stream: true },
        };
        let op_undone_obj = Operation {
            kind: OpKind::DeleteObj,
            ftag: ftag_undone.clone(),
            extra: OpExtra::DeleteObj { offset: 0, count: 1 },
        };
        let mut rlog = ResourceLog::open(&old_log, LogMode::Modify).unwrap();
        rlog.log_start(&[op_done_obj.clone(), op_done_ref.clone(), op_undone_obj]).unwrap();
        // "done" completed before the crash
        rlog.log_complete(&op_done_obj, true).unwrap();
        rlog.log_complete(&op_done_ref, true).unwrap();
    }
    marfs::RunArgs {
        config_version: dep.ctx.config.version,
        ns_target: ".".to_string(),
        recurse: false,
        iteration: "crashed".to_string(),
        dryrun: false,
        quotas: false,
        thresholds: collect_now(),
        rebuild_location: None,
    }
    .write_summary(&iteration_root(&dep.logroot(), LogMode::Modify, "crashed"))
    .unwrap();

    // a new run with no thresholds: it only picks up the old journal
    let outcome = run(dep.rman_config(Thresholds::default()));

    // only the uncompleted DEL-OBJ ran
    assert_eq!(outcome.summary.deletion_object_count, 1);
    assert_eq!(outcome.summary.deletion_reference_count, 0);

    // "done" was already applied pre-crash, so its object must still be
    // exactly as the crash left it (we never executed its ops here);
    // "undone"'s object is now gone
    let undone_target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag_undone, 0).unwrap();
    assert!(dep.ctx.dal.stat(&undone_target).is_err());
    let done_target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag_done, 0).unwrap();
    assert!(dep.ctx.dal.stat(&done_target).is_ok());

    // the crashed iteration's journal has been consumed
    assert!(!old_log.exists());
}

#[test]
fn modifying_run_refuses_recent_unfinished_iteration() {
    let dep = Deployment::new();

    // a prior modify-mode iteration left its summary behind: it never
    // finished, and its operations may conflict with new ones
    marfs::RunArgs {
        config_version: dep.ctx.config.version,
        ns_target: ".".to_string(),
        recurse: false,
        iteration: "stale".to_string(),
        dryrun: false,
        quotas: false,
        thresholds: collect_now(),
        rebuild_location: None,
    }
    .write_summary(&iteration_root(&dep.logroot(), LogMode::Modify, "stale"))
    .unwrap();

    // a content-modifying run hard-refuses; only the operator resolves
    let err = marfs::run_resource_manager(dep.rman_config(collect_now())).unwrap_err();
    assert!(err.is_fatal());

    // a non-modifying accounting pass is still allowed to proceed
    let outcome = marfs::run_resource_manager(dep.rman_config(Thresholds::default())).unwrap();
    assert!(!outcome.fatal);
}

// ----------------------------------------------------------------------------
// Quota post-pass
// ----------------------------------------------------------------------------

#[test]
fn quota_pass_writes_usage_totals() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    dep.write_file("a", &pattern(100));
    dep.write_file("b", &pattern(400));

    let mut cfg = dep.rman_config(Thresholds::default());
    cfg.quotas = true;
    let outcome = run(cfg);
    assert!(outcome.quota_written);

    let usage = dep.ctx.mdal.usage(dep.ctx.ns(ns)).unwrap();
    assert_eq!(usage.inodes, 2);
    assert_eq!(usage.bytes, 500);
}

#[test]
fn quota_counters_match_after_replayed_plan() {
    // a dry-run plus -X must leave the namespace in the same state a
    // one-shot modify run produces
    let twin_a = Deployment::new();
    let twin_b = Deployment::new();
    for dep in [&twin_a, &twin_b] {
        let ns = dep.ctx.config.root();
        dep.write_file("stays", &pattern(900));
        dep.write_file("goes", &pattern(64));
        marfs::trash_unlink(&dep.ctx, ns, "goes").unwrap();
    }

    // twin A: one-shot GC + quotas
    let mut one_shot = twin_a.rman_config(collect_now());
    one_shot.quotas = true;
    run(one_shot);

    // twin B: dry-run, execute the plan, then a quota pass
    let mut plan = twin_b.rman_config(collect_now());
    plan.dryrun = true;
    plan.iteration = "plan-q".to_string();
    run(plan);
    let mut exec = twin_b.rman_config(Thresholds::default());
    exec.exec_prev = Some(iteration_root(&twin_b.logroot(), LogMode::Record, "plan-q"));
    exec.iteration = "plan-q".to_string();
    run(exec);
    let mut quota = twin_b.rman_config(Thresholds::default());
    quota.quotas = true;
    run(quota);

    let usage_a = twin_a.ctx.mdal.usage(twin_a.ctx.ns(twin_a.ctx.config.root())).unwrap();
    let usage_b = twin_b.ctx.mdal.usage(twin_b.ctx.ns(twin_b.ctx.config.root())).unwrap();
    assert_eq!(usage_a, usage_b);
    assert_eq!(usage_a.inodes, 1);
    assert_eq!(usage_a.bytes, 900);
}

// ----------------------------------------------------------------------------
// Journal structure
// ----------------------------------------------------------------------------

#[test]
fn preserved_logs_pair_starts_with_completions() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    dep.write_file("audited", &pattern(64));
    marfs::trash_unlink(&dep.ctx, ns, "audited").unwrap();

    let preserve = dep.dir.path().join("preserved");
    let mut cfg = dep.rman_config(collect_now());
    cfg.preserve_root = Some(preserve.clone());
    cfg.iteration = "audit-1".to_string();
    run(cfg);

    // preserved logs show every completion preceded by its start
    let it_root = iteration_root(&preserve, LogMode::Modify, "audit-1");
    let mut checked = 0;
    for ns_dir in std::fs::read_dir(&it_root).unwrap() {
        let ns_dir = ns_dir.unwrap();
        if !ns_dir.file_type().unwrap().is_dir() {
            continue;
        }
        for log_file in std::fs::read_dir(ns_dir.path()).unwrap() {
            let entries = log::read_entries(&log_file.unwrap().path()).unwrap();
            let mut seen = Vec::new();
            for entry in entries {
                match entry {
                    LogEntry::Start(op) => seen.push(op.key()),
                    LogEntry::Complete { key, success } => {
                        assert!(seen.contains(&key), "completion without start");
                        assert!(success);
                        checked += 1;
                    }
                }
            }
        }
    }
    assert_eq!(checked, 2);
}

#[test]
fn repack_ops_are_not_generated_under_default_thresholds() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    dep.write_file("packed-ish", &pattern(128));
    marfs::trash_unlink(&dep.ctx, ns, "packed-ish").unwrap();

    let outcome = run(dep.rman_config(collect_now()));
    assert_eq!(outcome.namespaces[0].report.rpckfiles, 0);
    assert_eq!(outcome.summary.repack_count, 0);
}
