//! End-to-end datastream scenarios: write paths, parallel writers,
//! recovery-region cold parsing, and shared-handle read ordering.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{collect_now, pattern, Deployment, DPC};

use marfs::{
    load_tags, recovery, DalMode, DataStream, ObjectTarget, ObjectType, ParallelWriter,
    ReadGate, StreamReader,
};

// ----------------------------------------------------------------------------
// Scenario: Uni file, no GC
// ----------------------------------------------------------------------------

#[test]
fn uni_file_write_and_read_back() {
    let dep = Deployment::new();
    let data = pattern(1024);
    let ref_path = dep.write_file("uni", &data);

    let tags = load_tags(&dep.ctx, &ref_path).unwrap();
    let ftag = tags.ftag.unwrap();
    let post = tags.post.unwrap();
    assert!(ftag.state.finalized);
    assert_eq!(post.obj_type, ObjectType::Uni);
    assert_eq!(post.chunks, 1);
    assert!(tags.restart.is_none(), "RESTART must clear at release");

    // exactly one object backs the file
    let target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, 0).unwrap();
    assert!(dep.ctx.dal.stat(&target).is_ok());
    let second = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, 1).unwrap();
    assert!(dep.ctx.dal.stat(&second).is_err());

    // MD file size is the logical size; an over-long read returns
    // exactly the content
    assert_eq!(dep.ctx.mdal.stat(&ref_path).unwrap().size, 1024);
    let ns = dep.ctx.config.root();
    let mut reader = StreamReader::open(&dep.ctx, ns, "uni").unwrap();
    let mut buf = vec![0u8; 12345];
    let n = reader.read(&mut buf, 0).unwrap();
    assert_eq!(n, 1024);
    assert_eq!(&buf[..n], &data[..]);
}

// ----------------------------------------------------------------------------
// Scenario: Multi file
// ----------------------------------------------------------------------------

#[test]
fn multi_file_layout() {
    let dep = Deployment::new();
    // two "MiB" at test scale: two full chunks plus the remainder forced
    // by per-chunk recovery space
    let size = (2 * DPC + 1000) as usize;
    let data = pattern(size);
    let ref_path = dep.write_file("big", &data);

    let tags = load_tags(&dep.ctx, &ref_path).unwrap();
    let ftag = tags.ftag.unwrap();
    let post = tags.post.unwrap();
    assert_eq!(post.obj_type, ObjectType::Multi);

    let expected_chunks = (size as u64).div_ceil(DPC);
    assert_eq!(post.chunks, expected_chunks);
    assert_eq!(post.chunk_info_bytes, expected_chunks * marfs::CHUNK_INFO_SIZE as u64);

    // one object per chunk
    for obj in 0..expected_chunks {
        let target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, obj).unwrap();
        assert!(dep.ctx.dal.stat(&target).is_ok(), "object {} missing", obj);
    }

    // MD file truncated to the logical size on release
    assert_eq!(dep.ctx.mdal.stat(&ref_path).unwrap().size, size as u64);
    assert_eq!(dep.read_file("big"), data);
}

// ----------------------------------------------------------------------------
// Scenario: Parallel N:1
// ----------------------------------------------------------------------------

#[test]
fn parallel_nto1_out_of_order_completion() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    let data = pattern(5120);

    let mut ds = DataStream::create(&dep.ctx, ns, "p1", 0o644, true).unwrap();
    ds.extend(5120).unwrap();

    // writer B completes chunk 1 before writer A touches chunk 0
    let ctx_b = Arc::clone(&dep.ctx);
    let slice_b = data[DPC as usize..].to_vec();
    let b = thread::spawn(move || {
        let mut w = ParallelWriter::open(&ctx_b, ctx_b.config.root(), "p1", 1).unwrap();
        w.write(&slice_b).unwrap();
        w.close().unwrap();
    });
    b.join().unwrap();

    // the filled region serves; the hole before it returns an error,
    // never zeros
    let mut reader = StreamReader::open(&dep.ctx, ns, "p1").unwrap();
    let mut buf = vec![0u8; DPC as usize];
    let n = reader.read(&mut buf, DPC).unwrap();
    assert_eq!(&buf[..n], &data[DPC as usize..DPC as usize + n]);
    assert!(reader.read(&mut buf, 0).is_err());
    reader.close().unwrap();

    let ctx_a = Arc::clone(&dep.ctx);
    let slice_a = data[..DPC as usize].to_vec();
    let a = thread::spawn(move || {
        let mut w = ParallelWriter::open(&ctx_a, ctx_a.config.root(), "p1", 0).unwrap();
        w.write(&slice_a).unwrap();
        w.close().unwrap();
    });
    a.join().unwrap();

    ds.release().unwrap();

    // any completion permutation yields logical-offset order
    assert_eq!(dep.read_file("p1"), data);
}

// ----------------------------------------------------------------------------
// Scenario: recovery-tail cold parse
// ----------------------------------------------------------------------------

#[test]
fn recovery_tail_parse_from_object_alone() {
    let dep = Deployment::new();
    let data = pattern(600);
    let ref_path = dep.write_file("rec", &data);
    let tags = load_tags(&dep.ctx, &ref_path).unwrap();
    let ftag = tags.ftag.unwrap();
    let post = tags.post.unwrap();

    // read the raw object bytes back through the DAL, as a recovery tool
    // with no filesystem would
    let target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, 0).unwrap();
    let size = dep.ctx.dal.stat(&target).unwrap();
    let mut handle = dep.ctx.dal.open(&target, DalMode::Get, 0, None, None).unwrap();
    let mut object = vec![0u8; size as usize];
    let mut got = 0;
    while got < object.len() {
        let n = handle.get(&mut object[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }

    // locate the tail from the trailing bytes, then parse backwards
    let (files, region_len) =
        recovery::parse_tail(&object[object.len() - marfs::REC_TAIL_SIZE..]).unwrap();
    assert_eq!(files, 1);
    let region = &object[object.len() - region_len as usize..];
    let recovered = recovery::parse_region(region, dep.ctx.config.version).unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].ftag.stream_id, ftag.stream_id);
    assert_eq!(recovered[0].post.obj_type, post.obj_type);
    assert_eq!(recovered[0].path, "/rec");
    assert_eq!(recovered[0].head.user_bytes, 600);

    // and the user data preceding the region is intact
    assert_eq!(&object[..600], &data[..]);
}

#[test]
fn recovery_region_of_packed_object_recovers_both_files() {
    use marfs::{AttrCodec, Post, RecoveryFile, RecoveryHead};

    let dep = Deployment::new();
    let ns = dep.ctx.config.root();

    // build a two-file packed object by hand: data back to back, one
    // recovery body per file, one tail
    let file_a = pattern(300);
    let file_b = pattern(500);

    let mut ds = DataStream::create(&dep.ctx, ns, "seed", 0o644, true).unwrap();
    ds.write(b"x").unwrap();
    let mut ftag = ds.ftag().clone();
    ds.release().unwrap();
    ftag.state = marfs::StreamState::finalized();

    let vers = dep.ctx.config.version;
    let mut post_a = Post::new(vers);
    post_a.obj_type = ObjectType::Packed;
    let mut post_b = post_a.clone();
    post_b.obj_offset = file_a.len() as u64;

    let mut ftag_b = ftag.clone();
    ftag_b.file_no = 1;
    let rec_a = RecoveryFile {
        head: RecoveryHead { vers, user_bytes: 300, mode: 0o644, uid: 0, gid: 0, mtime: 1 },
        ftag: ftag.clone(),
        post: post_a,
        path: "/packed/a".to_string(),
    };
    let rec_b = RecoveryFile {
        head: RecoveryHead { vers, user_bytes: 500, mode: 0o644, uid: 0, gid: 0, mtime: 2 },
        ftag: ftag_b,
        post: post_b,
        path: "/packed/b".to_string(),
    };
    let region = recovery::encode_packed(&[rec_a.clone(), rec_b.clone()]).unwrap();

    ftag.stream_id = format!("{}.packed", ftag.stream_id);
    let target = ObjectTarget::for_ftag(&dep.ctx.config, &ftag, 0).unwrap();
    let mut handle = dep.ctx.dal.open(&target, DalMode::Put, 0, None, None).unwrap();
    for part in [&file_a[..], &file_b[..], &region[..]] {
        let mut put = 0;
        while put < part.len() {
            put += handle.put(&part[put..]).unwrap();
        }
    }
    handle.close().unwrap();

    // cold parse: last REC_TAIL_SIZE bytes give the region length
    let size = dep.ctx.dal.stat(&target).unwrap() as usize;
    let mut handle = dep.ctx.dal.open(&target, DalMode::Get, 0, None, None).unwrap();
    let mut object = vec![0u8; size];
    let mut got = 0;
    while got < size {
        got += handle.get(&mut object[got..]).unwrap();
    }

    let (files, region_len) =
        recovery::parse_tail(&object[size - marfs::REC_TAIL_SIZE..]).unwrap();
    assert_eq!(files, 2);
    let recovered =
        recovery::parse_region(&object[size - region_len as usize..], vers).unwrap();
    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0].ftag.encode(), rec_a.ftag.encode());
    assert_eq!(recovered[1].ftag.encode(), rec_b.ftag.encode());
    assert_eq!(recovered[1].post.obj_offset, 300);
}

// ----------------------------------------------------------------------------
// Shared-handle read ordering
// ----------------------------------------------------------------------------

#[test]
fn shared_readers_serialize_by_offset() {
    let dep = Deployment::new();
    let data = pattern(4000);
    dep.write_file("shared", &data);
    let ns = dep.ctx.config.root();

    let gate = Arc::new(ReadGate::new());
    let shared = Arc::new(std::sync::Mutex::new(
        StreamReader::open(&dep.ctx, ns, "shared").unwrap(),
    ));

    // an in-flight reader holds the stream at offset 0 while two more
    // arrive out of order; the gate then admits them by logical offset
    gate.wait_turn(0).unwrap();

    let mut handles = Vec::new();
    let results = Arc::new(std::sync::Mutex::new(Vec::new()));
    for offset in [2000u64, 1000] {
        let gate = Arc::clone(&gate);
        let shared = Arc::clone(&shared);
        let results = Arc::clone(&results);
        handles.push(thread::spawn(move || {
            gate.wait_turn(offset).unwrap();
            let mut buf = vec![0u8; 1000];
            let n = shared.lock().unwrap().read(&mut buf, offset).unwrap();
            results.lock().unwrap().push((offset, buf[..n].to_vec()));
            gate.complete(offset + n as u64);
        }));
        // stagger arrivals so the queue actually forms
        thread::sleep(Duration::from_millis(30));
    }

    // the first reader finishes its kilobyte and releases the queue
    let mut buf = vec![0u8; 1000];
    let n = shared.lock().unwrap().read(&mut buf, 0).unwrap();
    results.lock().unwrap().push((0, buf[..n].to_vec()));
    gate.complete(n as u64);

    for handle in handles {
        handle.join().unwrap();
    }

    let results = results.lock().unwrap();
    let order: Vec<u64> = results.iter().map(|(o, _)| *o).collect();
    assert_eq!(order, vec![0, 1000, 2000]);
    for (offset, bytes) in results.iter() {
        assert_eq!(bytes, &data[*offset as usize..*offset as usize + 1000]);
    }
}

// ----------------------------------------------------------------------------
// Trash survives until collected
// ----------------------------------------------------------------------------

#[test]
fn unlinked_file_remains_recoverable_until_gc() {
    let dep = Deployment::new();
    let ns = dep.ctx.config.root();
    let data = pattern(2000);
    let ref_path = dep.write_file("precious", &data);

    marfs::trash_unlink(&dep.ctx, ns, "precious").unwrap();
    let trash = marfs::trash_pointer(&dep.ctx, &ref_path).unwrap().unwrap();

    marfs::undelete(&dep.ctx, ns, &trash).unwrap();
    assert_eq!(dep.read_file("precious"), data);

    // a GC pass after undelete must not touch the restored file
    let outcome = marfs::run_resource_manager(dep.rman_config(collect_now())).unwrap();
    assert!(!outcome.fatal);
    assert_eq!(dep.read_file("precious"), data);
}
