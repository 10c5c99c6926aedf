//! Shared test utilities for the integration suites.
//!
//! Builds a complete single-process MarFS deployment in a scratch
//! directory: small-chunk config, POSIX MDAL/DAL, and a context driving
//! the same entry points the VFS and resource manager use.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use marfs::{
    ConfigLoader, MarfsContext, PoolConfig, PosixDal, PosixMdal, RmanConfig, StreamReader,
    Thresholds,
};

/// Chunk size of the test repo; recovery consumes 4096 of it, leaving
/// 4096 user bytes per chunk.
pub const TEST_CHUNK: u64 = 8192;

/// User bytes per chunk.
pub const DPC: u64 = TEST_CHUNK - marfs::REC_UNI_SIZE as u64;

pub struct Deployment {
    pub dir: TempDir,
    pub ctx: Arc<MarfsContext>,
}

impl Deployment {
    pub fn new() -> Deployment {
        let dir = TempDir::new().unwrap();
        let doc = format!(
            r#"
version = "1.0"
mnt_top = "/campaign"

[[repo]]
name = "main"

[repo.data.protection]
n = 10
e = 2
psz = 1024

[repo.data.packing]
enabled = true
max_files = 16

[repo.data.chunking]
enabled = true
max_size = "{}"

[repo.data.distribution]
pods = {{ cnt = 2 }}
caps = {{ cnt = 2 }}
scatters = {{ cnt = 4 }}

[repo.meta.namespaces]
rbreadth = 4
rdepth = 2
rdigits = 2

[[repo.meta.namespaces.ns]]
name = "root"
perms = {{ interactive = "RM,WM,RD,WD", batch = "RM,WM,RD,WD" }}
"#,
            TEST_CHUNK
        );
        let config = Arc::new(ConfigLoader::from_str(&doc).unwrap());
        let mdal = Arc::new(PosixMdal::new(dir.path().join("mdfs")).unwrap());
        let dal = Arc::new(PosixDal::new(dir.path().join("objects")).unwrap());
        let ctx = Arc::new(MarfsContext::new(config, mdal, dal));
        ctx.mdal.ensure_namespace(ctx.ns(ctx.config.root())).unwrap();
        Deployment { dir, ctx }
    }

    pub fn logroot(&self) -> PathBuf {
        self.dir.path().join("rman-logs")
    }

    /// Baseline resource-manager configuration for this deployment.
    pub fn rman_config(&self, thresholds: Thresholds) -> RmanConfig {
        RmanConfig {
            ctx: Arc::clone(&self.ctx),
            ns_target: ".".to_string(),
            recurse: false,
            iteration: marfs::default_iteration(),
            logroot: self.logroot(),
            preserve_root: None,
            dryrun: false,
            exec_prev: None,
            quotas: false,
            thresholds,
            rebuild_loc: None,
            pool: PoolConfig { producers: 2, consumers: 2, queue_depth: 16 },
            workers: 2,
            skip_thresh: 0,
        }
    }

    /// Write one file through the engine and return its head reference
    /// path.
    pub fn write_file(&self, rel: &str, data: &[u8]) -> PathBuf {
        let ns = self.ctx.config.root();
        let mut ds = marfs::DataStream::create(&self.ctx, ns, rel, 0o644, true).unwrap();
        if !data.is_empty() {
            ds.write(data).unwrap();
        }
        let ref_path = ds.ref_path().to_path_buf();
        ds.release().unwrap();
        ref_path
    }

    /// Read a whole file back through the engine.
    pub fn read_file(&self, rel: &str) -> Vec<u8> {
        let ns = self.ctx.config.root();
        let mut reader = StreamReader::open(&self.ctx, ns, rel).unwrap();
        let mut out = vec![0u8; reader.len() as usize];
        let mut got = 0;
        while got < out.len() {
            let n = reader.read(&mut out[got..], got as u64).unwrap();
            assert!(n > 0, "unexpected EOF at {}", got);
            got += n;
        }
        reader.close().unwrap();
        out
    }
}

/// Deterministic content pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 + 17) as u8).collect()
}

/// Thresholds that collect everything deleted, immediately.
pub fn collect_now() -> Thresholds {
    Thresholds { gc: Some(i64::MAX), ..Default::default() }
}
