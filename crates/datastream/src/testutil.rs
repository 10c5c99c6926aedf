//! Shared harness for engine unit tests: a small-chunk config over
//! POSIX layers in a scratch directory.

use std::sync::Arc;

use tempfile::TempDir;

use marfs_access::{PosixDal, PosixMdal};
use marfs_core::config::ConfigLoader;

use crate::MarfsContext;

/// Chunk size used by the test repo; recovery is 4096, so each chunk
/// holds 4096 user bytes.
pub const TEST_CHUNK: u64 = 8192;

pub fn test_ctx() -> (TempDir, Arc<MarfsContext>) {
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
quotas = {{ files = "4", data = "1G" }}

[[repo.meta.namespaces.ns.ns]]
name = "ro"
perms = {{ interactive = "RM,RD", batch = "RM,RD" }}
"#,
        TEST_CHUNK
    );
    let config = Arc::new(ConfigLoader::from_str(&doc).unwrap());
    let mdal = Arc::new(PosixMdal::new(dir.path().join("mdfs")).unwrap());
    let dal = Arc::new(PosixDal::new(dir.path().join("objects")).unwrap());
    let ctx = Arc::new(MarfsContext::new(config, mdal, dal));
    ctx.mdal.ensure_namespace(ctx.ns(ctx.config.root())).unwrap();
    (dir, ctx)
}

/// Deterministic pseudo-random content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// Read a whole user file back through the engine.
pub fn read_back(ctx: &Arc<MarfsContext>, rel: &str) -> Vec<u8> {
    let ns = ctx.config.root();
    let mut reader = crate::StreamReader::open(ctx, ns, rel).unwrap();
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
