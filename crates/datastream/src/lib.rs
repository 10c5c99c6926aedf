//! The MarFS datastream engine
//!
//! Maps user-visible file writes and reads onto object layouts (Uni,
//! Multi, Packed, N:1), framing each sealed object with recovery info and
//! journaling per-chunk records into the MD file. The trash subsystem
//! moves metadata aside on unlink/truncate so readers never observe torn
//! state.
//!
//! All I/O goes through the MDAL/DAL traits; the engine itself holds no
//! global state: every entry point takes a [`MarfsContext`].

#![warn(clippy::all)]

pub mod gate;
pub mod paths;
pub mod stream;
pub mod trash;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use marfs_core::config::{MarfsConfig, Namespace, NsId, Perms};
use marfs_core::error::{Error, Result};
use marfs_access::{Dal, Mdal};

pub use gate::ReadGate;
pub use stream::{load_tags, resolve_user_path, DataStream, LoadedTags, ParallelWriter, StreamReader};
pub use trash::{trash_pointer, trash_unlink, truncate_to_trash, undelete};

/// Explicit context threaded through every engine entry point: the
/// read-only config plus the two abstraction layers.
pub struct MarfsContext {
    /// Validated configuration
    pub config: Arc<MarfsConfig>,
    /// Metadata layer
    pub mdal: Arc<dyn Mdal>,
    /// Data layer
    pub dal: Arc<dyn Dal>,
}

impl MarfsContext {
    /// Bundle a context.
    pub fn new(config: Arc<MarfsConfig>, mdal: Arc<dyn Mdal>, dal: Arc<dyn Dal>) -> Self {
        MarfsContext { config, mdal, dal }
    }

    /// Namespace accessor shorthand.
    pub fn ns(&self, ns: NsId) -> &Namespace {
        self.config.namespace(ns)
    }

    /// Enforce the namespace permission mask for this access class.
    pub fn check_perms(&self, ns: NsId, interactive: bool, required: Perms) -> Result<()> {
        let namespace = self.ns(ns);
        let mask = if interactive { namespace.iperms } else { namespace.bperms };
        if mask.allows(required) {
            Ok(())
        } else {
            Err(Error::Permission(format!(
                "namespace {} denies the requested access",
                namespace.id_str
            )))
        }
    }
}
