//! Invalidation sink for external watchers
//!
//! File-system watchers (HEAD, refs, packed-refs, working-tree changes)
//! run outside this crate; they drive the cache through this trait before
//! or after mutating operations. Object-safe so watchers can hold a
//! `Arc<dyn CacheInvalidator>` without knowing the graph type.

use crate::graph::GraphCache;
use atlas_core::types::GraphArtifact;
use futures::future::BoxFuture;
use std::path::PathBuf;

/// Sink for externally triggered cache invalidation
pub trait CacheInvalidator: Send + Sync {
    /// Force-invalidate every cached entry
    fn invalidate_all(&self);

    /// Force-invalidate entries covering any of the given paths
    fn invalidate_files(&self, paths: &[PathBuf]);

    /// Wait until in-flight rebuilds have settled.
    ///
    /// Watchers call this around ref mutations so a rebuild started
    /// against the old tree finishes (and is invalidated) before the
    /// watcher reports completion.
    fn wait_for_rebuilds(&self) -> BoxFuture<'_, ()>;
}

impl<G: GraphArtifact> CacheInvalidator for GraphCache<G> {
    fn invalidate_all(&self) {
        GraphCache::invalidate_all(self);
    }

    fn invalidate_files(&self, paths: &[PathBuf]) {
        GraphCache::invalidate_files(self, paths);
    }

    fn wait_for_rebuilds(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.wait_for_builds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::config::{CacheConfig, HashConfig};
    use std::sync::Arc;

    struct TinyGraph;

    impl GraphArtifact for TinyGraph {
        fn node_count(&self) -> usize {
            1
        }
        fn edge_count(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_cache_is_object_safe_invalidator() {
        let cache: Arc<GraphCache<TinyGraph>> = Arc::new(GraphCache::new(
            CacheConfig::default(),
            HashConfig::default(),
        ));
        let sink: Arc<dyn CacheInvalidator> = cache;

        sink.invalidate_files(&[PathBuf::from("/p/src/main.rs")]);
        sink.invalidate_all();
        sink.wait_for_rebuilds().await;
    }
}
