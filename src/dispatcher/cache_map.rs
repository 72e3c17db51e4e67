//! Source file → cache file maps
//!
//! Written concurrently by every worker handler, read by the importer once
//! dispatch is over.

use super::task::FileDescriptor;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::trace;

/// Scene-graph and geometry cache files keyed by source file uid
#[derive(Debug, Default)]
pub struct CacheFileMaps {
    scene_graph_files: DashMap<u32, String>,
    geom_files: DashMap<u32, String>,
}

impl CacheFileMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the cache files produced for `file`; empty paths are skipped
    pub fn link(&self, file: &FileDescriptor, scene_graph_file: &str, geom_file: &str) {
        let uid = file.uid();
        if !scene_graph_file.is_empty() {
            self.scene_graph_files
                .insert(uid, scene_graph_file.to_string());
        }
        if !geom_file.is_empty() {
            self.geom_files.insert(uid, geom_file.to_string());
        }
        trace!(uid, file = %file, scene_graph_file, geom_file, "Linked cache files");
    }

    pub fn scene_graph_file(&self, uid: u32) -> Option<String> {
        self.scene_graph_files.get(&uid).map(|entry| entry.value().clone())
    }

    pub fn geom_file(&self, uid: u32) -> Option<String> {
        self.geom_files.get(&uid).map(|entry| entry.value().clone())
    }

    /// Copy of the scene-graph map
    pub fn file_map(&self) -> HashMap<u32, String> {
        self.scene_graph_files
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Copy of the geometry map
    pub fn geom_map(&self) -> HashMap<u32, String> {
        self.geom_files
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Number of files with a scene-graph entry
    pub fn len(&self) -> usize {
        self.scene_graph_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scene_graph_files.is_empty()
    }
}
