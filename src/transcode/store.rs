//! Filesystem layout for produced segments.
//!
//! One directory per source, recreated empty when the supervisor is born and
//! removed when it is destroyed. Streams of different qualities share the
//! directory but write disjoint filenames.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// The directory name embeds both the source id and a hash of the source
    /// path so distinct sources can never collide.
    pub fn new(temp_root: &Path, source_id: &str, source_path: &Path) -> Self {
        let dir = temp_root.join(format!("{}-{:08x}", source_id, path_hash(source_path)));
        Self { dir }
    }

    /// Recreate the directory empty.
    pub fn create(&self) -> std::io::Result<()> {
        let _ = std::fs::remove_dir_all(&self.dir);
        std::fs::create_dir_all(&self.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The `%06d` pattern handed to the encoder as its segment filename.
    pub fn segment_pattern(&self, quality: &str, ext: &str) -> String {
        self.dir
            .join(format!("{}-%06d.{}", quality, ext))
            .to_string_lossy()
            .into_owned()
    }

    pub fn segment_path(&self, quality: &str, id: u32, ext: &str) -> PathBuf {
        self.dir.join(format!("{}-{:06}.{}", quality, id, ext))
    }

    /// Path of a produced chunk, preferring whichever extension is present.
    pub fn chunk_path(&self, quality: &str, id: u32) -> PathBuf {
        let ts = self.segment_path(quality, id, "ts");
        if ts.exists() {
            return ts;
        }
        let mp4 = self.segment_path(quality, id, "mp4");
        if mp4.exists() {
            return mp4;
        }
        ts
    }

    /// Delete a chunk's file. Absence is not an error.
    pub fn remove_chunk(&self, quality: &str, id: u32) {
        let _ = std::fs::remove_file(self.segment_path(quality, id, "ts"));
        let _ = std::fs::remove_file(self.segment_path(quality, id, "mp4"));
    }

    /// Remove the whole directory.
    pub fn destroy(&self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn path_hash(path: &Path) -> u32 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish() as u32
}
