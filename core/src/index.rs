use crate::types::{Checksum, Chunk, Object};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Stat-level record of one scanned filesystem entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: Option<DateTime<Utc>>,
    pub dev: u64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
}

/// The shape of the scanned tree, kept apart from the content maps so a
/// restore can recreate directories, symlinks and permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filesystem {
    pub directories: BTreeMap<String, FileInfo>,
    pub files: BTreeMap<String, FileInfo>,
    pub symlinks: BTreeMap<String, String>,
    pub non_regular: BTreeMap<String, FileInfo>,
    pub scanned_directories: Vec<String>,
}

/// Immutable per-snapshot index: pathnames to objects, objects to chunks,
/// plus the inverse maps used for search. Read-only once committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    pub filesystem: Filesystem,

    pub pathnames: BTreeMap<String, Checksum>,
    pub objects: BTreeMap<Checksum, Object>,
    pub chunks: BTreeMap<Checksum, Chunk>,

    pub chunk_to_objects: BTreeMap<Checksum, Vec<Checksum>>,
    pub object_to_pathnames: BTreeMap<Checksum, Vec<String>>,
    pub content_type_to_objects: BTreeMap<String, Vec<Checksum>>,
}

impl Index {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Corrupt(format!("malformed index: {}", e)))
    }

    pub fn lookup_pathname(&self, pathname: &str) -> Option<&Object> {
        self.pathnames
            .get(pathname)
            .and_then(|checksum| self.objects.get(checksum))
    }

    pub fn size(&self) -> u64 {
        self.filesystem.files.values().map(|info| info.size).sum()
    }
}

/// Mutable counterpart of [`Index`] used while a snapshot is under
/// construction. Scanner workers update it concurrently; each map carries
/// its own lock so the chunking pipeline never serializes on a global one.
/// [`IndexBuilder::freeze`] produces the immutable form.
#[derive(Default)]
pub struct IndexBuilder {
    filesystem: Mutex<Filesystem>,
    pathnames: Mutex<BTreeMap<String, Checksum>>,
    objects: Mutex<BTreeMap<Checksum, Object>>,
    chunks: Mutex<BTreeMap<Checksum, Chunk>>,
    chunk_to_objects: Mutex<BTreeMap<Checksum, Vec<Checksum>>>,
    object_to_pathnames: Mutex<BTreeMap<Checksum, Vec<String>>>,
    content_type_to_objects: Mutex<BTreeMap<String, Vec<Checksum>>>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_directory(&self, pathname: impl Into<String>, info: FileInfo) {
        self.filesystem
            .lock()
            .unwrap()
            .directories
            .insert(pathname.into(), info);
    }

    pub fn record_file(&self, pathname: impl Into<String>, info: FileInfo) {
        self.filesystem
            .lock()
            .unwrap()
            .files
            .insert(pathname.into(), info);
    }

    pub fn record_symlink(&self, pathname: impl Into<String>, target: impl Into<String>) {
        self.filesystem
            .lock()
            .unwrap()
            .symlinks
            .insert(pathname.into(), target.into());
    }

    pub fn record_non_regular(&self, pathname: impl Into<String>, info: FileInfo) {
        self.filesystem
            .lock()
            .unwrap()
            .non_regular
            .insert(pathname.into(), info);
    }

    pub fn record_scanned_directory(&self, pathname: impl Into<String>) {
        self.filesystem
            .lock()
            .unwrap()
            .scanned_directories
            .push(pathname.into());
    }

    /// Register a chunk; returns false if it was already present.
    pub fn add_chunk(&self, chunk: Chunk) -> bool {
        self.chunks
            .lock()
            .unwrap()
            .insert(chunk.checksum, chunk)
            .is_none()
    }

    pub fn get_chunk(&self, checksum: &Checksum) -> Option<Chunk> {
        self.chunks.lock().unwrap().get(checksum).copied()
    }

    /// Register an object; returns false if it was already present.
    pub fn add_object(&self, object: Object) -> bool {
        let checksum = object.checksum;
        let inserted = self
            .objects
            .lock()
            .unwrap()
            .insert(checksum, object.clone())
            .is_none();
        if inserted {
            let mut inverse = self.content_type_to_objects.lock().unwrap();
            let entries = inverse.entry(object.content_type.clone()).or_default();
            if !entries.contains(&checksum) {
                entries.push(checksum);
            }
            let mut chunk_map = self.chunk_to_objects.lock().unwrap();
            for chunk in &object.chunks {
                let objects = chunk_map.entry(*chunk).or_default();
                if !objects.contains(&checksum) {
                    objects.push(checksum);
                }
            }
        }
        inserted
    }

    pub fn set_pathname(&self, pathname: impl Into<String>, object: Checksum) {
        let pathname = pathname.into();
        self.pathnames
            .lock()
            .unwrap()
            .insert(pathname.clone(), object);
        let mut inverse = self.object_to_pathnames.lock().unwrap();
        let pathnames = inverse.entry(object).or_default();
        if !pathnames.contains(&pathname) {
            pathnames.push(pathname);
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn freeze(self) -> Index {
        Index {
            filesystem: self.filesystem.into_inner().unwrap(),
            pathnames: self.pathnames.into_inner().unwrap(),
            objects: self.objects.into_inner().unwrap(),
            chunks: self.chunks.into_inner().unwrap(),
            chunk_to_objects: self.chunk_to_objects.into_inner().unwrap(),
            object_to_pathnames: self.object_to_pathnames.into_inner().unwrap(),
            content_type_to_objects: self.content_type_to_objects.into_inner().unwrap(),
        }
    }
}
