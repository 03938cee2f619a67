//! Notes map: a persistent source-node-id → stored-object-id mapping,
//! materialized as a two-level hex-prefix fanout tree (`xx/yy/rest`).
//!
//! `hg2git` stores git-link entries (the value IS an object id, referenced
//! structurally — no blob is read to resolve it). `git2hg` and `files-meta`
//! store regular-file entries whose oid is simply the already-known value
//! oid; the "blob" was written by whoever produced that value (the file
//! reconstructor's metadata blob, or a changeset-metadata blob written
//! upstream of this crate). Either way `flush` only ever has to write the
//! *directory* trees of the fanout, never note payloads themselves.

use std::collections::BTreeMap;

use bstr::BString;
use git_hash::ObjectId;
use git_object::tree::{FileMode, Tree, TreeEntry};
use git_object::ObjectType;

use crate::error::Result;

/// Whether a note's tree entry points at a structural object id (git-link)
/// or names a regular blob whose oid is already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotesMode {
    GitLink,
    Blob,
}

impl NotesMode {
    fn file_mode(self) -> FileMode {
        match self {
            NotesMode::GitLink => FileMode::Gitlink,
            NotesMode::Blob => FileMode::Regular,
        }
    }
}

/// Writes new tree objects during flush. Implemented by `PackSession`.
pub trait ObjectSink {
    fn store_tree(&mut self, tree: &Tree) -> Result<ObjectId>;
}

/// Resolves an existing tree object during `load`. Implemented by whatever
/// can see both the in-progress pack and the committed object store.
pub trait ObjectSource {
    fn read_tree(&self, oid: &ObjectId) -> Result<Option<Tree>>;
}

pub struct NotesTree {
    mode: NotesMode,
    entries: BTreeMap<ObjectId, ObjectId>,
    dirty: bool,
}

impl NotesTree {
    pub fn new(mode: NotesMode) -> Self {
        Self {
            mode,
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn get(&self, key: &ObjectId) -> Option<ObjectId> {
        self.entries.get(key).copied()
    }

    pub fn put(&mut self, key: ObjectId, value: ObjectId) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &ObjectId) {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Discard all entries and load them back from `tree_oid`'s fanout
    /// structure. Used by `reset refs/cinnabar/hg2git` (and the notes ref)
    /// to make the in-memory map reflect a specific tree rather than
    /// whatever was accumulated so far.
    pub fn load(&mut self, tree_oid: ObjectId, source: &impl ObjectSource) -> Result<()> {
        self.entries.clear();
        self.dirty = false;
        if tree_oid.is_null() {
            return Ok(());
        }
        self.load_level(tree_oid, String::new(), source)
    }

    fn load_level(
        &mut self,
        tree_oid: ObjectId,
        prefix: String,
        source: &impl ObjectSource,
    ) -> Result<()> {
        let Some(tree) = source.read_tree(&tree_oid)? else {
            return Ok(());
        };
        for entry in tree.iter() {
            let segment = entry.name.to_string();
            if entry.mode.is_tree() {
                self.load_level(entry.oid, format!("{prefix}{segment}"), source)?;
            } else {
                let hex = format!("{prefix}{segment}");
                if let Ok(key) = ObjectId::from_hex(&hex) {
                    self.entries.insert(key, entry.oid);
                }
            }
        }
        Ok(())
    }

    /// Write the fanout tree if dirty, returning its root oid (the null
    /// oid if empty, whether or not dirty — an empty map has nothing to
    /// write).
    pub fn flush(&mut self, sink: &mut impl ObjectSink) -> Result<ObjectId> {
        if self.entries.is_empty() {
            self.dirty = false;
            return Ok(ObjectId::NULL_SHA1);
        }

        // Group by first byte (xx), then second byte (yy).
        let mut by_xx: BTreeMap<String, BTreeMap<String, Vec<(String, ObjectId)>>> =
            BTreeMap::new();
        for (key, value) in &self.entries {
            let hex = key.to_hex();
            let xx = hex[0..2].to_string();
            let yy = hex[2..4].to_string();
            let rest = hex[4..].to_string();
            by_xx
                .entry(xx)
                .or_default()
                .entry(yy)
                .or_default()
                .push((rest, *value));
        }

        let mut root = Tree::new();
        for (xx, by_yy) in by_xx {
            let mut xx_tree = Tree::new();
            for (yy, leaves) in by_yy {
                let mut yy_tree = Tree::new();
                for (rest, value) in leaves {
                    yy_tree.entries.push(TreeEntry {
                        mode: self.mode.file_mode(),
                        name: BString::from(rest),
                        oid: value,
                    });
                }
                let yy_oid = sink.store_tree(&yy_tree)?;
                xx_tree.entries.push(TreeEntry {
                    mode: FileMode::Tree,
                    name: BString::from(yy),
                    oid: yy_oid,
                });
            }
            let xx_oid = sink.store_tree(&xx_tree)?;
            root.entries.push(TreeEntry {
                mode: FileMode::Tree,
                name: BString::from(xx),
                oid: xx_oid,
            });
        }

        let root_oid = sink.store_tree(&root)?;
        self.dirty = false;
        Ok(root_oid)
    }
}
