//! `EngineContext`: the single mutable-singleton aggregate the dispatcher
//! drives. No `Arc`/`Mutex` anywhere — there is never more than one live
//! `&mut EngineContext`, so ordinary field access is all synchronization
//! this crate needs.

use std::path::{Path, PathBuf};

use git_hash::ObjectId;
use git_object::commit::Commit;
use git_object::tree::Tree;
use git_object::{Object, ObjectType};
use git_odb::ObjectDatabase;
use git_ref::{FilesRefStore, RefName, RefStore};
use git_utils::date::{GitDate, Signature};

use crate::collision::resolve_collision;
use crate::config::{check_flags_from_env, window_size_from_env, CheckFlags};
use crate::error::{EngineError, Result};
use crate::file_reconstructor::FileReconstructor;
use crate::heads::Heads;
use crate::ids::{GitOid, HgNodeId};
use crate::manifest_reconstructor::ManifestReconstructor;
use crate::notes::{NotesMode, NotesTree};
use crate::pack_session::PackSession;
use crate::replace_map::ReplaceMap;
use crate::store_io::{ObjectReader, ObjectWriter, StructuredReader};

pub const HG2GIT_REF: &str = "refs/cinnabar/hg2git";
pub const NOTES_REF: &str = "refs/notes/cinnabar";
pub const FILES_META_REF: &str = "refs/cinnabar/files-meta";
pub const MANIFESTS_REF: &str = "refs/cinnabar/manifests";
pub const MANIFESTS_TIP_REF: &str = "refs/cinnabar/manifests-tip";

/// Fixed identity used for every synthetic commit this engine writes —
/// note the empty name, leaving the double space before the email intact.
pub fn synthetic_signature() -> Signature {
    Signature {
        name: bstr::BString::from(""),
        email: bstr::BString::from("cinnabar@git"),
        date: GitDate::new(0, 0),
    }
}

/// Process-wide mutable state, owned by `main` and threaded through
/// dispatch by unique `&mut` reference.
pub struct EngineContext {
    git_dir: PathBuf,
    odb: ObjectDatabase,
    refs: FilesRefStore,
    pack: Option<PackSession>,
    check_flags: CheckFlags,
    window_size: usize,

    pub hg2git: NotesTree,
    pub git2hg: NotesTree,
    pub files_meta: NotesTree,
    pub manifest_heads: Heads,
    pub changeset_heads: Heads,
    pub replace_map: ReplaceMap,
    pub file_reconstructor: FileReconstructor,
    pub manifest_reconstructor: ManifestReconstructor,

    /// Set by any command that has produced non-trivial state; while set,
    /// an implicit end-of-stream must not finalize.
    pub require_explicit_termination: bool,

    /// `mark -> oid` table consulted by the `commit` command's `from`/
    /// `merge` references, mirroring the donor's fast-import mark table.
    pub marks: std::collections::HashMap<String, ObjectId>,
}

impl EngineContext {
    /// Construct against a repository's `.git` directory. Reads
    /// `CINNABAR_CHECK`/`CINNABAR_PACK_WINDOW_SIZE` once.
    /// The pack itself is opened lazily on the first command that needs it.
    pub fn new(git_dir: impl AsRef<Path>) -> Result<Self> {
        let git_dir = git_dir.as_ref().to_path_buf();
        let odb = ObjectDatabase::open(git_dir.join("objects"))?;
        let mut refs = FilesRefStore::new(&git_dir);
        refs.set_committer(synthetic_signature());

        Ok(Self {
            git_dir,
            odb,
            refs,
            pack: None,
            check_flags: check_flags_from_env(),
            window_size: window_size_from_env(),
            hg2git: NotesTree::new(NotesMode::GitLink),
            git2hg: NotesTree::new(NotesMode::Blob),
            files_meta: NotesTree::new(NotesMode::Blob),
            manifest_heads: Heads::new(),
            changeset_heads: Heads::new(),
            replace_map: ReplaceMap::new(),
            file_reconstructor: FileReconstructor::new(),
            manifest_reconstructor: ManifestReconstructor::new(),
            require_explicit_termination: false,
            marks: std::collections::HashMap::new(),
        })
    }

    pub fn check_flags(&self) -> CheckFlags {
        self.check_flags
    }

    pub fn refs(&self) -> &FilesRefStore {
        &self.refs
    }

    /// Open the in-progress pack on first use. Subsequent calls reuse the
    /// same session.
    pub fn ensure_pack(&mut self) -> Result<&mut PackSession> {
        if self.pack.is_none() {
            let path = self.git_dir.join("objects/pack").join(format!(
                "cinnabar-incoming-{}.pack",
                std::process::id()
            ));
            std::fs::create_dir_all(path.parent().unwrap())?;
            self.pack = Some(PackSession::open(path, self.window_size)?);
        }
        Ok(self.pack.as_mut().unwrap())
    }

    fn pack(&self) -> Option<&PackSession> {
        self.pack.as_ref()
    }

    /// Resolve `oid` through the replace map overlay before any read that
    /// needs the "real" object — every read of the underlying store funnels
    /// through it.
    pub fn resolve(&self, oid: ObjectId) -> ObjectId {
        self.replace_map.resolve(oid)
    }

    /// Record a new changeset head. Reads the commit just stored to recover
    /// its parents for ancestor pruning.
    pub fn add_changeset_head(&mut self, git_oid: ObjectId) -> Result<()> {
        let commit = self
            .read_commit(git_oid)?
            .ok_or_else(|| EngineError::ObjectNotFound {
                hex: git_oid.to_hex(),
            })?;
        self.changeset_heads.add_head(git_oid, &commit.parents);
        Ok(())
    }

    /// Record `source_node -> stored_oid` for a changeset, running
    /// collision remediation first. Returns the oid actually recorded
    /// (possibly NUL-suffixed).
    pub fn put_changeset_mapping(
        &mut self,
        source_node: HgNodeId,
        stored_oid: GitOid,
    ) -> Result<GitOid> {
        // `git2hg` must be read while `self` is passed as the mutable store
        // resolve_collision rehashes against; borrow it out so the two
        // borrows don't overlap, then put it back before mutating either.
        let git2hg = std::mem::replace(&mut self.git2hg, NotesTree::new(NotesMode::Blob));
        let result = resolve_collision(stored_oid, source_node, &git2hg, self);
        self.git2hg = git2hg;
        let resolved = result?;
        self.hg2git.put(source_node.0, resolved.0);
        self.git2hg.put(resolved.0, source_node.as_git_oid().0);
        Ok(resolved)
    }

    /// Flush one of the notes trees (or the manifest heads) to a synthetic
    /// commit, matching `store metadata <which>`.
    pub fn flush_metadata(&mut self, which: &str) -> Result<GitOid> {
        match which {
            "hg2git" => self.flush_notes_ref(HG2GIT_REF, |ctx| &mut ctx.hg2git),
            "git2hg" => self.flush_notes_ref(NOTES_REF, |ctx| &mut ctx.git2hg),
            "files-meta" => self.flush_notes_ref(FILES_META_REF, |ctx| &mut ctx.files_meta),
            "manifests" => self.flush_manifest_heads(),
            other => Err(EngineError::UnknownCommand(format!(
                "store metadata {other}"
            ))),
        }
    }

    fn current_tip(&self, ref_name: &str) -> Result<GitOid> {
        let name = RefName::new(ref_name)?;
        Ok(self
            .refs
            .resolve_to_oid(&name)?
            .map(GitOid)
            .unwrap_or_else(GitOid::null))
    }

    fn flush_notes_ref(
        &mut self,
        ref_name: &str,
        notes: impl Fn(&mut Self) -> &mut NotesTree,
    ) -> Result<GitOid> {
        if !notes(self).is_dirty() {
            return self.current_tip(ref_name);
        }
        self.ensure_pack()?;
        // Take the tree out so flushing it (which needs `&mut self.pack`)
        // doesn't overlap with the `notes(self)` field-projection borrow.
        let mut tree = std::mem::replace(notes(self), NotesTree::new(NotesMode::GitLink));
        let tree_oid = {
            let pack = self.pack.as_mut().expect("ensure_pack just populated this");
            tree.flush(&mut NotesSink(pack))?
        };
        *notes(self) = tree;
        let parent = self.current_tip(ref_name)?;
        let mut parents = Vec::new();
        if !parent.is_null() {
            parents.push(parent.0);
        }
        let commit = Commit {
            tree: tree_oid,
            parents,
            author: synthetic_signature(),
            committer: synthetic_signature(),
            encoding: None,
            gpgsig: None,
            extra_headers: Vec::new(),
            message: bstr::BString::from("cinnabar metadata update"),
        };
        let oid = self.store_object(ObjectType::Commit, &commit.serialize_content(), None)?;
        self.refs.write_ref(&RefName::new(ref_name)?, &oid)?;
        Ok(GitOid(oid))
    }

    fn flush_manifest_heads(&mut self) -> Result<GitOid> {
        if !self.manifest_heads.is_dirty() {
            return self.current_tip(MANIFESTS_REF);
        }
        let tree_oid = crate::ids::empty_tree_oid();
        let parents: Vec<ObjectId> = self.manifest_heads.iter().copied().collect();
        let commit = Commit {
            tree: tree_oid.0,
            parents,
            author: synthetic_signature(),
            committer: synthetic_signature(),
            encoding: None,
            gpgsig: None,
            extra_headers: Vec::new(),
            message: bstr::BString::from("cinnabar manifest heads"),
        };
        let oid = self.store_object(ObjectType::Commit, &commit.serialize_content(), None)?;
        self.refs.write_ref(&RefName::new(MANIFESTS_REF)?, &oid)?;
        self.manifest_heads.clear_dirty();
        Ok(GitOid(oid))
    }

    /// `reset <ref> <hex>`: reset a named branch, clearing and reloading
    /// the corresponding notes tree if `ref` names one.
    pub fn reset_ref(&mut self, ref_name: &str, target: GitOid) -> Result<()> {
        let name = RefName::new(ref_name)?;
        if target.is_null() {
            let _ = self.refs.delete_ref(&name);
        } else {
            self.refs.write_ref(&name, &target.0)?;
        }

        if ref_name == HG2GIT_REF {
            self.reload_notes_tree(target.0, |ctx| &mut ctx.hg2git, NotesMode::GitLink)?;
        } else if ref_name == NOTES_REF {
            self.reload_notes_tree(target.0, |ctx| &mut ctx.git2hg, NotesMode::Blob)?;
        }
        Ok(())
    }

    /// `commit <ref>`: finalize a pending commit, resetting the notes tree
    /// if `ref` names one.
    pub fn finalize_commit(&mut self, ref_name: &str, commit_oid: GitOid) -> Result<()> {
        let name = RefName::new(ref_name)?;
        self.refs.write_ref(&name, &commit_oid.0)?;
        if ref_name == NOTES_REF {
            self.reload_notes_tree(commit_oid.0, |ctx| &mut ctx.git2hg, NotesMode::Blob)?;
        } else if ref_name == HG2GIT_REF {
            self.reload_notes_tree(commit_oid.0, |ctx| &mut ctx.hg2git, NotesMode::GitLink)?;
        }
        Ok(())
    }

    /// Reload one of the notes trees from `commit_oid`'s tree (every notes
    /// ref names a synthetic commit wrapping the fanout tree, per
    /// `flush_notes_ref`) — a null oid reloads to the empty map. Takes the
    /// tree out first so the `load` call's `&self` source borrow (which
    /// needs the whole context, via `ObjectSource`) doesn't overlap with
    /// the field being mutated.
    fn reload_notes_tree(
        &mut self,
        commit_oid: ObjectId,
        field: impl Fn(&mut Self) -> &mut NotesTree,
        placeholder_mode: NotesMode,
    ) -> Result<()> {
        let tree_oid = if commit_oid.is_null() {
            ObjectId::NULL_SHA1
        } else {
            self.read_commit(commit_oid)?
                .ok_or(EngineError::ObjectNotFound {
                    hex: commit_oid.to_hex(),
                })?
                .tree
        };
        let mut tree = std::mem::replace(field(self), NotesTree::new(placeholder_mode));
        let result = tree.load(tree_oid, self);
        *field(self) = tree;
        result
    }

    /// `done`: clear the termination flag and publish every dirty notes
    /// tree / heads array, finishing the in-progress pack.
    pub fn finalize(&mut self) -> Result<()> {
        self.require_explicit_termination = false;
        for which in ["hg2git", "git2hg", "files-meta", "manifests"] {
            self.flush_metadata(which)?;
        }
        if let Some(pack) = self.pack.take() {
            if pack.num_objects() > 0 {
                let mut entries: Vec<(ObjectId, u64, u32)> = pack.entries().collect();
                let (path, checksum) = pack.finish()?;
                let idx_path = path.with_extension("idx");
                git_pack::write::build_pack_index(&idx_path, &mut entries, &checksum)?;
            } else {
                pack.discard()?;
            }
        }
        Ok(())
    }

    /// `rollback`: abort without publishing anything.
    pub fn rollback(&mut self) -> Result<()> {
        self.require_explicit_termination = false;
        if let Some(pack) = self.pack.take() {
            pack.discard()?;
        }
        Ok(())
    }
}

/// Adapts `&mut PackSession` to the notes module's `ObjectSink` seam.
struct NotesSink<'a>(&'a mut PackSession);

impl crate::notes::ObjectSink for NotesSink<'_> {
    fn store_tree(&mut self, tree: &Tree) -> Result<ObjectId> {
        self.0.add_object(ObjectType::Tree, &tree.serialize_content())
    }
}

impl ObjectReader for EngineContext {
    fn read_full_text(&self, oid: ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>> {
        let oid = self.resolve(oid);
        if let Some(pack) = self.pack() {
            if let Some(obj) = pack.read_object(&oid)? {
                return Ok(Some((obj.obj_type, obj.data)));
            }
        }
        match self.odb.read(&oid)? {
            Some(obj) => Ok(Some((obj.object_type(), obj.serialize_content()))),
            None => Ok(None),
        }
    }
}

impl ObjectWriter for EngineContext {
    fn store_object(
        &mut self,
        obj_type: ObjectType,
        data: &[u8],
        base_hint: Option<(ObjectId, &[u8])>,
    ) -> Result<ObjectId> {
        self.ensure_pack()?.add_object_with_base_hint(obj_type, data, base_hint)
    }
}

impl StructuredReader for EngineContext {
    fn read_tree(&self, oid: ObjectId) -> Result<Option<Tree>> {
        let oid = self.resolve(oid);
        if let Some(pack) = self.pack() {
            if let Some(tree) = StructuredReader::read_tree(pack, oid)? {
                return Ok(Some(tree));
            }
        }
        match self.odb.read(&oid)? {
            Some(Object::Tree(tree)) => Ok(Some(tree)),
            Some(_) => Err(EngineError::TypeMismatch {
                expected: ObjectType::Tree,
                hex: oid.to_hex(),
            }),
            None => Ok(None),
        }
    }

    fn read_commit(&self, oid: ObjectId) -> Result<Option<Commit>> {
        let oid = self.resolve(oid);
        if let Some(pack) = self.pack() {
            if let Some(commit) = StructuredReader::read_commit(pack, oid)? {
                return Ok(Some(commit));
            }
        }
        match self.odb.read(&oid)? {
            Some(Object::Commit(commit)) => Ok(Some(commit)),
            Some(_) => Err(EngineError::TypeMismatch {
                expected: ObjectType::Commit,
                hex: oid.to_hex(),
            }),
            None => Ok(None),
        }
    }
}

impl crate::notes::ObjectSource for EngineContext {
    fn read_tree(&self, oid: &ObjectId) -> Result<Option<Tree>> {
        StructuredReader::read_tree(self, *oid)
    }
}
