//! Minimal read/write seams the reconstructors need from whatever is
//! holding the pack under construction. Kept separate from
//! [`crate::pack_session`] so the reconstructors can be unit-tested against
//! an in-memory fake instead of a real file-backed pack.

use git_hash::ObjectId;
use git_object::commit::Commit;
use git_object::tree::Tree;
use git_object::ObjectType;

use crate::error::{EngineError, Result};
use crate::notes;
use crate::pack_session::PackSession;

pub trait ObjectReader {
    /// Full (already delta-resolved) bytes of an object stored in this
    /// session, if known.
    fn read_full_text(&self, oid: ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>>;
}

pub trait ObjectWriter {
    /// Store `data` as `obj_type`, optionally delta-encoded against
    /// `base_hint` when the base is reachable without a remap.
    fn store_object(
        &mut self,
        obj_type: ObjectType,
        data: &[u8],
        base_hint: Option<(ObjectId, &[u8])>,
    ) -> Result<ObjectId>;
}

impl ObjectReader for PackSession {
    fn read_full_text(&self, oid: ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>> {
        Ok(self
            .read_object(&oid)?
            .map(|obj| (obj.obj_type, obj.data)))
    }
}

impl ObjectWriter for PackSession {
    fn store_object(
        &mut self,
        obj_type: ObjectType,
        data: &[u8],
        base_hint: Option<(ObjectId, &[u8])>,
    ) -> Result<ObjectId> {
        self.add_object_with_base_hint(obj_type, data, base_hint)
    }
}

impl notes::ObjectSink for PackSession {
    fn store_tree(&mut self, tree: &Tree) -> Result<ObjectId> {
        self.add_object(ObjectType::Tree, &tree.serialize_content())
    }
}

impl notes::ObjectSource for PackSession {
    fn read_tree(&self, oid: &ObjectId) -> Result<Option<Tree>> {
        StructuredReader::read_tree(self, *oid)
    }
}

/// Resolves already-stored tree and commit objects by oid, parsing their
/// structured form. Used by the manifest reconstructor when it needs to
/// rebuild state from a previously committed manifest rather than its own
/// in-memory cache.
pub trait StructuredReader {
    fn read_tree(&self, oid: ObjectId) -> Result<Option<Tree>>;
    fn read_commit(&self, oid: ObjectId) -> Result<Option<Commit>>;
}

impl StructuredReader for PackSession {
    fn read_tree(&self, oid: ObjectId) -> Result<Option<Tree>> {
        let Some((obj_type, data)) = self.read_object(&oid)?.map(|o| (o.obj_type, o.data)) else {
            return Ok(None);
        };
        if obj_type != ObjectType::Tree {
            return Err(EngineError::TypeMismatch {
                expected: ObjectType::Tree,
                hex: oid.to_hex(),
            });
        }
        Ok(Some(Tree::parse(&data)?))
    }

    fn read_commit(&self, oid: ObjectId) -> Result<Option<Commit>> {
        let Some((obj_type, data)) = self.read_object(&oid)?.map(|o| (o.obj_type, o.data)) else {
            return Ok(None);
        };
        if obj_type != ObjectType::Commit {
            return Err(EngineError::TypeMismatch {
                expected: ObjectType::Commit,
                hex: oid.to_hex(),
            });
        }
        Ok(Some(Commit::parse(&data)?))
    }
}
