//! Collision remediation: a synthetic commit's oid can collide with
//! one already recorded for a *different* source changeset. Disambiguate by
//! appending a NUL byte to the object and re-hashing, repeating until the
//! oid is either free or already points back at the same source node.

use crate::error::{EngineError, Result};
use crate::ids::{GitOid, HgNodeId};
use crate::notes::NotesTree;
use crate::store_io::{ObjectReader, ObjectWriter};

/// Resolve any git2hg collision on `stored_oid`, returning the oid that is
/// safe to record for `source_node`.
pub fn resolve_collision<S: ObjectReader + ObjectWriter>(
    mut stored_oid: GitOid,
    source_node: HgNodeId,
    git2hg: &NotesTree,
    store: &mut S,
) -> Result<GitOid> {
    loop {
        let Some(existing) = git2hg.get(&stored_oid.0) else {
            return Ok(stored_oid);
        };
        if existing == source_node.as_git_oid().0 {
            return Ok(stored_oid);
        }

        let (obj_type, mut data) = store
            .read_full_text(stored_oid.0)?
            .ok_or_else(|| EngineError::ObjectNotFound {
                hex: stored_oid.to_hex(),
            })?;
        data.push(0);
        let new_oid = store.store_object(obj_type, &data, None)?;
        stored_oid = GitOid(new_oid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::NotesMode;
    use git_hash::ObjectId;
    use git_object::ObjectType;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeStore {
        objects: RefCell<HashMap<ObjectId, (ObjectType, Vec<u8>)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                objects: RefCell::new(HashMap::new()),
            }
        }

        fn insert(&self, obj_type: ObjectType, data: &[u8]) -> ObjectId {
            let oid = git_hash::hasher::Hasher::hash_object(
                git_hash::HashAlgorithm::Sha1,
                std::str::from_utf8(obj_type.as_bytes()).unwrap(),
                data,
            )
            .unwrap();
            self.objects
                .borrow_mut()
                .insert(oid, (obj_type, data.to_vec()));
            oid
        }
    }

    impl ObjectReader for FakeStore {
        fn read_full_text(&self, oid: ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>> {
            Ok(self.objects.borrow().get(&oid).cloned())
        }
    }

    impl ObjectWriter for FakeStore {
        fn store_object(
            &mut self,
            obj_type: ObjectType,
            data: &[u8],
            _base_hint: Option<(ObjectId, &[u8])>,
        ) -> Result<ObjectId> {
            Ok(self.insert(obj_type, data))
        }
    }

    fn node(byte: u8) -> HgNodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = byte;
        HgNodeId(ObjectId::from_bytes(&bytes, git_hash::HashAlgorithm::Sha1).unwrap())
    }

    #[test]
    fn no_collision_returns_same_oid() {
        let store = FakeStore::new();
        let oid = GitOid(store.insert(ObjectType::Commit, b"commit body"));
        let git2hg = NotesTree::new(NotesMode::Blob);
        let mut store = store;

        let resolved = resolve_collision(oid, node(1), &git2hg, &mut store).unwrap();
        assert_eq!(resolved, oid);
    }

    #[test]
    fn matching_existing_mapping_is_a_no_op() {
        let store = FakeStore::new();
        let oid = GitOid(store.insert(ObjectType::Commit, b"commit body"));
        let mut git2hg = NotesTree::new(NotesMode::Blob);
        git2hg.put(oid.0, node(1).as_git_oid().0);
        let mut store = store;

        let resolved = resolve_collision(oid, node(1), &git2hg, &mut store).unwrap();
        assert_eq!(resolved, oid);
    }

    #[test]
    fn colliding_mapping_appends_nul_until_free() {
        let store = FakeStore::new();
        let oid = GitOid(store.insert(ObjectType::Commit, b"commit body"));

        // Pretend oid already belongs to a different changeset.
        let mut git2hg = NotesTree::new(NotesMode::Blob);
        git2hg.put(oid.0, node(9).as_git_oid().0);

        let mut store = store;
        let resolved = resolve_collision(oid, node(1), &git2hg, &mut store).unwrap();

        assert_ne!(resolved, oid);
        let (_, stored) = store.objects.borrow().get(&resolved.0).cloned().unwrap();
        assert_eq!(stored, b"commit body\0");
    }

    #[test]
    fn dangling_stored_oid_is_an_error() {
        let mut store = FakeStore::new();
        let phantom = GitOid(ObjectId::from_hex("0000000000000000000000000000000000000002").unwrap());
        let mut git2hg = NotesTree::new(NotesMode::Blob);
        git2hg.put(phantom.0, node(9).as_git_oid().0);

        let err = resolve_collision(phantom, node(1), &git2hg, &mut store).unwrap_err();
        assert!(matches!(err, EngineError::ObjectNotFound { .. }));
    }
}
