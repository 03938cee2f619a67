//! Heads arrays: sorted sets of topmost stored OIDs, with ancestor pruning
//! on insertion — the set never contains an element that is an ancestor
//! of another element in the same set.

use git_hash::ObjectId;

#[derive(Debug, Default)]
pub struct Heads {
    oids: Vec<ObjectId>,
    dirty: bool,
}

impl Heads {
    pub fn new() -> Self {
        Self {
            oids: Vec::new(),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectId> {
        self.oids.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    /// Add `head` to the set, removing any of `parents` that are currently
    /// present. Idempotent: adding an already-present head with no parents
    /// to prune is a no-op.
    pub fn add_head(&mut self, head: ObjectId, parents: &[ObjectId]) {
        let before_len = self.oids.len();
        let had_head = self.oids.binary_search(&head).is_ok();

        self.oids.retain(|oid| !parents.contains(oid));

        if !had_head {
            let pos = self.oids.partition_point(|oid| *oid < head);
            self.oids.insert(pos, head);
        }

        if self.oids.len() != before_len || !had_head {
            self.dirty = true;
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[19] = byte;
        ObjectId::from_bytes(&bytes, git_hash::HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn add_head_prunes_parents() {
        let mut heads = Heads::new();
        heads.add_head(oid(1), &[]);
        heads.add_head(oid(2), &[oid(1)]);
        let remaining: Vec<_> = heads.iter().copied().collect();
        assert_eq!(remaining, vec![oid(2)]);
    }

    #[test]
    fn stays_sorted_with_no_ancestor_of_another() {
        let mut heads = Heads::new();
        heads.add_head(oid(5), &[]);
        heads.add_head(oid(1), &[]);
        heads.add_head(oid(9), &[oid(5)]);
        let remaining: Vec<_> = heads.iter().copied().collect();
        let mut sorted = remaining.clone();
        sorted.sort();
        assert_eq!(remaining, sorted);
        assert!(!remaining.contains(&oid(5)));
    }

    #[test]
    fn re_adding_existing_head_is_idempotent() {
        let mut heads = Heads::new();
        heads.add_head(oid(1), &[]);
        heads.clear_dirty();
        heads.add_head(oid(1), &[]);
        assert!(!heads.is_dirty());
        assert_eq!(heads.iter().count(), 1);
    }
}
