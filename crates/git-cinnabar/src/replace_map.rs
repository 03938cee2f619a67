//! Replace map: a stored-OID → stored-OID overlay consulted on lookups.
//!
//! `resolve(oid) = replace_map.get(oid).unwrap_or(oid)` — every read of the
//! underlying store is expected to funnel through this.

use std::collections::HashMap;

use git_hash::ObjectId;

#[derive(Debug, Default)]
pub struct ReplaceMap {
    overlay: HashMap<ObjectId, ObjectId>,
}

impl ReplaceMap {
    pub fn new() -> Self {
        Self {
            overlay: HashMap::new(),
        }
    }

    /// Record `old -> new`. A null `new` erases any existing entry for
    /// `old`, matching the `set replace <old> <null>` wire command.
    pub fn set(&mut self, old: ObjectId, new: ObjectId) {
        if new.is_null() {
            self.overlay.remove(&old);
        } else {
            self.overlay.insert(old, new);
        }
    }

    /// Resolve `oid` through the overlay, falling back to `oid` itself.
    pub fn resolve(&self, oid: ObjectId) -> ObjectId {
        self.overlay.get(&oid).copied().unwrap_or(oid)
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
    fn unmapped_oid_resolves_to_itself() {
        let map = ReplaceMap::new();
        assert_eq!(map.resolve(oid(1)), oid(1));
    }

    #[test]
    fn mapped_oid_resolves_to_replacement() {
        let mut map = ReplaceMap::new();
        map.set(oid(1), oid(2));
        assert_eq!(map.resolve(oid(1)), oid(2));
    }

    #[test]
    fn null_replacement_erases_entry() {
        let mut map = ReplaceMap::new();
        map.set(oid(1), oid(2));
        map.set(oid(1), ObjectId::NULL_SHA1);
        assert_eq!(map.resolve(oid(1)), oid(1));
    }
}
