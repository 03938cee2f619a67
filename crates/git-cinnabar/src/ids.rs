use std::fmt;

use git_hash::ObjectId;

/// An id as interpreted by the source DVCS (a Mercurial node id).
///
/// Same byte representation as [`GitOid`] — conversion between the two is
/// identity at the byte level, only the interpretation differs. Kept as
/// distinct types so a call site cannot accidentally pass one where the
/// other is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HgNodeId(pub ObjectId);

/// An id in the target content-addressed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GitOid(pub ObjectId);

impl HgNodeId {
    pub fn null() -> Self {
        Self(ObjectId::NULL_SHA1)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn from_hex(hex: &str) -> Result<Self, git_hash::HashError> {
        Ok(Self(ObjectId::from_hex(hex)?))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Reinterpret this node id's bytes as a stored-object id.
    ///
    /// Used only where the wire protocol overloads a hg node id to also name
    /// a git object id (e.g. empty-file/empty-tree sentinels share encoding).
    pub fn as_git_oid(&self) -> GitOid {
        GitOid(self.0)
    }
}

impl GitOid {
    pub fn null() -> Self {
        Self(ObjectId::NULL_SHA1)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn from_hex(hex: &str) -> Result<Self, git_hash::HashError> {
        Ok(Self(ObjectId::from_hex(hex)?))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn as_hg_node(&self) -> HgNodeId {
        HgNodeId(self.0)
    }
}

impl fmt::Display for HgNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Empty blob OID, baseline (SHA-1) hash algorithm.
pub fn empty_blob_oid() -> GitOid {
    GitOid(ObjectId::from_hex("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap())
}

/// Empty tree OID, baseline (SHA-1) hash algorithm.
pub fn empty_tree_oid() -> GitOid {
    GitOid(ObjectId::from_hex("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap())
}

/// Recompute a Mercurial node id: `sha1(min(p1,p2) || max(p1,p2) || text)`.
/// Parents are ordered by raw byte value, not by role, so swapping p1/p2
/// never changes the result; the null id sorts first since it's all zero.
pub fn hg_hash_node(p1: HgNodeId, p2: HgNodeId, text: &[u8]) -> Result<HgNodeId, git_hash::HashError> {
    let (lo, hi) = if p1.0.as_bytes() <= p2.0.as_bytes() {
        (p1, p2)
    } else {
        (p2, p1)
    };
    let mut h = git_hash::hasher::Hasher::new(git_hash::HashAlgorithm::Sha1);
    h.update(lo.0.as_bytes());
    h.update(hi.0.as_bytes());
    h.update(text);
    Ok(HgNodeId(h.finalize()?))
}

/// The distinguished source-node id for an empty file.
///
/// A Mercurial revlog entry's node id is `sha1(p1 + p2 + text)`; for an
/// empty file with both parents null, that's `sha1(40 zero bytes)`,
/// independent of any particular repository.
pub fn empty_hg_file_node() -> HgNodeId {
    HgNodeId(ObjectId::from_hex("b80de5d138758541c5f05265ad144ab9fa86d1db").unwrap())
}
