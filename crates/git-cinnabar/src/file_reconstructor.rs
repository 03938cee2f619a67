//! File reconstructor: rebuild a full file text from a base text plus
//! a rev-diff, then store it and its optional metadata blob.

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::diff::{apply_parts, DiffPart};
use crate::error::{EngineError, Result};
use crate::ids::{empty_hg_file_node, GitOid, HgNodeId};
use crate::notes::NotesTree;
use crate::store_io::{ObjectReader, ObjectWriter};

/// Marker delimiting a Mercurial file-metadata header (copy source, rename
/// info) embedded at the start of the raw file text.
const META_MARKER: &[u8] = b"\x01\n";

struct LastFile {
    node: HgNodeId,
    text: Vec<u8>,
    stored_oid: GitOid,
}

#[derive(Default)]
pub struct FileReconstructor {
    last: Option<LastFile>,
}

impl FileReconstructor {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Apply one rev-chunk, storing the resulting file blob (and its
    /// metadata blob, if any) and recording `source-node -> stored-oid` in
    /// `hg2git`. Returns `None` for the empty-file sentinel, which is a
    /// no-op by contract.
    pub fn store_chunk<W: ObjectWriter + ObjectReader>(
        &mut self,
        node: HgNodeId,
        delta_base: HgNodeId,
        parts: &[DiffPart],
        hg2git: &mut NotesTree,
        files_meta: &mut NotesTree,
        store: &mut W,
    ) -> Result<Option<GitOid>> {
        if node == empty_hg_file_node() {
            return Ok(None);
        }

        let base_text = self.resolve_base(delta_base, hg2git, &*store)?;
        let full_text = apply_parts(&base_text, parts).map_err(|e| match e {
            EngineError::MalformedChunk { reason, .. } => EngineError::MalformedChunk {
                node: node.to_hex(),
                reason,
            },
            other => other,
        })?;

        let (meta, content) = split_metadata(&full_text);

        if let Some(meta_bytes) = meta {
            let meta_oid = store.store_object(ObjectType::Blob, meta_bytes, None)?;
            files_meta.put(node.0, meta_oid);
        }

        let base_hint = self
            .last
            .as_ref()
            .filter(|l| l.node == delta_base)
            .map(|l| (l.stored_oid.0, l.text.as_slice()));

        let stored_oid = GitOid(store.store_object(ObjectType::Blob, content, base_hint)?);
        hg2git.put(node.0, stored_oid.0);

        self.last = Some(LastFile {
            node,
            text: full_text,
            stored_oid,
        });

        Ok(Some(stored_oid))
    }

    fn resolve_base<R: ObjectReader>(
        &mut self,
        delta_base: HgNodeId,
        hg2git: &NotesTree,
        store: &R,
    ) -> Result<Vec<u8>> {
        if delta_base.is_null() {
            return Ok(Vec::new());
        }

        if let Some(last) = &self.last {
            if last.node == delta_base {
                return Ok(last.text.clone());
            }
        }

        self.last = None;
        let stored = hg2git.get(&delta_base.0).ok_or(EngineError::DanglingDeltaBase {
            node: delta_base.to_hex(),
        })?;
        let (_, text) = store
            .read_full_text(stored)?
            .ok_or(EngineError::DanglingDeltaBase {
                node: delta_base.to_hex(),
            })?;
        Ok(text)
    }
}

/// Split a Mercurial raw file text into `(metadata_header, content)`. The
/// header, if present, is the full `\x01\n ... \x01\n` block including both
/// markers; absent that prefix there is no metadata.
fn split_metadata(text: &[u8]) -> (Option<&[u8]>, &[u8]) {
    if !text.starts_with(META_MARKER) {
        return (None, text);
    }
    if let Some(close) = find_subslice(&text[META_MARKER.len()..], META_MARKER) {
        let header_end = META_MARKER.len() + close + META_MARKER.len();
        return (Some(&text[..header_end]), &text[header_end..]);
    }
    (None, text)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
