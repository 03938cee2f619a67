//! Command dispatcher: parses the command stream and drives the pack
//! session, notes maps, and reconstructors through their lifecycle.
//!
//! Commands are UTF-8 lines, space-separated tokens; the `data <len>`
//! sub-grammar for binary payloads and the overall read loop shape follow
//! the donor's `git-cli/src/commands/fast_import.rs`.

use std::io::{BufRead, Write};

use bstr::BString;
use git_hash::ObjectId;
use git_object::commit::Commit;
use git_object::tree::FileMode;
use git_object::ObjectType;
use git_utils::date::Signature;

use crate::context::EngineContext;
use crate::diff::DiffPart;
use crate::error::{EngineError, Result};
use crate::ids::{GitOid, HgNodeId};
use crate::store_io::{ObjectReader, ObjectWriter, StructuredReader};

/// One parsed rev-chunk: a node, its parents, a delta base, and the
/// `(start, end, data)` diff parts against that base. The header layout
/// (four 20-byte ids, then a `(start:u32, end:u32, len:u32)`-prefixed part
/// per entry) mirrors Mercurial's bdiff encoding referenced in the
/// glossary's "Rev-chunk" entry.
struct RevChunk {
    node: HgNodeId,
    parent1: HgNodeId,
    parent2: HgNodeId,
    delta_base: HgNodeId,
    parts: Vec<DiffPart>,
}

const CHUNK_HEADER_LEN: usize = 80;

fn parse_rev_chunk(bytes: &[u8]) -> Result<RevChunk> {
    if bytes.len() < CHUNK_HEADER_LEN {
        return Err(EngineError::MalformedChunk {
            node: String::new(),
            reason: format!("chunk header truncated ({} bytes)", bytes.len()),
        });
    }
    let node = HgNodeId(ObjectId::from_bytes(&bytes[0..20], git_hash::HashAlgorithm::Sha1)?);
    let parent1 = HgNodeId(ObjectId::from_bytes(&bytes[20..40], git_hash::HashAlgorithm::Sha1)?);
    let parent2 = HgNodeId(ObjectId::from_bytes(&bytes[40..60], git_hash::HashAlgorithm::Sha1)?);
    let delta_base = HgNodeId(ObjectId::from_bytes(&bytes[60..80], git_hash::HashAlgorithm::Sha1)?);

    let mut parts = Vec::new();
    let mut pos = CHUNK_HEADER_LEN;
    while pos < bytes.len() {
        if pos + 12 > bytes.len() {
            return Err(EngineError::MalformedChunk {
                node: node.to_hex(),
                reason: "truncated diff part header".into(),
            });
        }
        let start = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        let end = u32::from_be_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let len = u32::from_be_bytes(bytes[pos + 8..pos + 12].try_into().unwrap()) as usize;
        pos += 12;
        if pos + len > bytes.len() {
            return Err(EngineError::MalformedChunk {
                node: node.to_hex(),
                reason: "diff part data runs past chunk end".into(),
            });
        }
        parts.push(DiffPart {
            start,
            end,
            data: bytes[pos..pos + len].to_vec(),
        });
        pos += len;
    }

    Ok(RevChunk {
        node,
        parent1,
        parent2,
        delta_base,
        parts,
    })
}

/// Reads the command stream line by line, sub-reading raw byte payloads
/// for `data <len>` style arguments.
struct CommandReader<R> {
    inner: R,
}

impl<R: BufRead> CommandReader<R> {
    fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(&mut self.inner, &mut buf)?;
        Ok(buf)
    }

    /// `data <len>` sub-read: the length line was already consumed by the
    /// caller; read exactly `len` bytes, followed by its trailing newline.
    fn read_data_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        let data = self.read_exact_bytes(len)?;
        let mut nl = [0u8; 1];
        let _ = std::io::Read::read_exact(&mut self.inner, &mut nl);
        Ok(data)
    }
}

fn respond_oid(out: &mut impl Write, oid: ObjectId) -> Result<()> {
    writeln!(out, "{}", oid.to_hex())?;
    out.flush()?;
    Ok(())
}

fn respond_ok(out: &mut impl Write) -> Result<()> {
    writeln!(out, "ok")?;
    out.flush()?;
    Ok(())
}

fn parse_hex(s: &str) -> Result<ObjectId> {
    ObjectId::from_hex(s).map_err(|_| EngineError::InvalidHex(s.to_string()))
}

/// Run the dispatcher to completion (stdin closes, `done`, or `rollback`).
pub fn run<R: BufRead, W: Write>(ctx: &mut EngineContext, input: R, mut output: W) -> Result<()> {
    let mut reader = CommandReader::new(input);

    loop {
        let Some(line) = reader.read_line()? else {
            if ctx.require_explicit_termination {
                return Err(EngineError::UnknownCommand(
                    "end of stream while state is pending; expected `done` or `rollback`".into(),
                ));
            }
            ctx.finalize()?;
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split(' ');
        let command = tokens.next().unwrap_or("");
        let rest: Vec<&str> = tokens.collect();

        match command {
            "set" => dispatch_set(ctx, &rest)?,
            "store" => dispatch_store(ctx, &rest, &mut reader, &mut output)?,
            "reset" => dispatch_reset(ctx, &rest)?,
            "commit" => dispatch_commit(ctx, &rest, &mut reader, &mut output)?,
            "done" => {
                ctx.finalize()?;
                respond_ok(&mut output)?;
                return Ok(());
            }
            "rollback" => {
                ctx.rollback()?;
                respond_ok(&mut output)?;
                return Ok(());
            }
            other => return Err(EngineError::UnknownCommand(other.to_string())),
        }
    }
}

fn dispatch_set(ctx: &mut EngineContext, args: &[&str]) -> Result<()> {
    if args.len() != 3 {
        return Err(EngineError::WrongArity {
            command: "set",
            expected: 3,
            got: args.len(),
        });
    }
    let kind = args[0];
    let hg_hex = args[1];
    let git_hex = args[2];
    ctx.require_explicit_termination = true;

    if kind == "replace" {
        let old = parse_hex(hg_hex)?;
        let new = parse_hex(git_hex)?;
        ctx.replace_map.set(old, new);
        return Ok(());
    }

    let hg = HgNodeId::from_hex(hg_hex).map_err(|_| EngineError::InvalidHex(hg_hex.to_string()))?;
    let git = parse_hex(git_hex)?;

    match kind {
        "file" => {
            assert_type_if_present(ctx, git, ObjectType::Blob)?;
            if git.is_null() {
                ctx.hg2git.remove(&hg.0);
            } else {
                ctx.hg2git.put(hg.0, git);
            }
        }
        "manifest" => {
            assert_type_if_present(ctx, git, ObjectType::Commit)?;
            if git.is_null() {
                ctx.hg2git.remove(&hg.0);
            } else {
                ctx.hg2git.put(hg.0, git);
                let commit = ctx.read_commit(git)?.ok_or(EngineError::DanglingDeltaBase {
                    node: hg.to_hex(),
                })?;
                ctx.manifest_heads.add_head(git, &commit.parents);
            }
        }
        "changeset" => {
            assert_type_if_present(ctx, git, ObjectType::Commit)?;
            if git.is_null() {
                ctx.hg2git.remove(&hg.0);
            } else {
                let resolved = ctx.put_changeset_mapping(hg, GitOid(git))?;
                ctx.add_changeset_head(resolved.0)?;
            }
        }
        "changeset-metadata" => {
            let stored = ctx
                .hg2git
                .get(&hg.0)
                .ok_or_else(|| EngineError::UnmappedHgId(hg.to_hex()))?;
            if git.is_null() {
                ctx.git2hg.remove(&stored);
            } else {
                ctx.git2hg.put(stored, git);
            }
        }
        "changeset-head" => {
            if !git.is_null() {
                ctx.add_changeset_head(git)?;
            }
        }
        "file-meta" => {
            if git.is_null() {
                ctx.files_meta.remove(&hg.0);
            } else {
                ctx.files_meta.put(hg.0, git);
            }
        }
        other => return Err(EngineError::UnknownCommand(format!("set {other}"))),
    }
    Ok(())
}

fn assert_type_if_present(ctx: &EngineContext, oid: ObjectId, expected: ObjectType) -> Result<()> {
    if oid.is_null() {
        return Ok(());
    }
    match ctx.read_full_text(oid)? {
        Some((actual, _)) if actual == expected => Ok(()),
        Some(_) => Err(EngineError::TypeMismatch {
            expected,
            hex: oid.to_hex(),
        }),
        None => Err(EngineError::ObjectNotFound { hex: oid.to_hex() }),
    }
}

fn dispatch_store<R: BufRead, W: Write>(
    ctx: &mut EngineContext,
    args: &[&str],
    reader: &mut CommandReader<R>,
    output: &mut W,
) -> Result<()> {
    let Some(&subkind) = args.first() else {
        return Err(EngineError::WrongArity {
            command: "store",
            expected: 1,
            got: 0,
        });
    };
    ctx.require_explicit_termination = true;

    match subkind {
        "metadata" => {
            let which = args.get(1).ok_or(EngineError::WrongArity {
                command: "store metadata",
                expected: 2,
                got: args.len(),
            })?;
            let oid = ctx.flush_metadata(which)?;
            respond_oid(output, oid.0)
        }
        "file" => {
            let len: usize = args.get(2).ok_or(EngineError::WrongArity {
                command: "store file",
                expected: 3,
                got: args.len(),
            })?.parse().map_err(|_| EngineError::MalformedChunk {
                node: String::new(),
                reason: "store file: bad length".into(),
            })?;
            let bytes = reader.read_exact_bytes(len)?;
            let chunk = parse_rev_chunk(&bytes)?;
            store_file_chunk(ctx, &chunk)?;
            Ok(())
        }
        "manifest" => {
            let len: usize = args.get(2).ok_or(EngineError::WrongArity {
                command: "store manifest",
                expected: 3,
                got: args.len(),
            })?.parse().map_err(|_| EngineError::MalformedChunk {
                node: String::new(),
                reason: "store manifest: bad length".into(),
            })?;
            let bytes = reader.read_exact_bytes(len)?;
            let chunk = parse_rev_chunk(&bytes)?;
            store_manifest_chunk(ctx, &chunk)?;
            Ok(())
        }
        "changegroup" => {
            let version = args.get(1).ok_or(EngineError::WrongArity {
                command: "store changegroup",
                expected: 2,
                got: args.len(),
            })?;
            store_changegroup(ctx, version, reader)?;
            Ok(())
        }
        "blob" => {
            let len: usize = args.get(1).ok_or(EngineError::WrongArity {
                command: "store blob",
                expected: 2,
                got: args.len(),
            })?.parse().map_err(|_| EngineError::MalformedChunk {
                node: String::new(),
                reason: "store blob: bad length".into(),
            })?;
            let data = reader.read_exact_bytes(len)?;
            let oid = ctx.store_object(ObjectType::Blob, &data, None)?;
            respond_oid(output, oid)
        }
        other => Err(EngineError::UnknownCommand(format!("store {other}"))),
    }
}

fn store_file_chunk(ctx: &mut EngineContext, chunk: &RevChunk) -> Result<Option<GitOid>> {
    let mut hg2git = std::mem::replace(
        &mut ctx.hg2git,
        crate::notes::NotesTree::new(crate::notes::NotesMode::GitLink),
    );
    let mut files_meta = std::mem::replace(
        &mut ctx.files_meta,
        crate::notes::NotesTree::new(crate::notes::NotesMode::Blob),
    );
    let mut file_reconstructor = std::mem::take(&mut ctx.file_reconstructor);

    let result = file_reconstructor.store_chunk(
        chunk.node,
        chunk.delta_base,
        &chunk.parts,
        &mut hg2git,
        &mut files_meta,
        ctx,
    );

    ctx.hg2git = hg2git;
    ctx.files_meta = files_meta;
    ctx.file_reconstructor = file_reconstructor;
    result
}

fn store_manifest_chunk(ctx: &mut EngineContext, chunk: &RevChunk) -> Result<GitOid> {
    let mut hg2git = std::mem::replace(&mut ctx.hg2git, crate::notes::NotesTree::new(crate::notes::NotesMode::GitLink));
    let mut manifest_heads = std::mem::replace(&mut ctx.manifest_heads, crate::heads::Heads::new());
    let check_manifests = ctx.check_flags().contains(crate::config::CheckFlags::MANIFESTS);
    let mut manifest_reconstructor = std::mem::take(&mut ctx.manifest_reconstructor);

    let result = manifest_reconstructor.store_chunk(
        chunk.node,
        chunk.parent1,
        chunk.parent2,
        chunk.delta_base,
        &chunk.parts,
        &mut hg2git,
        &mut manifest_heads,
        check_manifests,
        ctx,
    );

    ctx.hg2git = hg2git;
    ctx.manifest_heads = manifest_heads;
    ctx.manifest_reconstructor = manifest_reconstructor;
    result
}

/// `store changegroup <1|2>`: drain changeset chunks (already handled
/// upstream, ignored here), then manifest chunks, then file sections.
/// Each section is a sequence of 4-byte-length-prefixed chunks terminated
/// by a zero-length chunk; the file section list itself is terminated by
/// a zero-length path name.
fn store_changegroup<R: BufRead>(
    ctx: &mut EngineContext,
    version: &str,
    reader: &mut CommandReader<R>,
) -> Result<()> {
    let v2 = match version {
        "1" => false,
        "2" => true,
        other => {
            return Err(EngineError::MalformedChunk {
                node: String::new(),
                reason: format!("unknown changegroup version {other}"),
            })
        }
    };

    drain_chunk_section(reader)?; // changesets: handled upstream

    let mut last_manifest_base = HgNodeId::null();
    let mut first_manifest = true;
    for_each_chunk_in_section(reader, |bytes| {
        let mut chunk = parse_rev_chunk(bytes)?;
        if !v2 {
            chunk.delta_base = if first_manifest { chunk.parent1 } else { last_manifest_base };
        }
        first_manifest = false;
        store_manifest_chunk(ctx, &chunk)?;
        last_manifest_base = chunk.node;
        Ok(())
    })?;

    loop {
        let path_len = read_u32(reader)? as usize;
        if path_len == 0 {
            break;
        }
        let _path = reader.read_exact_bytes(path_len)?;
        let mut last_file_base = HgNodeId::null();
        let mut first = true;
        for_each_chunk_in_section(reader, |bytes| {
            let mut chunk = parse_rev_chunk(bytes)?;
            if !v2 {
                chunk.delta_base = if first { chunk.parent1 } else { last_file_base };
            }
            first = false;
            store_file_chunk(ctx, &chunk)?;
            last_file_base = chunk.node;
            Ok(())
        })?;
    }

    Ok(())
}

fn read_u32<R: BufRead>(reader: &mut CommandReader<R>) -> Result<u32> {
    let bytes = reader.read_exact_bytes(4)?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

/// Reads one section: repeated `(len: u32, chunk: len bytes)` entries,
/// terminated by a zero-length chunk.
fn for_each_chunk_in_section<R: BufRead>(
    reader: &mut CommandReader<R>,
    mut f: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    loop {
        let len = read_u32(reader)? as usize;
        if len == 0 {
            return Ok(());
        }
        let bytes = reader.read_exact_bytes(len)?;
        f(&bytes)?;
    }
}

fn drain_chunk_section<R: BufRead>(reader: &mut CommandReader<R>) -> Result<()> {
    for_each_chunk_in_section(reader, |_| Ok(()))
}

fn dispatch_reset(ctx: &mut EngineContext, args: &[&str]) -> Result<()> {
    if args.len() != 2 {
        return Err(EngineError::WrongArity {
            command: "reset",
            expected: 2,
            got: args.len(),
        });
    }
    ctx.require_explicit_termination = true;
    let ref_name = args[0];
    let target = if args[1].is_empty() {
        GitOid::null()
    } else {
        GitOid(parse_hex(args[1])?)
    };
    ctx.reset_ref(ref_name, target)
}

/// `commit <ref>`: parse a pending commit description via the fast-import
/// style sub-grammar (mark/author/committer/data/from/merge/M/D), store it,
/// and finalize the ref.
fn dispatch_commit<R: BufRead, W: Write>(
    ctx: &mut EngineContext,
    args: &[&str],
    reader: &mut CommandReader<R>,
    output: &mut W,
) -> Result<()> {
    let ref_name = args.first().copied().ok_or(EngineError::WrongArity {
        command: "commit",
        expected: 1,
        got: 0,
    })?;
    ctx.require_explicit_termination = true;

    let mut mark: Option<String> = None;
    let mut author: Option<Signature> = None;
    let mut committer: Option<Signature> = None;
    let mut message = Vec::new();
    let mut from: Option<ObjectId> = None;
    let mut merges: Vec<ObjectId> = Vec::new();
    let mut entries: std::collections::BTreeMap<BString, (FileMode, ObjectId)> =
        std::collections::BTreeMap::new();

    while let Some(line) = reader.read_line()? {
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix("mark ") {
            mark = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("author ") {
            author = Some(Signature::parse(bstr::BStr::new(rest.as_bytes()))?);
        } else if let Some(rest) = line.strip_prefix("committer ") {
            committer = Some(Signature::parse(bstr::BStr::new(rest.as_bytes()))?);
        } else if let Some(rest) = line.strip_prefix("data ") {
            let len: usize = rest.trim().parse().map_err(|_| EngineError::MalformedChunk {
                node: String::new(),
                reason: "commit: bad data length".into(),
            })?;
            message = reader.read_data_payload(len)?;
        } else if let Some(rest) = line.strip_prefix("from ") {
            from = Some(resolve_mark_or_oid(ctx, rest.trim())?);
        } else if let Some(rest) = line.strip_prefix("merge ") {
            merges.push(resolve_mark_or_oid(ctx, rest.trim())?);
        } else if let Some(rest) = line.strip_prefix("M ") {
            let parts: Vec<&str> = rest.splitn(3, ' ').collect();
            if parts.len() != 3 {
                return Err(EngineError::MalformedChunk {
                    node: String::new(),
                    reason: "commit: malformed M line".into(),
                });
            }
            let mode = FileMode::from_raw(
                u32::from_str_radix(parts[0], 8).map_err(|_| EngineError::MalformedChunk {
                    node: String::new(),
                    reason: "commit: bad M mode".into(),
                })?,
            );
            let oid = resolve_mark_or_oid(ctx, parts[1])?;
            entries.insert(BString::from(parts[2]), (mode, oid));
        } else if line.starts_with("D ") {
            let path = &line[2..];
            entries.remove(&BString::from(path));
        } else {
            return Err(EngineError::UnknownCommand(format!(
                "commit sub-property: {line}"
            )));
        }
    }

    let tree_oid = if entries.is_empty() {
        crate::ids::empty_tree_oid().0
    } else {
        let items: Vec<(Vec<BString>, FileMode, ObjectId)> = entries
            .into_iter()
            .map(|(path, (mode, oid))| {
                let segments = path.split(|&b| b == b'/').map(BString::from).collect();
                (segments, mode, oid)
            })
            .collect();
        crate::manifest_reconstructor::build_subtree(&items, 0, ctx)?
    };

    let mut parents = Vec::new();
    if let Some(oid) = from {
        parents.push(oid);
    }
    parents.extend(merges);

    let committer_sig = committer.unwrap_or_else(crate::context::synthetic_signature);
    let author_sig = author.unwrap_or_else(|| committer_sig.clone());

    let commit = Commit {
        tree: tree_oid,
        parents,
        author: author_sig,
        committer: committer_sig,
        encoding: None,
        gpgsig: None,
        extra_headers: Vec::new(),
        message: BString::from(message),
    };
    let commit_oid = ctx.store_object(ObjectType::Commit, &commit.serialize_content(), None)?;

    if let Some(m) = mark {
        ctx.marks.insert(m, commit_oid);
    }

    ctx.finalize_commit(ref_name, GitOid(commit_oid))?;
    respond_oid(output, commit_oid)
}

fn resolve_mark_or_oid(ctx: &EngineContext, spec: &str) -> Result<ObjectId> {
    if let Some(mark) = spec.strip_prefix(':') {
        ctx.marks
            .get(mark)
            .copied()
            .ok_or_else(|| EngineError::UnmappedHgId(spec.to_string()))
    } else {
        parse_hex(spec)
    }
}
