//! Pack writer with a sticky tail window.
//!
//! Wraps the mechanics `git_pack::write::PackWriter` would otherwise hide
//! behind a private `entries` vector: here the session needs offset lookups
//! to stay live *while the pack is still open*, so it reimplements the
//! append path directly (header, per-object zlib + CRC32, trailing
//! checksum) rather than holding a `PackWriter` as an opaque black box.
//! Everything reused — `encode_entry_header`, `flate2`, `crc32fast`, the
//! index layout — is exactly what `write.rs` does.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;
use git_pack::entry::encode_entry_header;
use git_pack::{PackError, PackedObject, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

use crate::error::{EngineError, Result};

/// Bytes of overlap preserved across a window slide.
const OVERLAP: usize = 20;

/// Default tail window size, overridable via `CINNABAR_PACK_WINDOW_SIZE`.
pub const DEFAULT_WINDOW_SIZE: usize = 1024 * 1024;

struct SessionEntry {
    offset: u64,
    crc32: u32,
}

/// The synthetic memory window shadowing the most recently written pack
/// bytes.
struct TailWindow {
    offset: u64,
    buf: Vec<u8>,
}

impl TailWindow {
    fn end(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// An open pack under construction, with sticky-window read-back for
/// objects it has written so far in this session.
pub struct PackSession {
    file: File,
    hasher: Hasher,
    position: u64,
    num_objects: u32,
    path: PathBuf,
    thin: bool,
    window_size: usize,
    tail: TailWindow,
    entries: HashMap<ObjectId, SessionEntry>,
    order: Vec<ObjectId>,
}

impl PackSession {
    pub fn open(path: impl AsRef<Path>, window_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);

        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&0u32.to_be_bytes());

        file.write_all(&header)?;
        hasher.update(&header);

        Ok(Self {
            file,
            hasher,
            position: PACK_HEADER_SIZE as u64,
            num_objects: 0,
            path,
            thin: false,
            window_size,
            tail: TailWindow {
                offset: 0,
                buf: header.to_vec(),
            },
            entries: HashMap::new(),
            order: Vec::new(),
        })
    }

    pub fn set_thin(&mut self, thin: bool) {
        self.thin = thin;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a full (non-delta) object, returning its OID.
    pub fn add_object(&mut self, obj_type: ObjectType, data: &[u8]) -> Result<ObjectId> {
        let type_num = type_number(obj_type);
        let oid = Hasher::hash_object(
            HashAlgorithm::Sha1,
            std::str::from_utf8(obj_type.as_bytes()).unwrap(),
            data,
        )
        .map_err(PackError::Hash)?;

        let offset = self.position;
        let header = encode_entry_header(type_num, data.len() as u64);
        let compressed = zlib_compress(data)?;

        let crc32 = crc32_of(&[&header, &compressed[..]]);

        let mut buf = Vec::with_capacity(header.len() + compressed.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&compressed);
        self.write_bytes(&buf)?;

        self.record_entry(oid, offset, crc32);
        Ok(oid)
    }

    /// Append a REF_DELTA entry against `base_oid`. The caller must already
    /// know `target_oid` (the hash of the reconstructed full text) — the
    /// session does not decode deltas back into full text.
    pub fn add_delta(
        &mut self,
        base_oid: ObjectId,
        target_oid: ObjectId,
        delta_data: &[u8],
    ) -> Result<()> {
        let offset = self.position;
        let header = encode_entry_header(7, delta_data.len() as u64);
        let compressed = zlib_compress(delta_data)?;

        let crc32 = crc32_of(&[&header, base_oid.as_bytes(), &compressed[..]]);

        let mut buf = Vec::with_capacity(header.len() + base_oid.as_bytes().len() + compressed.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(base_oid.as_bytes());
        buf.extend_from_slice(&compressed);
        self.write_bytes(&buf)?;

        self.record_entry(target_oid, offset, crc32);
        Ok(())
    }

    /// Store `data` as `obj_type`, delta-encoded against `base` when its
    /// text is supplied and its pack entry is still reachable via the tail
    /// window; otherwise stored in full. This is the "delta base hint"
    /// path C3/C4 use when consecutive chunks reuse the same base.
    pub fn add_object_with_base_hint(
        &mut self,
        obj_type: ObjectType,
        data: &[u8],
        base: Option<(ObjectId, &[u8])>,
    ) -> Result<ObjectId> {
        let Some((base_oid, base_text)) = base else {
            return self.add_object(obj_type, data);
        };
        if !self.is_reachable_via_tail(&base_oid) {
            return self.add_object(obj_type, data);
        }

        let target_oid = Hasher::hash_object(
            HashAlgorithm::Sha1,
            std::str::from_utf8(obj_type.as_bytes()).unwrap(),
            data,
        )
        .map_err(PackError::Hash)?;
        let delta = git_pack::delta::compute::compute_delta(base_text, data);
        self.add_delta(base_oid, target_oid, &delta)?;
        Ok(target_oid)
    }

    fn record_entry(&mut self, oid: ObjectId, offset: u64, crc32: u32) {
        self.entries.insert(oid, SessionEntry { offset, crc32 });
        self.order.push(oid);
        self.num_objects += 1;
    }

    /// The offset of `oid` within this pack, if it was written in this
    /// session. This is the "entry lookup redirection" the sticky window
    /// exists to serve: callers consult this before falling through to a
    /// generic on-disk index reader.
    pub fn offset_of(&self, oid: &ObjectId) -> Option<u64> {
        self.entries.get(oid).map(|e| e.offset)
    }

    /// Whether `oid`'s pack entry currently lies inside the tail window,
    /// i.e. can be used as a delta base without a real mapped-window read.
    pub fn is_reachable_via_tail(&self, oid: &ObjectId) -> bool {
        self.entries
            .get(oid)
            .is_some_and(|e| self.tail.contains(e.offset))
    }

    /// Forward `buf` to the pack file and hasher, then fold it into the
    /// sticky tail window, sliding when it would grow past
    /// `window_size + OVERLAP`.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        self.hasher.update(buf);
        self.position += buf.len() as u64;

        if self.tail.buf.len() + buf.len() <= self.window_size + OVERLAP {
            self.tail.buf.extend_from_slice(buf);
        } else {
            self.file.flush()?;

            let overlap: Vec<u8> = if self.tail.buf.len() >= OVERLAP {
                self.tail.buf[self.tail.buf.len() - OVERLAP..].to_vec()
            } else {
                self.tail.buf.clone()
            };
            let new_offset = self.tail.end() - overlap.len() as u64;

            let mut new_buf = Vec::with_capacity(overlap.len() + buf.len());
            new_buf.extend_from_slice(&overlap);
            new_buf.extend_from_slice(buf);

            self.tail = TailWindow {
                offset: new_offset,
                buf: new_buf,
            };
        }

        Ok(())
    }

    /// Read back a full (non-delta) object written in this session, either
    /// from the tail window or via a fresh read-only mapping of the pack
    /// bytes flushed so far.
    pub fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>> {
        let Some(entry) = self.entries.get(oid) else {
            return Ok(None);
        };

        if self.tail.contains(entry.offset) {
            let local = (entry.offset - self.tail.offset) as usize;
            return Ok(Some(decode_full_entry(&self.tail.buf[local..])?));
        }

        let mmap = unsafe { memmap2::Mmap::map(&self.file)? };
        let local = entry.offset as usize;
        Ok(Some(decode_full_entry(&mmap[local..])?))
    }

    /// Entries written so far, in insertion order, for index construction.
    pub fn entries(&self) -> impl Iterator<Item = (ObjectId, u64, u32)> + '_ {
        self.order.iter().map(move |oid| {
            let e = &self.entries[oid];
            (*oid, e.offset, e.crc32)
        })
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Write the trailing checksum and return the finished pack path plus
    /// checksum. The object count in the header is fixed up first.
    pub fn finish(mut self) -> Result<(PathBuf, ObjectId)> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;
        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&self.num_objects.to_be_bytes());
        self.file.write_all(&header)?;
        self.file.seek(std::io::SeekFrom::End(0))?;
        drop(self.file);

        let content = std::fs::read(&self.path)?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(&content);
        let checksum = hasher.finalize().map_err(PackError::Hash)?;

        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(checksum.as_bytes())?;

        Ok((self.path.clone(), checksum))
    }

    /// Abandon the pack under construction: drop the file handle and
    /// remove the partial file from disk. Used by `rollback`.
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn type_number(obj_type: ObjectType) -> u8 {
    match obj_type {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    }
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut compressed = Vec::new();
    let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(compressed)
}

fn crc32_of(parts: &[&[u8]]) -> u32 {
    let mut crc = crc32fast::Hasher::new();
    for part in parts {
        crc.update(part);
    }
    crc.finalize()
}

fn decode_full_entry(bytes: &[u8]) -> Result<PackedObject> {
    let entry = git_pack::entry::parse_entry_header(bytes, 0)?;
    let obj_type = entry.entry_type.to_object_type().ok_or_else(|| {
        EngineError::MalformedChunk {
            node: String::new(),
            reason: "expected a non-delta pack entry".into(),
        }
    })?;

    let compressed = &bytes[entry.header_size..];
    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    let mut data = Vec::with_capacity(entry.uncompressed_size);
    std::io::Read::read_to_end(&mut decoder, &mut data)?;

    Ok(PackedObject { obj_type, data })
}
