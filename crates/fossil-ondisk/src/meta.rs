//! Meta blocks: variable-length, sorted directory-entry containers.
//!
//! A meta block is the storage form of one block of a directory's meta
//! source. It holds a 12-byte header, a sorted index of `(offset, size)`
//! chunks, and a heap of packed [`DirEntry`] records. Mutations happen on an
//! owned working copy; [`MetaBlock::pack`] re-emits the header before the
//! copy is written back to the cache block.

use fossil_types::{
    BYTES_PER_ENTRY, DIR_MAGIC, FULL_PERCENTAGE, MAX_STRING_SIZE, META_HEADER_SIZE,
    META_INDEX_SIZE, META_MAGIC, MODE_DIR, ParseError, ensure_slice, put_be_u16, put_be_u32,
    put_be_u64, read_be_u16, read_be_u32, read_be_u64,
};
use serde::{Deserialize, Serialize};

// Heap record header: magic u32, size u16, nfields u8.
const DE_HEADER_SIZE: usize = 7;
// TLV field header: tag u8, length u16.
const DE_FIELD_HEADER: usize = 3;

const DF_ELEM: u8 = 1;
const DF_ENTRY: u8 = 2;
const DF_GEN: u8 = 3;
const DF_MENTRY: u8 = 4;
const DF_MGEN: u8 = 5;
const DF_QID: u8 = 6;
const DF_UID: u8 = 7;
const DF_GID: u8 = 8;
const DF_MID: u8 = 9;
const DF_MTIME: u8 = 10;
const DF_MCOUNT: u8 = 11;
const DF_CTIME: u8 = 12;
const DF_ATIME: u8 = 13;
const DF_MODE: u8 = 14;
const DF_SIZE: u8 = 15;
const DF_QIDSPACE: u8 = 16;

/// Index record: one chunk of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaEntry {
    pub offset: u16,
    pub size: u16,
}

/// Decoded qid-space annotation on a root directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QidSpace {
    pub offset: u64,
    pub max: u64,
}

/// One child of a directory, as stored in its parent's meta source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub elem: String,
    /// Slot offset of the child's data source in the parent directory.
    pub entry: u32,
    pub gen: u32,
    /// Slot offset of the child's meta source; directories only.
    pub mentry: u32,
    pub mgen: u32,
    pub qid: u64,
    pub uid: String,
    pub gid: String,
    /// User who last modified the file.
    pub mid: String,
    pub mtime: u32,
    pub mcount: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mode: u32,
    pub size: u64,
    pub qid_space: Option<QidSpace>,
}

impl DirEntry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }

    /// Exact heap size of the packed record.
    #[must_use]
    pub fn packed_size(&self) -> usize {
        let mut n = DE_HEADER_SIZE;
        // entry, gen, mtime, mcount, ctime, atime, mode
        n += 7 * (DE_FIELD_HEADER + 4);
        // qid, size
        n += 2 * (DE_FIELD_HEADER + 8);
        n += DE_FIELD_HEADER + self.elem.len();
        n += DE_FIELD_HEADER + self.uid.len();
        n += DE_FIELD_HEADER + self.gid.len();
        n += DE_FIELD_HEADER + self.mid.len();
        if self.is_dir() {
            n += 2 * (DE_FIELD_HEADER + 4); // mentry, mgen
        }
        if self.qid_space.is_some() {
            n += DE_FIELD_HEADER + 16;
        }
        n
    }

    #[must_use]
    fn nfields(&self) -> u8 {
        // elem, entry, gen, qid, uid, gid, mid, mtime, mcount, ctime, atime,
        // mode, size
        let mut n = 13_u8;
        if self.is_dir() {
            n += 2;
        }
        if self.qid_space.is_some() {
            n += 1;
        }
        n
    }

    /// Pack into `out` at `offset`; the caller has reserved
    /// [`DirEntry::packed_size`] bytes there.
    pub fn pack(&self, out: &mut [u8], offset: usize) {
        debug_assert!(self.elem.len() <= MAX_STRING_SIZE);
        let mut p = offset;
        put_be_u32(out, p, DIR_MAGIC);
        #[allow(clippy::cast_possible_truncation)] // chunk sizes fit u16
        put_be_u16(out, p + 4, self.packed_size() as u16);
        out[p + 6] = self.nfields();
        p += DE_HEADER_SIZE;

        p = put_str_field(out, p, DF_ELEM, &self.elem);
        p = put_u32_field(out, p, DF_ENTRY, self.entry);
        p = put_u32_field(out, p, DF_GEN, self.gen);
        if self.is_dir() {
            p = put_u32_field(out, p, DF_MENTRY, self.mentry);
            p = put_u32_field(out, p, DF_MGEN, self.mgen);
        }
        p = put_u64_field(out, p, DF_QID, self.qid);
        p = put_str_field(out, p, DF_UID, &self.uid);
        p = put_str_field(out, p, DF_GID, &self.gid);
        p = put_str_field(out, p, DF_MID, &self.mid);
        p = put_u32_field(out, p, DF_MTIME, self.mtime);
        p = put_u32_field(out, p, DF_MCOUNT, self.mcount);
        p = put_u32_field(out, p, DF_CTIME, self.ctime);
        p = put_u32_field(out, p, DF_ATIME, self.atime);
        p = put_u32_field(out, p, DF_MODE, self.mode);
        p = put_u64_field(out, p, DF_SIZE, self.size);
        if let Some(qs) = self.qid_space {
            out[p] = DF_QIDSPACE;
            put_be_u16(out, p + 1, 16);
            put_be_u64(out, p + 3, qs.offset);
            put_be_u64(out, p + 11, qs.max);
            p += DE_FIELD_HEADER + 16;
        }
        debug_assert_eq!(p - offset, self.packed_size());
    }

    /// Unpack a record of `size` bytes at `offset`.
    pub fn unpack(data: &[u8], offset: usize, size: usize) -> Result<Self, ParseError> {
        let rec = ensure_slice(data, offset, size)?;
        let magic = read_be_u32(rec, 0)?;
        if magic != DIR_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: DIR_MAGIC,
                actual: magic,
            });
        }
        let rec_size = read_be_u16(rec, 4)? as usize;
        if rec_size != size {
            return Err(ParseError::InvalidField {
                field: "dir_entry",
                reason: "record size disagrees with index chunk",
            });
        }
        let nfields = rec[6];

        let mut elem = None;
        let mut entry = None;
        let mut gen = None;
        let mut mentry = None;
        let mut mgen = None;
        let mut qid = None;
        let mut uid = None;
        let mut gid = None;
        let mut mid = None;
        let mut mtime = None;
        let mut mcount = None;
        let mut ctime = None;
        let mut atime = None;
        let mut mode = None;
        let mut de_size = None;
        let mut qid_space = None;

        let mut p = DE_HEADER_SIZE;
        for _ in 0..nfields {
            let head = ensure_slice(rec, p, DE_FIELD_HEADER)?;
            let tag = head[0];
            let len = read_be_u16(head, 1)? as usize;
            let payload = ensure_slice(rec, p + DE_FIELD_HEADER, len)?;
            match tag {
                DF_ELEM => elem = Some(field_string(payload)?),
                DF_ENTRY => entry = Some(field_u32(payload)?),
                DF_GEN => gen = Some(field_u32(payload)?),
                DF_MENTRY => mentry = Some(field_u32(payload)?),
                DF_MGEN => mgen = Some(field_u32(payload)?),
                DF_QID => qid = Some(field_u64(payload)?),
                DF_UID => uid = Some(field_string(payload)?),
                DF_GID => gid = Some(field_string(payload)?),
                DF_MID => mid = Some(field_string(payload)?),
                DF_MTIME => mtime = Some(field_u32(payload)?),
                DF_MCOUNT => mcount = Some(field_u32(payload)?),
                DF_CTIME => ctime = Some(field_u32(payload)?),
                DF_ATIME => atime = Some(field_u32(payload)?),
                DF_MODE => mode = Some(field_u32(payload)?),
                DF_SIZE => de_size = Some(field_u64(payload)?),
                DF_QIDSPACE => {
                    if len != 16 {
                        return Err(ParseError::InvalidField {
                            field: "qid_space",
                            reason: "expected 16 bytes",
                        });
                    }
                    qid_space = Some(QidSpace {
                        offset: read_be_u64(payload, 0)?,
                        max: read_be_u64(payload, 8)?,
                    });
                }
                // Unknown fields from newer writers are skipped.
                _ => {}
            }
            p += DE_FIELD_HEADER + len;
        }

        let missing = |field| ParseError::InvalidField {
            field,
            reason: "required field missing",
        };
        let mode = mode.ok_or(missing("mode"))?;
        let de = Self {
            elem: elem.ok_or(missing("elem"))?,
            entry: entry.ok_or(missing("entry"))?,
            gen: gen.ok_or(missing("gen"))?,
            mentry: mentry.unwrap_or(0),
            mgen: mgen.unwrap_or(0),
            qid: qid.ok_or(missing("qid"))?,
            uid: uid.ok_or(missing("uid"))?,
            gid: gid.ok_or(missing("gid"))?,
            mid: mid.ok_or(missing("mid"))?,
            mtime: mtime.ok_or(missing("mtime"))?,
            mcount: mcount.ok_or(missing("mcount"))?,
            ctime: ctime.ok_or(missing("ctime"))?,
            atime: atime.ok_or(missing("atime"))?,
            mode,
            size: de_size.ok_or(missing("size"))?,
            qid_space,
        };
        if de.is_dir() && (mentry.is_none() || mgen.is_none()) {
            return Err(missing("mentry"));
        }
        Ok(de)
    }
}

fn field_u32(payload: &[u8]) -> Result<u32, ParseError> {
    if payload.len() != 4 {
        return Err(ParseError::InvalidField {
            field: "dir_entry",
            reason: "u32 field with wrong length",
        });
    }
    read_be_u32(payload, 0)
}

fn field_u64(payload: &[u8]) -> Result<u64, ParseError> {
    if payload.len() != 8 {
        return Err(ParseError::InvalidField {
            field: "dir_entry",
            reason: "u64 field with wrong length",
        });
    }
    read_be_u64(payload, 0)
}

fn field_string(payload: &[u8]) -> Result<String, ParseError> {
    if payload.len() > MAX_STRING_SIZE {
        return Err(ParseError::InvalidField {
            field: "dir_entry",
            reason: "string field too long",
        });
    }
    std::str::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|_| ParseError::InvalidField {
            field: "dir_entry",
            reason: "string field not UTF-8",
        })
}

fn put_u32_field(out: &mut [u8], p: usize, tag: u8, value: u32) -> usize {
    out[p] = tag;
    put_be_u16(out, p + 1, 4);
    put_be_u32(out, p + 3, value);
    p + DE_FIELD_HEADER + 4
}

fn put_u64_field(out: &mut [u8], p: usize, tag: u8, value: u64) -> usize {
    out[p] = tag;
    put_be_u16(out, p + 1, 8);
    put_be_u64(out, p + 3, value);
    p + DE_FIELD_HEADER + 8
}

fn put_str_field(out: &mut [u8], p: usize, tag: u8, value: &str) -> usize {
    debug_assert!(value.len() <= MAX_STRING_SIZE);
    out[p] = tag;
    #[allow(clippy::cast_possible_truncation)] // capped at MAX_STRING_SIZE
    put_be_u16(out, p + 1, value.len() as u16);
    out[p + DE_FIELD_HEADER..p + DE_FIELD_HEADER + value.len()].copy_from_slice(value.as_bytes());
    p + DE_FIELD_HEADER + value.len()
}

// ── Meta block container ────────────────────────────────────────────────────

/// Working copy of one meta block.
#[derive(Debug, Clone)]
pub struct MetaBlock {
    buf: Vec<u8>,
    size: usize,
    free: usize,
    maxindex: usize,
    nindex: usize,
}

impl MetaBlock {
    /// Fresh, empty meta block of `bsize` bytes with `maxindex` index slots.
    #[must_use]
    pub fn init(bsize: usize, maxindex: usize) -> Self {
        let mut mb = Self {
            buf: vec![0_u8; bsize],
            size: META_HEADER_SIZE + maxindex * META_INDEX_SIZE,
            free: 0,
            maxindex,
            nindex: 0,
        };
        mb.pack();
        mb
    }

    /// Index slot count used for directory meta blocks of the given size.
    #[must_use]
    pub fn maxindex_for(bsize: usize) -> usize {
        bsize / BYTES_PER_ENTRY
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(data, 0)?;
        if magic != META_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: META_MAGIC,
                actual: magic,
            });
        }
        let size = read_be_u16(data, 4)? as usize;
        let free = read_be_u16(data, 6)? as usize;
        let maxindex = read_be_u16(data, 8)? as usize;
        let nindex = read_be_u16(data, 10)? as usize;
        let fixed = META_HEADER_SIZE + maxindex * META_INDEX_SIZE;
        if size > data.len() || size < fixed || free > size - fixed || nindex > maxindex {
            return Err(ParseError::InvalidField {
                field: "meta_block",
                reason: "header geometry out of range",
            });
        }
        Ok(Self {
            buf: data.to_vec(),
            size,
            free,
            maxindex,
            nindex,
        })
    }

    /// Rewrite the header into the working copy.
    pub fn pack(&mut self) {
        put_be_u32(&mut self.buf, 0, META_MAGIC);
        #[allow(clippy::cast_possible_truncation)] // block size <= 56 KiB
        {
            put_be_u16(&mut self.buf, 4, self.size as u16);
            put_be_u16(&mut self.buf, 6, self.free as u16);
            put_be_u16(&mut self.buf, 8, self.maxindex as u16);
            put_be_u16(&mut self.buf, 10, self.nindex as u16);
        }
    }

    /// Packed image, ready to copy into the cache block.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn nindex(&self) -> usize {
        self.nindex
    }

    #[must_use]
    pub fn maxindex(&self) -> usize {
        self.maxindex
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.free
    }

    #[must_use]
    pub fn maxsize(&self) -> usize {
        self.buf.len()
    }

    /// Allocation hint: whether a record of `n` bytes should go in this
    /// block. Blocks are kept below [`FULL_PERCENTAGE`] so that later
    /// metadata updates usually fit in place.
    #[must_use]
    pub fn has_room(&self, n: usize) -> bool {
        let budget = self.maxsize() * FULL_PERCENTAGE / 100;
        self.nindex < self.maxindex && budget + self.free >= self.size + n
    }

    #[must_use]
    pub fn index_entry(&self, i: usize) -> MetaEntry {
        debug_assert!(i < self.nindex);
        let p = META_HEADER_SIZE + i * META_INDEX_SIZE;
        MetaEntry {
            offset: read_be_u16(&self.buf, p).expect("index in bounds"),
            size: read_be_u16(&self.buf, p + 2).expect("index in bounds"),
        }
    }

    fn put_index_entry(&mut self, i: usize, me: MetaEntry) {
        let p = META_HEADER_SIZE + i * META_INDEX_SIZE;
        put_be_u16(&mut self.buf, p, me.offset);
        put_be_u16(&mut self.buf, p + 2, me.size);
    }

    /// Element name of the record at index `i`.
    pub fn elem(&self, i: usize) -> Result<String, ParseError> {
        let me = self.index_entry(i);
        let de = self.dir_entry(&me)?;
        Ok(de.elem)
    }

    pub fn dir_entry(&self, me: &MetaEntry) -> Result<DirEntry, ParseError> {
        DirEntry::unpack(&self.buf, me.offset as usize, me.size as usize)
    }

    /// Binary search by element name.
    ///
    /// Returns the matching index and chunk, or the insertion index for a
    /// missing name. Decode errors surface so fsck can report them.
    pub fn search(&self, elem: &str) -> Result<std::result::Result<(usize, MetaEntry), usize>, ParseError> {
        let mut lo = 0_usize;
        let mut hi = self.nindex;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let me = self.index_entry(mid);
            let name = self.dir_entry(&me)?.elem;
            match name.as_str().cmp(elem) {
                std::cmp::Ordering::Equal => return Ok(Ok((mid, me))),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(Err(lo))
    }

    /// Reserve `n` heap bytes, compacting if fragmentation requires it.
    pub fn alloc(&mut self, n: usize) -> Option<u16> {
        if self.maxsize() - self.size >= n {
            let o = self.size;
            self.size += n;
            #[allow(clippy::cast_possible_truncation)] // block size <= 56 KiB
            return Some(o as u16);
        }
        if self.maxsize() - self.size + self.free < n {
            return None;
        }
        self.compact();
        debug_assert!(self.maxsize() - self.size >= n);
        let o = self.size;
        self.size += n;
        #[allow(clippy::cast_possible_truncation)]
        Some(o as u16)
    }

    /// Slide all live chunks down over the free space.
    fn compact(&mut self) {
        let mut chunks: Vec<(usize, MetaEntry)> =
            (0..self.nindex).map(|i| (i, self.index_entry(i))).collect();
        chunks.sort_by_key(|(_, me)| me.offset);

        let mut o = META_HEADER_SIZE + self.maxindex * META_INDEX_SIZE;
        for (i, me) in chunks {
            let from = me.offset as usize;
            let len = me.size as usize;
            if from != o {
                self.buf.copy_within(from..from + len, o);
                #[allow(clippy::cast_possible_truncation)]
                self.put_index_entry(
                    i,
                    MetaEntry {
                        offset: o as u16,
                        size: me.size,
                    },
                );
            }
            o += len;
        }
        self.buf[o..self.size].fill(0);
        self.size = o;
        self.free = 0;
    }

    /// Add an index entry at `i` for an already-reserved chunk.
    pub fn insert(&mut self, i: usize, me: MetaEntry) {
        debug_assert!(self.nindex < self.maxindex);
        debug_assert!(i <= self.nindex);
        let base = META_HEADER_SIZE;
        let from = base + i * META_INDEX_SIZE;
        let to = base + self.nindex * META_INDEX_SIZE;
        self.buf.copy_within(from..to, from + META_INDEX_SIZE);
        self.put_index_entry(i, me);
        self.nindex += 1;
    }

    /// Remove the index entry at `i` and release its chunk.
    pub fn delete(&mut self, i: usize) {
        let me = self.index_entry(i);
        let off = me.offset as usize;
        let len = me.size as usize;
        self.buf[off..off + len].fill(0);
        if off + len == self.size {
            self.size -= len;
        } else {
            self.free += len;
        }
        self.remove_index(i);
    }

    fn remove_index(&mut self, i: usize) {
        debug_assert!(i < self.nindex);
        let base = META_HEADER_SIZE;
        let from = base + (i + 1) * META_INDEX_SIZE;
        let to = base + self.nindex * META_INDEX_SIZE;
        self.buf.copy_within(from..to, from - META_INDEX_SIZE);
        let last = base + (self.nindex - 1) * META_INDEX_SIZE;
        self.buf[last..last + META_INDEX_SIZE].fill(0);
        self.nindex -= 1;
    }

    /// Resize the chunk at index `i` in place.
    ///
    /// Shrinks always succeed; growth succeeds only when the chunk is the
    /// last one in the heap and tail space allows. Anything else means the
    /// record moves to another block.
    pub fn resize(&mut self, i: usize, n: usize) -> bool {
        let me = self.index_entry(i);
        let old = me.size as usize;
        if n <= old {
            let off = me.offset as usize;
            self.buf[off + n..off + old].fill(0);
            if off + old == self.size {
                self.size -= old - n;
            } else {
                self.free += old - n;
            }
        } else {
            let grow = n - old;
            if me.offset as usize + old != self.size || self.maxsize() - self.size < grow {
                return false;
            }
            self.size += grow;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.put_index_entry(
            i,
            MetaEntry {
                offset: me.offset,
                size: n as u16,
            },
        );
        true
    }

    /// Pack a directory entry into its reserved chunk.
    pub fn pack_dir_entry(&mut self, de: &DirEntry, me: MetaEntry) {
        debug_assert_eq!(de.packed_size(), me.size as usize);
        de.pack(&mut self.buf, me.offset as usize);
    }

    /// Rewrite the record at index `i` with new contents, repositioning it in
    /// the sort order if the name changed. Returns false when the new record
    /// no longer fits in this block.
    pub fn update(&mut self, i: usize, de: &DirEntry) -> Result<bool, ParseError> {
        let n = de.packed_size();
        if !self.resize(i, n) {
            return Ok(false);
        }
        let me = self.index_entry(i);
        self.remove_index(i);
        let j = match self.search(&de.elem)? {
            Ok((j, _)) => j,
            Err(j) => j,
        };
        self.pack_dir_entry(de, me);
        self.insert(j, me);
        self.pack();
        Ok(true)
    }

    /// Structural invariants, verified after every mutation and by fsck:
    /// chunks sit above the index, are mutually disjoint, stay inside the
    /// used extent, account exactly for `size - free`, and the index is
    /// sorted by element name.
    pub fn check(&self) -> Result<(), ParseError> {
        let bad = |reason| ParseError::InvalidField {
            field: "meta_block",
            reason,
        };
        let mut chunks: Vec<MetaEntry> = (0..self.nindex).map(|i| self.index_entry(i)).collect();
        chunks.sort_by_key(|me| me.offset);

        let fixed = META_HEADER_SIZE + self.maxindex * META_INDEX_SIZE;
        let mut oo = fixed;
        let mut end = fixed;
        for me in &chunks {
            let o = me.offset as usize;
            let n = me.size as usize;
            if o < oo {
                return Err(bad("chunks overlap or intrude on the index"));
            }
            oo = o + n;
            end = oo;
        }
        if end > self.size || self.size - fixed != self.free + chunks.iter().map(|me| me.size as usize).sum::<usize>() {
            return Err(bad("size, free, and chunk accounting disagree"));
        }

        let mut last: Option<String> = None;
        for i in 0..self.nindex {
            let elem = self.elem(i)?;
            if let Some(prev) = &last {
                if *prev >= elem {
                    return Err(bad("index not sorted by element"));
                }
            }
            last = Some(elem);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn de(elem: &str) -> DirEntry {
        DirEntry {
            elem: elem.to_owned(),
            entry: 4,
            gen: 1,
            mentry: 0,
            mgen: 0,
            qid: 77,
            uid: "adm".to_owned(),
            gid: "adm".to_owned(),
            mid: "adm".to_owned(),
            mtime: 1000,
            mcount: 2,
            ctime: 999,
            atime: 1001,
            mode: 0o644,
            size: 4096,
            qid_space: None,
        }
    }

    fn dir_de(elem: &str) -> DirEntry {
        let mut d = de(elem);
        d.mode |= MODE_DIR;
        d.mentry = 5;
        d.mgen = 9;
        d
    }

    fn insert_entry(mb: &mut MetaBlock, d: &DirEntry) {
        let n = d.packed_size();
        let o = mb.alloc(n).expect("room");
        #[allow(clippy::cast_possible_truncation)]
        let me = MetaEntry {
            offset: o,
            size: n as u16,
        };
        let i = match mb.search(&d.elem).unwrap() {
            Ok((i, _)) => i,
            Err(i) => i,
        };
        mb.pack_dir_entry(d, me);
        mb.insert(i, me);
        mb.pack();
    }

    #[test]
    fn dir_entry_round_trip() {
        let d = de("hello");
        let mut buf = vec![0_u8; d.packed_size()];
        d.pack(&mut buf, 0);
        assert_eq!(DirEntry::unpack(&buf, 0, buf.len()).unwrap(), d);
    }

    #[test]
    fn dir_entry_round_trip_directory() {
        let d = dir_de("sub");
        let mut buf = vec![0_u8; d.packed_size()];
        d.pack(&mut buf, 0);
        let back = DirEntry::unpack(&buf, 0, buf.len()).unwrap();
        assert_eq!(back.mentry, 5);
        assert_eq!(back.mgen, 9);
        assert_eq!(back, d);
    }

    #[test]
    fn dir_entry_round_trip_qid_space() {
        let mut d = dir_de("root");
        d.qid_space = Some(QidSpace {
            offset: 0x10,
            max: 0xffff,
        });
        let mut buf = vec![0_u8; d.packed_size()];
        d.pack(&mut buf, 0);
        assert_eq!(DirEntry::unpack(&buf, 0, buf.len()).unwrap(), d);
    }

    #[test]
    fn dir_entry_rejects_bad_magic() {
        let d = de("x");
        let mut buf = vec![0_u8; d.packed_size()];
        d.pack(&mut buf, 0);
        buf[0] ^= 1;
        assert!(DirEntry::unpack(&buf, 0, buf.len()).is_err());
    }

    #[test]
    fn dir_entry_size_mismatch() {
        let d = de("x");
        let mut buf = vec![0_u8; d.packed_size() + 4];
        d.pack(&mut buf, 0);
        assert!(DirEntry::unpack(&buf, 0, buf.len()).is_err());
    }

    #[test]
    fn meta_block_init_geometry() {
        let mb = MetaBlock::init(8192, MetaBlock::maxindex_for(8192));
        assert_eq!(mb.maxindex(), 81);
        assert_eq!(mb.nindex(), 0);
        assert_eq!(mb.size(), META_HEADER_SIZE + 81 * META_INDEX_SIZE);
        assert_eq!(mb.free(), 0);
        mb.check().unwrap();
    }

    #[test]
    fn meta_block_pack_unpack() {
        let mut mb = MetaBlock::init(1024, 10);
        insert_entry(&mut mb, &de("alpha"));
        insert_entry(&mut mb, &de("beta"));
        let back = MetaBlock::unpack(mb.bytes()).unwrap();
        assert_eq!(back.nindex(), 2);
        assert_eq!(back.size(), mb.size());
        assert_eq!(back.free(), mb.free());
        back.check().unwrap();
    }

    #[test]
    fn meta_block_sorted_insert_and_search() {
        let mut mb = MetaBlock::init(2048, 20);
        for name in ["delta", "alpha", "charlie", "bravo"] {
            insert_entry(&mut mb, &de(name));
        }
        mb.check().unwrap();
        let names: Vec<String> = (0..mb.nindex()).map(|i| mb.elem(i).unwrap()).collect();
        assert_eq!(names, ["alpha", "bravo", "charlie", "delta"]);

        let (i, me) = mb.search("charlie").unwrap().unwrap();
        assert_eq!(i, 2);
        assert_eq!(mb.dir_entry(&me).unwrap().elem, "charlie");
        assert_eq!(mb.search("zed").unwrap(), Err(4));
        assert_eq!(mb.search("aaa").unwrap(), Err(0));
    }

    #[test]
    fn meta_block_delete_frees_and_reuses() {
        let mut mb = MetaBlock::init(1024, 8);
        insert_entry(&mut mb, &de("one"));
        insert_entry(&mut mb, &de("two"));
        insert_entry(&mut mb, &de("under"));
        let before = mb.size();

        let (i, me) = mb.search("one").unwrap().unwrap();
        let freed = me.size as usize;
        mb.delete(i);
        mb.pack();
        mb.check().unwrap();
        assert_eq!(mb.free(), freed);
        assert!(mb.search("one").unwrap().is_err());
        assert_eq!(mb.size(), before);
    }

    #[test]
    fn meta_block_alloc_exhaustion() {
        let mut mb = MetaBlock::init(256, 4);
        let avail = mb.maxsize() - mb.size();
        assert!(mb.alloc(avail + 1).is_none());
        assert!(mb.alloc(avail).is_some());
        assert!(mb.alloc(1).is_none());
    }

    #[test]
    fn meta_block_compaction_via_alloc() {
        let mut mb = MetaBlock::init(512, 8);
        insert_entry(&mut mb, &de("aa"));
        insert_entry(&mut mb, &de("bb"));
        insert_entry(&mut mb, &de("cc"));
        // free the middle chunk, then allocate something larger than the
        // tail space alone
        let (i, _) = mb.search("bb").unwrap().unwrap();
        mb.delete(i);
        let tail = mb.maxsize() - mb.size();
        let want = tail + 1;
        assert!(mb.free() >= 1);
        let o = mb.alloc(want).expect("compacted alloc");
        assert!((o as usize) >= META_HEADER_SIZE + mb.maxindex() * META_INDEX_SIZE);
        mb.pack();
    }

    #[test]
    fn meta_block_resize_shrink_and_tail_grow() {
        let mut mb = MetaBlock::init(1024, 8);
        insert_entry(&mut mb, &de("solo"));
        let (i, me) = mb.search("solo").unwrap().unwrap();

        assert!(mb.resize(i, me.size as usize - 4));
        mb.pack();
        // record bytes are now inconsistent with the index; only geometry is
        // being exercised here
        let me2 = mb.index_entry(i);
        assert_eq!(me2.size, me.size - 4);

        assert!(mb.resize(i, me.size as usize + 16));
        assert_eq!(mb.index_entry(i).size, me.size + 16);
    }

    #[test]
    fn meta_block_resize_refuses_interior_growth() {
        let mut mb = MetaBlock::init(1024, 8);
        insert_entry(&mut mb, &de("first"));
        insert_entry(&mut mb, &de("second"));
        let (i, me) = mb.search("first").unwrap().unwrap();
        // "first" was allocated before "second", so it is interior
        assert!(!mb.resize(i, me.size as usize + 8));
    }

    #[test]
    fn meta_block_update_renames_in_order() {
        let mut mb = MetaBlock::init(2048, 16);
        insert_entry(&mut mb, &de("aaa"));
        insert_entry(&mut mb, &de("mmm"));
        insert_entry(&mut mb, &de("zzz"));

        let (i, _) = mb.search("zzz").unwrap().unwrap();
        let mut renamed = de("bbb");
        renamed.size = 123;
        assert!(mb.update(i, &renamed).unwrap());
        mb.check().unwrap();

        let names: Vec<String> = (0..mb.nindex()).map(|j| mb.elem(j).unwrap()).collect();
        assert_eq!(names, ["aaa", "bbb", "mmm"]);
        let (_, me) = mb.search("bbb").unwrap().unwrap();
        assert_eq!(mb.dir_entry(&me).unwrap().size, 123);
    }

    #[test]
    fn meta_block_has_room_tracks_full_percentage() {
        let mut mb = MetaBlock::init(512, 4);
        assert!(mb.has_room(64));
        // fill to above 80%
        let budget = mb.maxsize() * FULL_PERCENTAGE / 100;
        while mb.size() + 64 <= budget {
            assert!(mb.alloc(64).is_some());
        }
        assert!(!mb.has_room(512));
    }

    #[test]
    fn meta_block_check_catches_overlap() {
        let mut mb = MetaBlock::init(512, 4);
        insert_entry(&mut mb, &de("aa"));
        insert_entry(&mut mb, &de("bb"));
        // corrupt the second chunk to overlap the first
        let me0 = mb.index_entry(0);
        mb.put_index_entry(1, me0);
        assert!(mb.check().is_err());
    }

    #[test]
    fn meta_block_unpack_rejects_bad_geometry() {
        let mut mb = MetaBlock::init(512, 4);
        mb.pack();
        let mut bytes = mb.bytes().to_vec();
        // nindex > maxindex
        put_be_u16(&mut bytes, 10, 9);
        assert!(MetaBlock::unpack(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_dir_entry_round_trip(
            elem in "[a-z]{1,24}",
            entry in any::<u32>(),
            gen in any::<u32>(),
            qid in any::<u64>(),
            mtime in any::<u32>(),
            mode in 0_u32..=0o777,
            size in any::<u64>(),
            dir in any::<bool>(),
        ) {
            let mut d = de(&elem);
            d.entry = entry;
            d.gen = gen;
            d.qid = qid;
            d.mtime = mtime;
            d.mode = mode;
            d.size = size;
            if dir {
                d.mode |= MODE_DIR;
                d.mentry = entry.wrapping_add(1);
                d.mgen = gen.wrapping_add(1);
            }
            let mut buf = vec![0_u8; d.packed_size()];
            d.pack(&mut buf, 0);
            prop_assert_eq!(DirEntry::unpack(&buf, 0, buf.len()).unwrap(), d);
        }

        #[test]
        fn prop_meta_block_stays_consistent(names in proptest::collection::vec("[a-z]{1,12}", 1..20)) {
            let mut mb = MetaBlock::init(8192, 80);
            let mut inserted = std::collections::BTreeSet::new();
            for name in names {
                if inserted.contains(&name) {
                    continue;
                }
                let d = de(&name);
                if !mb.has_room(d.packed_size()) {
                    break;
                }
                let n = d.packed_size();
                let o = mb.alloc(n).unwrap();
                let me = MetaEntry { offset: o, size: n as u16 };
                let i = match mb.search(&name).unwrap() {
                    Ok(_) => unreachable!("duplicates filtered"),
                    Err(i) => i,
                };
                mb.pack_dir_entry(&d, me);
                mb.insert(i, me);
                mb.pack();
                inserted.insert(name);
                prop_assert!(mb.check().is_ok());
            }
            let names_in_block: Vec<String> =
                (0..mb.nindex()).map(|i| mb.elem(i).unwrap()).collect();
            let expect: Vec<String> = inserted.into_iter().collect();
            prop_assert_eq!(names_in_block, expect);
        }
    }
}
