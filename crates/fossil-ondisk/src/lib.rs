#![forbid(unsafe_code)]
//! Bit-exact on-disk codecs for the fossil engine.
//!
//! Scores, the partition header, the super block, per-block labels, and
//! directory-block entries. Multi-byte fields are big-endian except the
//! address word of a local score, which is little-endian. The meta-block
//! container lives in [`meta`].

pub mod meta;

pub use meta::{DirEntry, MetaBlock, MetaEntry};

use fossil_types::{
    BlockAddr, BlockSize, BlockType, ENTRY_SIZE, Epoch, HEADER_MAGIC, HEADER_SIZE, HEADER_VERSION,
    LABEL_SIZE, MAX_FILE_SIZE, ParseError, SCORE_SIZE, SUPER_MAGIC, SUPER_SIZE, SUPER_VERSION, Tag,
    ensure_slice, put_be_u16, put_be_u32, put_be_u48, put_be_u64, put_le_u32, read_be_u16,
    read_be_u32, read_be_u48, read_be_u64, read_fixed, read_le_u32,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Scores ──────────────────────────────────────────────────────────────────

/// 20-byte content hash, or a local block address in sentinel form.
///
/// A local score is 16 zero bytes followed by the little-endian address.
/// Anything else is a true content score owned by the archive tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Score(pub [u8; SCORE_SIZE]);

impl Score {
    /// Encode a local block address.
    #[must_use]
    pub fn local(addr: BlockAddr) -> Self {
        let mut bytes = [0_u8; SCORE_SIZE];
        put_le_u32(&mut bytes, 16, addr.0);
        Self(bytes)
    }

    /// Decode a local address, or `None` if this is a content score.
    #[must_use]
    pub fn to_local(self) -> Option<BlockAddr> {
        if self.0[..16].iter().all(|b| *b == 0) {
            Some(BlockAddr(read_le_u32(&self.0, 16).expect("fixed width")))
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_local(self) -> bool {
        self.to_local().is_some()
    }

    pub fn read(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        read_fixed::<SCORE_SIZE>(data, offset).map(Self)
    }

    pub fn put(self, data: &mut [u8], offset: usize) {
        data[offset..offset + SCORE_SIZE].copy_from_slice(&self.0);
    }

    /// Parse the 40-hex-digit form printed by [`fmt::Display`].
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.strip_prefix("vac:").unwrap_or(s);
        if s.len() != 2 * SCORE_SIZE || !s.is_ascii() {
            return Err(ParseError::InvalidField {
                field: "score",
                reason: "expected 40 hex digits",
            });
        }
        let mut bytes = [0_u8; SCORE_SIZE];
        for (i, out) in bytes.iter_mut().enumerate() {
            let pair = &s[2 * i..2 * i + 2];
            *out = u8::from_str_radix(pair, 16).map_err(|_| ParseError::InvalidField {
                field: "score",
                reason: "bad hex digit",
            })?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(addr) = self.to_local() {
            return write!(f, "local({addr})");
        }
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ── Header ──────────────────────────────────────────────────────────────────

/// Fixed superblock-of-superblocks persisted at byte offset 128 KiB.
///
/// Written only by the formatter; validated once at open and never rewritten
/// at runtime. All addresses are device-absolute block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u16,
    pub block_size: BlockSize,
    /// First block of the super partition.
    pub super_first: u32,
    /// First block of the label partition.
    pub label_first: u32,
    /// First block of the data partition.
    pub data_first: u32,
    /// One past the last data block.
    pub end: u32,
}

impl Header {
    pub fn pack(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        out[..HEADER_SIZE].fill(0);
        put_be_u32(out, 0, HEADER_MAGIC);
        put_be_u16(out, 4, self.version);
        #[allow(clippy::cast_possible_truncation)] // block size <= 56 KiB
        put_be_u16(out, 6, self.block_size.get() as u16);
        put_be_u32(out, 8, self.super_first);
        put_be_u32(out, 12, self.label_first);
        put_be_u32(out, 16, self.data_first);
        put_be_u32(out, 20, self.end);
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(data, 0)?;
        if magic != HEADER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: HEADER_MAGIC,
                actual: magic,
            });
        }
        let version = read_be_u16(data, 4)?;
        if version != HEADER_VERSION {
            return Err(ParseError::InvalidField {
                field: "header_version",
                reason: "unsupported version",
            });
        }
        let block_size = BlockSize::new(u32::from(read_be_u16(data, 6)?))?;
        let header = Self {
            version,
            block_size,
            super_first: read_be_u32(data, 8)?,
            label_first: read_be_u32(data, 12)?,
            data_first: read_be_u32(data, 16)?,
            end: read_be_u32(data, 20)?,
        };
        header.validate()?;
        Ok(header)
    }

    /// Partition ordering and label coverage: every data block must have
    /// exactly one label slot.
    pub fn validate(&self) -> Result<(), ParseError> {
        if !(self.super_first < self.label_first
            && self.label_first < self.data_first
            && self.data_first <= self.end)
        {
            return Err(ParseError::InvalidField {
                field: "partitions",
                reason: "super < label < data <= end violated",
            });
        }
        let lpb = self.block_size.labels_per_block();
        let nlabel = u64::from(self.data_first - self.label_first);
        let ndata = u64::from(self.end - self.data_first);
        if nlabel * u64::from(lpb) < ndata {
            return Err(ParseError::InvalidField {
                field: "partitions",
                reason: "label partition too small for data blocks",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn super_blocks(&self) -> u32 {
        self.label_first - self.super_first
    }

    #[must_use]
    pub fn label_blocks(&self) -> u32 {
        self.data_first - self.label_first
    }

    #[must_use]
    pub fn data_blocks(&self) -> u32 {
        self.end - self.data_first
    }
}

// ── Labels ──────────────────────────────────────────────────────────────────

/// Allocation-state bitset stored in a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelState(u8);

impl LabelState {
    pub const FREE: Self = Self(0);
    pub const ALLOC: Self = Self(1 << 0);
    pub const COPIED: Self = Self(1 << 1);
    pub const VENTI: Self = Self(1 << 2);
    pub const CLOSED: Self = Self(1 << 3);

    const MASK: u8 = 0x0f;

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        if raw & !Self::MASK != 0 {
            return Err(ParseError::InvalidField {
                field: "label_state",
                reason: "unknown state bits",
            });
        }
        if raw != 0 && raw & Self::ALLOC.0 == 0 {
            return Err(ParseError::InvalidField {
                field: "label_state",
                reason: "non-free state without alloc bit",
            });
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_free(self) -> bool {
        self == Self::FREE
    }

    #[must_use]
    pub fn contains(self, bit: Self) -> bool {
        self.0 & bit.0 != 0
    }

    #[must_use]
    pub fn with(self, bit: Self) -> Self {
        Self(self.0 | bit.0 | Self::ALLOC.0)
    }
}

impl fmt::Display for LabelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_free() {
            return write!(f, "Free");
        }
        write!(f, "Alloc")?;
        if self.contains(Self::COPIED) {
            write!(f, "+Copied")?;
        }
        if self.contains(Self::VENTI) {
            write!(f, "+Venti")?;
        }
        if self.contains(Self::CLOSED) {
            write!(f, "+Closed")?;
        }
        Ok(())
    }
}

/// Per-block metadata record in the label partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub typ: BlockType,
    pub state: LabelState,
    /// Epoch the block was first written.
    pub epoch: Epoch,
    /// Epoch the block left the active tree; infinity while still active.
    pub epoch_close: Epoch,
    pub tag: Tag,
}

impl Label {
    /// Label of an unallocated block.
    #[must_use]
    pub fn free() -> Self {
        Self {
            typ: BlockType::NONE,
            state: LabelState::FREE,
            epoch: Epoch::ZERO,
            epoch_close: Epoch::ZERO,
            tag: Tag::BAD,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.state.is_free()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.contains(LabelState::CLOSED)
    }

    /// Whether the block belongs to the live tree of the given epoch window.
    #[must_use]
    pub fn in_active(&self, elo: Epoch, ehi: Epoch) -> bool {
        !self.is_free()
            && !self.is_closed()
            && self.epoch_close == Epoch::INFINITY
            && self.epoch >= elo
            && self.epoch <= ehi
    }

    /// Pack into a label block at the given record index.
    pub fn pack(&self, out: &mut [u8], index: usize) {
        let p = &mut out[index * LABEL_SIZE..(index + 1) * LABEL_SIZE];
        p[0] = self.typ.raw();
        p[1] = self.state.raw();
        put_be_u32(p, 2, self.epoch.0);
        put_be_u32(p, 6, self.epoch_close.0);
        put_be_u32(p, 10, self.tag.0);
    }

    pub fn unpack(data: &[u8], index: usize) -> Result<Self, ParseError> {
        let p = ensure_slice(data, index * LABEL_SIZE, LABEL_SIZE)?;
        let label = Self {
            typ: BlockType::from_raw(p[0])?,
            state: LabelState::from_raw(p[1])?,
            epoch: Epoch(read_be_u32(p, 2)?),
            epoch_close: Epoch(read_be_u32(p, 6)?),
            tag: Tag(read_be_u32(p, 10)?),
        };
        if !label.is_free() && label.epoch_close != Epoch::INFINITY {
            if label.epoch_close < label.epoch {
                return Err(ParseError::InvalidField {
                    field: "epoch_close",
                    reason: "closes before epoch",
                });
            }
        }
        Ok(label)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} epoch [{}, {}) tag {}",
            self.typ, self.state, self.epoch, self.epoch_close, self.tag
        )
    }
}

// ── Super block ─────────────────────────────────────────────────────────────

/// Root pointer and epoch window; the only globally visible commit point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Super {
    pub version: u16,
    pub epoch_low: Epoch,
    pub epoch_high: Epoch,
    /// Next qid to hand out.
    pub qid: u64,
    /// Root block of the active tree at `epoch_high`.
    pub active: BlockAddr,
    /// Root queued for the archiver.
    pub next: BlockAddr,
    /// Root the archiver is currently storing.
    pub current: BlockAddr,
    /// Score of the most recently archived root.
    pub last: Score,
    /// Textual label, at most 127 bytes.
    pub name: String,
}

const SUPER_NAME_SIZE: usize = 128;

impl Super {
    pub fn pack(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= SUPER_SIZE);
        debug_assert!(self.name.len() < SUPER_NAME_SIZE);
        out.fill(0);
        put_be_u32(out, 0, SUPER_MAGIC);
        put_be_u16(out, 4, self.version);
        put_be_u32(out, 6, self.epoch_low.0);
        put_be_u32(out, 10, self.epoch_high.0);
        put_be_u64(out, 14, self.qid);
        put_be_u32(out, 22, self.active.0);
        put_be_u32(out, 26, self.next.0);
        put_be_u32(out, 30, self.current.0);
        self.last.put(out, 34);
        out[54..54 + self.name.len()].copy_from_slice(self.name.as_bytes());
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(data, 0)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPER_MAGIC,
                actual: magic,
            });
        }
        let version = read_be_u16(data, 4)?;
        if version != SUPER_VERSION {
            return Err(ParseError::InvalidField {
                field: "super_version",
                reason: "unsupported version",
            });
        }
        let epoch_low = Epoch(read_be_u32(data, 6)?);
        let epoch_high = Epoch(read_be_u32(data, 10)?);
        if epoch_low == Epoch::ZERO || epoch_low > epoch_high {
            return Err(ParseError::InvalidField {
                field: "epoch_window",
                reason: "low epoch zero or above high epoch",
            });
        }
        let name_bytes = ensure_slice(data, 54, SUPER_NAME_SIZE)?;
        let end = name_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(SUPER_NAME_SIZE);
        let name = std::str::from_utf8(&name_bytes[..end])
            .map_err(|_| ParseError::InvalidField {
                field: "super_name",
                reason: "not valid UTF-8",
            })?
            .to_owned();
        Ok(Self {
            version,
            epoch_low,
            epoch_high,
            qid: read_be_u64(data, 14)?,
            active: BlockAddr(read_be_u32(data, 22)?),
            next: BlockAddr(read_be_u32(data, 26)?),
            current: BlockAddr(read_be_u32(data, 30)?),
            last: Score::read(data, 34)?,
            name,
        })
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

pub const ENTRY_ACTIVE: u8 = 1 << 0;
pub const ENTRY_DIR: u8 = 1 << 1;
const ENTRY_DEPTH_SHIFT: u8 = 2;
const ENTRY_DEPTH_MASK: u8 = 0x7 << ENTRY_DEPTH_SHIFT;
pub const ENTRY_LOCAL: u8 = 1 << 5;
pub const ENTRY_NOARCHIVE: u8 = 1 << 6;

/// One 40-byte slot of a directory block: the root of a source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Generation counter, bumped on removal so stale handles can tell.
    pub gen: u32,
    /// Pointer block size for this tree.
    pub psize: u16,
    /// Data block size for this tree.
    pub dsize: u16,
    pub flags: u8,
    /// Height of the pointer tree above the leaves.
    pub depth: u8,
    /// Logical size in bytes.
    pub size: u64,
    pub score: Score,
    /// Owning tag; only meaningful for local entries.
    pub tag: Tag,
    /// Epoch this entry was snapshotted at; zero for live entries.
    pub snap: Epoch,
    /// Whether the snapshot is destined for the archive tier.
    pub archive: bool,
}

impl Entry {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flags & ENTRY_ACTIVE != 0
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.flags & ENTRY_DIR != 0
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.flags & ENTRY_LOCAL != 0
    }

    #[must_use]
    pub fn no_archive(&self) -> bool {
        self.flags & ENTRY_NOARCHIVE != 0
    }

    /// Type of the root block of this tree.
    #[must_use]
    pub fn block_type(&self) -> BlockType {
        let leaf = if self.is_dir() {
            BlockType::DIR
        } else {
            BlockType::DATA
        };
        BlockType::pointer(leaf, self.depth)
    }

    /// Pack into a directory block at the given slot.
    pub fn pack(&self, out: &mut [u8], index: usize) {
        debug_assert!(self.size <= MAX_FILE_SIZE);
        debug_assert!(self.depth <= BlockType::MAX_DEPTH);
        let p = &mut out[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE];
        p.fill(0);
        put_be_u32(p, 0, self.gen);
        put_be_u16(p, 4, self.psize);
        put_be_u16(p, 6, self.dsize);
        p[8] = (self.flags & !ENTRY_DEPTH_MASK) | (self.depth << ENTRY_DEPTH_SHIFT);
        put_be_u48(p, 14, self.size);
        if self.is_local() {
            let addr = self
                .score
                .to_local()
                .expect("local entry carries a local score");
            p[27] = u8::from(self.archive);
            put_be_u32(p, 28, self.snap.0);
            put_be_u32(p, 32, self.tag.0);
            put_le_u32(p, 36, addr.0);
        } else {
            self.score.put(p, 20);
        }
    }

    pub fn unpack(data: &[u8], index: usize) -> Result<Self, ParseError> {
        let p = ensure_slice(data, index * ENTRY_SIZE, ENTRY_SIZE)?;
        let flag_byte = p[8];
        let depth = (flag_byte & ENTRY_DEPTH_MASK) >> ENTRY_DEPTH_SHIFT;
        let flags = flag_byte & !ENTRY_DEPTH_MASK;
        let mut entry = Self {
            gen: read_be_u32(p, 0)?,
            psize: read_be_u16(p, 4)?,
            dsize: read_be_u16(p, 6)?,
            flags,
            depth,
            size: read_be_u48(p, 14)?,
            score: Score::read(p, 20)?,
            tag: Tag::BAD,
            snap: Epoch::ZERO,
            archive: false,
        };
        if flags & ENTRY_LOCAL != 0 {
            if p[20..27].iter().any(|b| *b != 0) {
                return Err(ParseError::InvalidField {
                    field: "entry",
                    reason: "local entry with nonzero reserved bytes",
                });
            }
            entry.archive = p[27] != 0;
            entry.snap = Epoch(read_be_u32(p, 28)?);
            entry.tag = Tag(read_be_u32(p, 32)?);
            entry.score = Score::local(BlockAddr(read_le_u32(p, 36)?));
        }
        if entry.is_active() && (entry.psize < 256 || entry.dsize < 256) {
            return Err(ParseError::InvalidField {
                field: "entry",
                reason: "active entry with implausible block sizes",
            });
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn score_local_round_trip() {
        let s = Score::local(BlockAddr(0x1234));
        assert_eq!(s.to_local(), Some(BlockAddr(0x1234)));
        assert!(s.is_local());
        assert_eq!(s.0[16..20], [0x34, 0x12, 0, 0]);

        let nil = Score::local(BlockAddr::NIL);
        assert_eq!(nil.to_local(), Some(BlockAddr::NIL));
    }

    #[test]
    fn score_content_is_not_local() {
        let mut bytes = [0_u8; SCORE_SIZE];
        bytes[0] = 1;
        assert_eq!(Score(bytes).to_local(), None);
    }

    #[test]
    fn score_parse_display() {
        let mut bytes = [0_u8; SCORE_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = 0x10 + i as u8;
        }
        let s = Score(bytes);
        let text = s.to_string();
        assert_eq!(Score::parse(&text).unwrap(), s);
        assert_eq!(Score::parse(&format!("vac:{text}")).unwrap(), s);
        assert!(Score::parse("xyz").is_err());
    }

    fn sample_header() -> Header {
        Header {
            version: HEADER_VERSION,
            block_size: BlockSize::new(8192).unwrap(),
            super_first: 18,
            label_first: 19,
            data_first: 33,
            end: 8192,
        }
    }

    #[test]
    fn header_round_trip() {
        let h = sample_header();
        let mut buf = [0_u8; HEADER_SIZE];
        h.pack(&mut buf);
        assert_eq!(Header::unpack(&buf).unwrap(), h);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = [0_u8; HEADER_SIZE];
        sample_header().pack(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            Header::unpack(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn header_rejects_short_label_partition() {
        let mut h = sample_header();
        h.data_first = h.label_first + 1;
        h.end = h.data_first + 2 * h.block_size.labels_per_block();
        assert!(h.validate().is_err());
    }

    #[test]
    fn label_round_trip() {
        let l = Label {
            typ: BlockType::pointer(BlockType::DIR, 2),
            state: LabelState::ALLOC.with(LabelState::COPIED),
            epoch: Epoch(7),
            epoch_close: Epoch::INFINITY,
            tag: Tag(0xdead_beef),
        };
        let mut buf = vec![0_u8; 3 * LABEL_SIZE];
        l.pack(&mut buf, 1);
        assert_eq!(Label::unpack(&buf, 1).unwrap(), l);
        // neighbours untouched
        assert_eq!(Label::unpack(&buf, 0).unwrap(), Label::free());
    }

    #[test]
    fn label_free_invariant() {
        let free = Label::free();
        assert!(free.is_free());
        assert_eq!(free.typ, BlockType::NONE);
        assert_eq!(free.tag, Tag::BAD);
        let mut buf = vec![0_u8; LABEL_SIZE];
        free.pack(&mut buf, 0);
        assert!(buf.iter().take(2).all(|b| *b == 0));
    }

    #[test]
    fn label_rejects_backwards_close() {
        let l = Label {
            typ: BlockType::DATA,
            state: LabelState::ALLOC.with(LabelState::CLOSED),
            epoch: Epoch(9),
            epoch_close: Epoch(4),
            tag: Tag(77),
        };
        let mut buf = vec![0_u8; LABEL_SIZE];
        l.pack(&mut buf, 0);
        assert!(Label::unpack(&buf, 0).is_err());
    }

    #[test]
    fn label_state_rules() {
        assert!(LabelState::from_raw(0).unwrap().is_free());
        // closed without alloc is nonsense
        assert!(LabelState::from_raw(0x08).is_err());
        assert!(LabelState::from_raw(0x09).is_ok());
        assert!(LabelState::from_raw(0x10).is_err());
        assert!(
            LabelState::ALLOC
                .with(LabelState::CLOSED)
                .contains(LabelState::CLOSED)
        );
    }

    #[test]
    fn label_in_active_window() {
        let mut l = Label {
            typ: BlockType::DATA,
            state: LabelState::ALLOC,
            epoch: Epoch(5),
            epoch_close: Epoch::INFINITY,
            tag: Tag(42),
        };
        assert!(l.in_active(Epoch(3), Epoch(8)));
        assert!(!l.in_active(Epoch(6), Epoch(8)));
        l.epoch_close = Epoch(6);
        assert!(!l.in_active(Epoch(3), Epoch(8)));
    }

    fn sample_super() -> Super {
        Super {
            version: SUPER_VERSION,
            epoch_low: Epoch(1),
            epoch_high: Epoch(3),
            qid: 99,
            active: BlockAddr(2),
            next: BlockAddr::NIL,
            current: BlockAddr::NIL,
            last: Score::local(BlockAddr::NIL),
            name: "main".to_owned(),
        }
    }

    #[test]
    fn super_round_trip() {
        let s = sample_super();
        let mut buf = vec![0_u8; 512];
        s.pack(&mut buf);
        assert_eq!(Super::unpack(&buf).unwrap(), s);
    }

    #[test]
    fn super_rejects_bad_epoch_window() {
        let mut s = sample_super();
        s.epoch_low = Epoch(5);
        let mut buf = vec![0_u8; 512];
        s.pack(&mut buf);
        assert!(Super::unpack(&buf).is_err());
    }

    #[test]
    fn entry_local_round_trip() {
        let e = Entry {
            gen: 3,
            psize: 8160,
            dsize: 8192,
            flags: ENTRY_ACTIVE | ENTRY_DIR | ENTRY_LOCAL,
            depth: 2,
            size: 3 * 8192,
            score: Score::local(BlockAddr(0x77)),
            tag: Tag(0xcafe_f00d),
            snap: Epoch(12),
            archive: true,
        };
        let mut buf = vec![0_u8; 2 * ENTRY_SIZE];
        e.pack(&mut buf, 1);
        assert_eq!(Entry::unpack(&buf, 1).unwrap(), e);
    }

    #[test]
    fn entry_global_round_trip() {
        let mut score = [0x5a_u8; SCORE_SIZE];
        score[0] = 1;
        let e = Entry {
            gen: 0,
            psize: 1024,
            dsize: 1024,
            flags: ENTRY_ACTIVE,
            depth: 0,
            size: 17,
            score: Score(score),
            tag: Tag::BAD,
            snap: Epoch::ZERO,
            archive: false,
        };
        let mut buf = vec![0_u8; ENTRY_SIZE];
        e.pack(&mut buf, 0);
        assert_eq!(Entry::unpack(&buf, 0).unwrap(), e);
    }

    #[test]
    fn entry_inactive_zero_slot() {
        let buf = vec![0_u8; ENTRY_SIZE];
        let e = Entry::unpack(&buf, 0).unwrap();
        assert!(!e.is_active());
        assert_eq!(e.size, 0);
    }

    #[test]
    fn entry_rejects_tiny_active_sizes() {
        let mut buf = vec![0_u8; ENTRY_SIZE];
        let e = Entry {
            gen: 0,
            psize: 8,
            dsize: 8,
            flags: ENTRY_ACTIVE,
            depth: 0,
            size: 0,
            score: Score::local(BlockAddr::NIL),
            tag: Tag::BAD,
            snap: Epoch::ZERO,
            archive: false,
        };
        e.pack(&mut buf, 0);
        assert!(Entry::unpack(&buf, 0).is_err());
    }

    #[test]
    fn entry_block_type() {
        let mut e = Entry {
            gen: 0,
            psize: 1024,
            dsize: 1024,
            flags: ENTRY_ACTIVE | ENTRY_DIR,
            depth: 0,
            size: 0,
            score: Score::local(BlockAddr::NIL),
            tag: Tag::BAD,
            snap: Epoch::ZERO,
            archive: false,
        };
        assert_eq!(e.block_type(), BlockType::DIR);
        e.depth = 3;
        assert_eq!(e.block_type(), BlockType::pointer(BlockType::DIR, 3));
        e.flags = ENTRY_ACTIVE;
        assert_eq!(e.block_type(), BlockType::pointer(BlockType::DATA, 3));
    }

    proptest! {
        #[test]
        fn prop_label_round_trip(
            typ in 0_u8..=16,
            state in prop_oneof![Just(0_u8), (1_u8..=15).prop_map(|s| s | 1)],
            epoch in any::<u32>(),
            close_delta in any::<u32>(),
            tag in any::<u32>(),
        ) {
            prop_assume!(BlockType::from_raw(typ).is_ok());
            let epoch_close = if state == 0 {
                Epoch(close_delta)
            } else {
                Epoch(epoch.saturating_add(close_delta))
            };
            let l = Label {
                typ: BlockType::from_raw(typ).unwrap(),
                state: LabelState::from_raw(state).unwrap(),
                epoch: Epoch(epoch),
                epoch_close,
                tag: Tag(tag),
            };
            let mut buf = vec![0_u8; LABEL_SIZE];
            l.pack(&mut buf, 0);
            prop_assert_eq!(Label::unpack(&buf, 0).unwrap(), l);
        }

        #[test]
        fn prop_entry_local_round_trip(
            gen in any::<u32>(),
            addr in any::<u32>(),
            depth in 0_u8..=7,
            size in 0_u64..=MAX_FILE_SIZE,
            tag in any::<u32>(),
            snap in any::<u32>(),
            archive in any::<bool>(),
            dir in any::<bool>(),
        ) {
            let mut flags = ENTRY_ACTIVE | ENTRY_LOCAL;
            if dir {
                flags |= ENTRY_DIR;
            }
            let e = Entry {
                gen,
                psize: 8160,
                dsize: 8192,
                flags,
                depth,
                size,
                score: Score::local(BlockAddr(addr)),
                tag: Tag(tag),
                snap: Epoch(snap),
                archive,
            };
            let mut buf = vec![0_u8; ENTRY_SIZE];
            e.pack(&mut buf, 0);
            prop_assert_eq!(Entry::unpack(&buf, 0).unwrap(), e);
        }
    }
}
