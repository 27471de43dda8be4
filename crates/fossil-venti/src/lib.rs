#![forbid(unsafe_code)]
//! The consumed archive-tier boundary.
//!
//! The engine treats the content-addressed store as an opaque session:
//! `read(score, type) -> bytes`, `write(type, bytes) -> score`, `sync`.
//! Scores are the first 20 bytes of the blake3 hash of the stored payload.
//! Two sessions are provided: an in-memory store for tests and restores, and
//! a directory-backed store sharded by score prefix for durable archives.
//!
//! Blocks are zero-truncated before hashing and zero-extended after reads,
//! so a block's score is independent of the device block size.

use fossil_error::{FossilError, Result};
use fossil_ondisk::Score;
use fossil_types::{BlockType, ENTRY_SIZE, SCORE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Score of a payload: truncated blake3.
#[must_use]
pub fn score_of(data: &[u8]) -> Score {
    let hash = blake3::hash(data);
    let mut bytes = [0_u8; SCORE_SIZE];
    bytes.copy_from_slice(&hash.as_bytes()[..SCORE_SIZE]);
    Score(bytes)
}

/// Score of the empty payload; pointers to unwritten blocks carry it.
#[must_use]
pub fn zero_score() -> Score {
    static ZERO: OnceLock<Score> = OnceLock::new();
    *ZERO.get_or_init(|| score_of(&[]))
}

/// Strip insignificant trailing zeros before storing.
///
/// Pointer blocks truncate at score granularity, directory blocks at entry
/// granularity, data blocks at byte granularity.
#[must_use]
pub fn zero_truncate(typ: BlockType, data: &[u8]) -> &[u8] {
    let unit = if typ.is_pointer() {
        SCORE_SIZE
    } else if typ.is_dir_tree() {
        ENTRY_SIZE
    } else {
        1
    };
    let mut end = data.len();
    while end >= unit && data[end - unit..end].iter().all(|b| *b == 0) {
        end -= unit;
    }
    &data[..end]
}

/// Zero-fill the tail after a read returned `n` significant bytes.
pub fn zero_extend(buf: &mut [u8], n: usize) {
    buf[n..].fill(0);
}

/// One session against the archive tier.
///
/// Sessions are shared between the archiver and fsck; implementations
/// serialize internally. A dropped transport surfaces retryable
/// [`FossilError::Venti`] errors until re-dialed.
pub trait VentiSession: Send + Sync {
    /// Fetch a payload into `buf`, returning its stored length.
    ///
    /// The stored type must match `typ`; the tail of `buf` past the returned
    /// length is zeroed.
    fn read(&self, score: Score, typ: BlockType, buf: &mut [u8]) -> Result<usize>;

    /// Store a payload, returning its score. The payload is zero-truncated
    /// first, so re-writing an extended copy of the same block is a no-op.
    fn write(&self, typ: BlockType, data: &[u8]) -> Result<Score>;

    /// Ensure previously written payloads are durable.
    fn sync(&self) -> Result<()>;
}

/// In-memory archive store.
#[derive(Default)]
pub struct MemVenti {
    blocks: Mutex<HashMap<Score, (u8, Vec<u8>)>>,
}

impl MemVenti {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Whether a score is present, regardless of type.
    #[must_use]
    pub fn contains(&self, score: Score) -> bool {
        score == zero_score() || self.blocks.lock().contains_key(&score)
    }
}

impl VentiSession for MemVenti {
    fn read(&self, score: Score, typ: BlockType, buf: &mut [u8]) -> Result<usize> {
        if score == zero_score() {
            zero_extend(buf, 0);
            return Ok(0);
        }
        let blocks = self.blocks.lock();
        let (stored_typ, data) = blocks
            .get(&score)
            .ok_or_else(|| FossilError::Venti(format!("no block with score {score}")))?;
        if *stored_typ != typ.raw() {
            return Err(FossilError::Venti(format!(
                "type mismatch for {score}: stored {stored_typ}, want {}",
                typ.raw()
            )));
        }
        if data.len() > buf.len() {
            return Err(FossilError::Venti(format!(
                "block {score} larger than buffer: {} > {}",
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(data);
        zero_extend(buf, data.len());
        Ok(data.len())
    }

    fn write(&self, typ: BlockType, data: &[u8]) -> Result<Score> {
        let trimmed = zero_truncate(typ, data);
        let score = score_of(trimmed);
        trace!(target: "fossil::venti", %score, typ = %typ, len = trimmed.len(), "write");
        self.blocks
            .lock()
            .entry(score)
            .or_insert_with(|| (typ.raw(), trimmed.to_vec()));
        Ok(score)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Directory-backed archive store.
///
/// Payloads land at `root/ab/cd/<hex>` keyed by score, with a one-byte type
/// prefix inside the file. Writes go through a temp file and rename so a
/// crash never leaves a torn payload under a valid score path.
pub struct DirVenti {
    root: PathBuf,
}

impl DirVenti {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        debug!(target: "fossil::venti", root = %root.display(), "opened store");
        Ok(Self { root })
    }

    fn path_of(&self, score: Score) -> PathBuf {
        let hex = score.to_string();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

impl VentiSession for DirVenti {
    fn read(&self, score: Score, typ: BlockType, buf: &mut [u8]) -> Result<usize> {
        if score == zero_score() {
            zero_extend(buf, 0);
            return Ok(0);
        }
        let path = self.path_of(score);
        let raw = std::fs::read(&path)
            .map_err(|e| FossilError::Venti(format!("read {score}: {e}")))?;
        let Some((stored_typ, data)) = raw.split_first() else {
            return Err(FossilError::Venti(format!("empty payload for {score}")));
        };
        if *stored_typ != typ.raw() {
            return Err(FossilError::Venti(format!(
                "type mismatch for {score}: stored {stored_typ}, want {}",
                typ.raw()
            )));
        }
        if data.len() > buf.len() {
            return Err(FossilError::Venti(format!(
                "block {score} larger than buffer: {} > {}",
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(data);
        zero_extend(buf, data.len());
        Ok(data.len())
    }

    fn write(&self, typ: BlockType, data: &[u8]) -> Result<Score> {
        let trimmed = zero_truncate(typ, data);
        let score = score_of(trimmed);
        let path = self.path_of(score);
        if path.exists() {
            return Ok(score);
        }
        let dir = path.parent().expect("sharded path has a parent");
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".tmp.{score}"));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&[typ.raw()])?;
            f.write_all(trimmed)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        trace!(target: "fossil::venti", %score, typ = %typ, len = trimmed.len(), "write");
        Ok(score)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
