#![forbid(unsafe_code)]
//! End-to-end fixtures for the fossil engine.
//!
//! [`TestImage`] formats a temporary file-backed image and reopens it any
//! number of times, byte-poking included, so tests can exercise the real
//! open/crash/reopen paths. The venti helpers reconstruct files straight
//! from an archived root score, proving archives are self-contained.

use fossil_device::{ByteDevice, Disk, FileByteDevice};
use fossil_error::{FossilError, Result};
use fossil_fs::format::{FormatOpts, format};
use fossil_fs::{Fs, FsConfig};
use fossil_ondisk::{Entry, Header, MetaBlock, Score};
use fossil_types::{
    BlockSize, ENTRY_SIZE, HEADER_OFFSET, HEADER_SIZE, LABEL_SIZE, Mode, SCORE_SIZE,
};
use fossil_venti::{VentiSession, zero_score};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// A formatted image on a temporary file.
pub struct TestImage {
    file: NamedTempFile,
    pub block_size: u32,
}

impl TestImage {
    /// Create and format a 64 MiB image.
    pub fn new(block_size: u32) -> Result<Self> {
        Self::with_len(block_size, 64 * 1024 * 1024)
    }

    pub fn with_len(block_size: u32, len: u64) -> Result<Self> {
        let file = NamedTempFile::new()?;
        file.as_file().set_len(len)?;
        let dev = FileByteDevice::open(file.path())?;
        let opts = FormatOpts {
            block_size: BlockSize::new(block_size)?,
            label: "harness".to_owned(),
        };
        format(Arc::new(dev), &opts)?;
        Ok(Self { file, block_size })
    }

    pub fn open(&self) -> Result<Arc<Fs>> {
        self.open_with(None, Mode::ReadWrite)
    }

    pub fn open_readonly(&self) -> Result<Arc<Fs>> {
        self.open_with(None, Mode::ReadOnly)
    }

    pub fn open_with(
        &self,
        venti: Option<Arc<dyn VentiSession>>,
        mode: Mode,
    ) -> Result<Arc<Fs>> {
        let dev = FileByteDevice::open(self.file.path())?;
        let disk = Arc::new(Disk::open(Arc::new(dev))?);
        Fs::open(
            disk,
            venti,
            FsConfig {
                mode,
                ..FsConfig::default()
            },
        )
    }

    /// The on-disk partition header.
    pub fn header(&self) -> Result<Header> {
        let dev = FileByteDevice::open(self.file.path())?;
        let mut buf = [0_u8; HEADER_SIZE];
        dev.read_exact_at(HEADER_OFFSET, &mut buf)?;
        Ok(Header::unpack(&buf)?)
    }

    /// Overwrite one raw byte of the image. The file system must be closed.
    pub fn poke(&self, offset: u64, value: u8) -> Result<()> {
        let mut f = self.file.reopen()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(&[value])?;
        f.sync_all()?;
        Ok(())
    }

    /// Byte offset of field byte `field` within `addr`'s label record.
    pub fn label_byte_offset(&self, addr: u32, field: usize) -> Result<u64> {
        debug_assert!(field < LABEL_SIZE);
        let header = self.header()?;
        let bsize = u64::from(self.block_size);
        let lpb = header.block_size.labels_per_block();
        let lblock = u64::from(header.label_first + addr / lpb);
        let slot = u64::from(addr % lpb) * LABEL_SIZE as u64;
        Ok(lblock * bsize + slot + field as u64)
    }

    /// Byte offset of the state byte of `addr`'s label.
    pub fn label_state_offset(&self, addr: u32) -> Result<u64> {
        self.label_byte_offset(addr, 1)
    }

    /// Read one raw byte of the image.
    pub fn peek(&self, offset: u64) -> Result<u8> {
        let dev = FileByteDevice::open(self.file.path())?;
        let mut b = [0_u8];
        dev.read_exact_at(offset, &mut b)?;
        Ok(b[0])
    }
}

// ── Archive-side reconstruction ─────────────────────────────────────────────

/// Read one leaf block of an archived tree, resolving the pointer chain
/// through the archive tier only.
fn venti_tree_block(
    venti: &dyn VentiSession,
    e: &Entry,
    bn: u32,
    bsize: usize,
) -> Result<Vec<u8>> {
    let ppb = usize::from(e.psize) / SCORE_SIZE;
    let mut typ = e.block_type();
    let mut score = e.score;
    let mut buf = vec![0_u8; bsize];
    for level in (0..=e.depth).rev() {
        if score == zero_score() {
            buf.fill(0);
            return Ok(buf);
        }
        venti.read(score, typ, &mut buf)?;
        if level == 0 {
            return Ok(buf);
        }
        let stride = (ppb as u64).pow(u32::from(level) - 1);
        let idx = usize::try_from((u64::from(bn) / stride) % ppb as u64)
            .map_err(|_| FossilError::BadOffset)?;
        score = Score::read(&buf, idx * SCORE_SIZE)?;
        typ = typ.child().expect("pointer levels remain");
    }
    unreachable!("loop returns at level 0");
}

/// Reconstruct a named file from an archived root score.
///
/// The root payload carries the directory's data and meta entries; the meta
/// tree is searched for `name`, whose entry is then read block by block.
pub fn venti_read_file(
    venti: &dyn VentiSession,
    root: Score,
    bsize: usize,
    name: &str,
) -> Result<Vec<u8>> {
    let mut payload = vec![0_u8; bsize];
    venti.read(root, fossil_types::BlockType::DIR, &mut payload)?;
    let dir_entry = Entry::unpack(&payload, 0)?;
    let meta_entry = Entry::unpack(&payload, 1)?;

    // find the child's directory entry in the meta tree
    let dsize = u64::from(meta_entry.dsize);
    let nb = meta_entry.size.div_ceil(dsize);
    let mut child = None;
    for bo in 0..nb {
        let bo = u32::try_from(bo).map_err(|_| FossilError::BadOffset)?;
        let block = venti_tree_block(venti, &meta_entry, bo, bsize)?;
        let mb = MetaBlock::unpack(&block)?;
        if let Ok((_, me)) = mb.search(name)? {
            child = Some(mb.dir_entry(&me)?);
            break;
        }
    }
    let child = child.ok_or(FossilError::NoFile)?;

    // the child's entry lives in the directory's data tree
    let epb = u32::from(dir_entry.dsize) / ENTRY_SIZE as u32;
    let eblock = venti_tree_block(venti, &dir_entry, child.entry / epb, bsize)?;
    let ce = Entry::unpack(&eblock, (child.entry % epb) as usize)?;
    if !ce.is_active() || ce.gen != child.gen {
        return Err(FossilError::Removed);
    }

    let dsize = u64::from(ce.dsize);
    let mut out = Vec::with_capacity(usize::try_from(ce.size).unwrap_or(0));
    let nb = ce.size.div_ceil(dsize);
    for bn in 0..nb {
        let bn = u32::try_from(bn).map_err(|_| FossilError::BadOffset)?;
        let block = venti_tree_block(venti, &ce, bn, bsize)?;
        let want = usize::try_from((ce.size - out.len() as u64).min(dsize))
            .map_err(|_| FossilError::BadOffset)?;
        out.extend_from_slice(&block[..want]);
    }
    Ok(out)
}

/// Walk an archived tree counting every block read back successfully.
pub fn venti_walk(venti: &dyn VentiSession, score: Score, typ: fossil_types::BlockType, bsize: usize) -> Result<usize> {
    if score == zero_score() || score.is_local() {
        return Ok(0);
    }
    let mut buf = vec![0_u8; bsize];
    venti.read(score, typ, &mut buf)?;
    let mut n = 1_usize;
    if typ.is_pointer() {
        let child = typ.child().expect("pointer type");
        for i in 0..bsize / SCORE_SIZE {
            let s = Score::read(&buf, i * SCORE_SIZE)?;
            n += venti_walk(venti, s, child, bsize)?;
        }
    } else if typ.is_dir_tree() {
        for i in 0..bsize / ENTRY_SIZE {
            let Ok(e) = Entry::unpack(&buf, i) else {
                continue;
            };
            if !e.is_active() {
                continue;
            }
            n += venti_walk(venti, e.score, e.block_type(), bsize)?;
        }
    }
    Ok(n)
}
