//! The formatter.
//!
//! Lays a fresh image onto a byte device: header, zeroed labels, the root
//! meta block, the two-level root directory structure, and the first super
//! block, all at epoch 1. Ends by opening the result and creating the
//! conventional top-level directories.

use crate::{Fs, FsConfig, now_unix};
use fossil_device::{ByteDevice, Disk, Partition, write_header};
use fossil_error::{FossilError, Result};
use fossil_ondisk::meta::{DirEntry, MetaBlock, MetaEntry};
use fossil_ondisk::{ENTRY_ACTIVE, ENTRY_DIR, ENTRY_LOCAL, Entry, Label, LabelState, Score, Super};
use fossil_source::tag_gen;
use fossil_types::{
    BlockAddr, BlockSize, BlockType, ENTRY_SIZE, Epoch, MODE_DIR, SCORE_SIZE, SUPER_VERSION, Tag,
};
use fossil_venti::zero_score;
use std::sync::Arc;
use tracing::{debug, info};

/// Formatter options.
pub struct FormatOpts {
    pub block_size: BlockSize,
    /// Textual label stored in the super block.
    pub label: String,
}

impl Default for FormatOpts {
    fn default() -> Self {
        Self {
            block_size: BlockSize::new(8192).expect("8K is valid"),
            label: "vfs".to_owned(),
        }
    }
}

/// Sequential block allocator used only at format time; labels are written
/// straight through the disk, the cache does not exist yet.
struct Formatter {
    disk: Disk,
    bsize: usize,
    next: u32,
    qid: u64,
}

impl Formatter {
    fn block_alloc(&mut self, typ: BlockType, tag: Tag) -> Result<BlockAddr> {
        let addr = BlockAddr(self.next);
        self.next += 1;

        let lpb = self.disk.block_size().labels_per_block();
        let lblock = BlockAddr(addr.0 / lpb);
        let slot = (addr.0 % lpb) as usize;
        let mut buf = vec![0_u8; self.bsize];
        self.disk.read(Partition::Label, lblock, &mut buf)?;
        let old = Label::unpack(&buf, slot)?;
        if !old.is_free() {
            return Err(FossilError::Internal(format!(
                "format allocator hit a used block at {addr}"
            )));
        }
        let label = Label {
            typ,
            state: LabelState::ALLOC,
            epoch: Epoch::FIRST,
            epoch_close: Epoch::INFINITY,
            tag,
        };
        label.pack(&mut buf, slot);
        self.disk.write(Partition::Label, lblock, &buf)?;
        Ok(addr)
    }

    fn entry_init(&self) -> Entry {
        #[allow(clippy::cast_possible_truncation)] // block size <= 56 KiB
        Entry {
            gen: 0,
            psize: (self.bsize - self.bsize % SCORE_SIZE) as u16,
            dsize: self.bsize as u16,
            flags: ENTRY_ACTIVE,
            depth: 0,
            size: 0,
            score: zero_score(),
            tag: Tag::BAD,
            snap: Epoch::ZERO,
            archive: false,
        }
    }

    /// Build the meta block carrying the root directory's own entry.
    fn root_meta_init(&mut self) -> Result<Entry> {
        let now = now_unix();
        let de = DirEntry {
            elem: "root".to_owned(),
            entry: 0,
            gen: 0,
            mentry: 1,
            mgen: 0,
            qid: self.qid,
            uid: "adm".to_owned(),
            gid: "adm".to_owned(),
            mid: "adm".to_owned(),
            mtime: now,
            mcount: 0,
            ctime: now,
            atime: now,
            mode: MODE_DIR | 0o555,
            size: 0,
            qid_space: None,
        };
        self.qid += 1;

        let tag = tag_gen();
        let addr = self.block_alloc(BlockType::DATA, tag)?;

        let mut mb = MetaBlock::init(self.bsize, MetaBlock::maxindex_for(self.bsize));
        let n = de.packed_size();
        let o = mb.alloc(n).expect("fresh meta block has room");
        #[allow(clippy::cast_possible_truncation)]
        let me = MetaEntry {
            offset: o,
            size: n as u16,
        };
        mb.pack_dir_entry(&de, me);
        mb.insert(0, me);
        mb.pack();
        self.disk.write(Partition::Data, addr, mb.bytes())?;

        let mut e = self.entry_init();
        e.flags |= ENTRY_LOCAL;
        e.size = self.bsize as u64;
        e.tag = tag;
        e.score = Score::local(addr);
        Ok(e)
    }

    /// Build the top-level source block and the root block above it.
    fn root_init(&mut self, e_meta: Entry) -> Result<BlockAddr> {
        let tag = tag_gen();
        let addr = self.block_alloc(BlockType::DIR, tag)?;
        let mut buf = vec![0_u8; self.bsize];

        // slot 0: the root directory; slot 1: its meta stream; slot 2: the
        // stream holding the root's own entry
        let mut e = self.entry_init();
        e.flags |= ENTRY_DIR;
        e.pack(&mut buf, 0);
        let e = self.entry_init();
        e.pack(&mut buf, 1);
        e_meta.pack(&mut buf, 2);
        self.disk.write(Partition::Data, addr, &buf)?;

        let mut top = self.entry_init();
        top.flags |= ENTRY_LOCAL | ENTRY_DIR;
        top.size = 3 * ENTRY_SIZE as u64;
        top.tag = tag;
        top.score = Score::local(addr);

        let root = self.block_alloc(BlockType::DIR, Tag::ROOT)?;
        buf.fill(0);
        top.pack(&mut buf, 0);
        self.disk.write(Partition::Data, root, &buf)?;
        Ok(root)
    }

    fn super_init(&mut self, label: &str, root: BlockAddr) -> Result<()> {
        let sup = Super {
            version: SUPER_VERSION,
            epoch_low: Epoch::FIRST,
            epoch_high: Epoch::FIRST,
            qid: self.qid,
            active: root,
            next: BlockAddr::NIL,
            current: BlockAddr::NIL,
            last: zero_score(),
            name: label.to_owned(),
        };
        let mut buf = vec![0_u8; self.bsize];
        sup.pack(&mut buf);
        self.disk.write(Partition::Super, BlockAddr(0), &buf)
    }
}

/// The entry that links a superseded root from slot 1 of its successor.
#[must_use]
pub fn prev_root_entry(bsize: usize, prev: BlockAddr) -> Entry {
    #[allow(clippy::cast_possible_truncation)] // block size <= 56 KiB
    Entry {
        gen: 0,
        psize: (bsize - bsize % SCORE_SIZE) as u16,
        dsize: bsize as u16,
        flags: ENTRY_ACTIVE | ENTRY_LOCAL | ENTRY_DIR,
        depth: 0,
        size: 0,
        score: Score::local(prev),
        tag: Tag::ROOT,
        snap: Epoch::ZERO,
        archive: false,
    }
}

/// Format a device and create `/active`, `/archive`, and `/snapshot`.
pub fn format(dev: Arc<dyn ByteDevice>, opts: &FormatOpts) -> Result<()> {
    if opts.label.len() >= 128 {
        return Err(FossilError::BadPath);
    }
    let header = fossil_device::partition(dev.len_bytes(), opts.block_size)?;
    write_header(dev.as_ref(), &header)?;
    let disk = Disk::with_header(Arc::clone(&dev), header)?;
    let bsize = opts.block_size.bytes();

    debug!(target: "fossil::format", "zeroing labels");
    let zero = vec![0_u8; bsize];
    for bn in 0..disk.size(Partition::Label) {
        disk.write(Partition::Label, BlockAddr(bn), &zero)?;
    }

    let mut fmt = Formatter {
        disk,
        bsize,
        next: 0,
        qid: 1,
    };
    let e_meta = fmt.root_meta_init()?;
    let root = fmt.root_init(e_meta)?;
    fmt.super_init(&opts.label, root)?;
    fmt.disk.sync()?;
    info!(
        target: "fossil::format",
        block_size = bsize,
        root = %root,
        "formatted"
    );

    // reopen through the stack for the conventional top level
    let disk = Arc::new(Disk::open(dev)?);
    let fs = Fs::open(disk, None, FsConfig::default())?;
    {
        let _elk = fs.rlock();
        let rootf = fs.root()?;
        for name in ["active", "archive", "snapshot"] {
            rootf.create(name, MODE_DIR | 0o555, "adm")?;
        }
    }
    fs.close()?;
    Ok(())
}
