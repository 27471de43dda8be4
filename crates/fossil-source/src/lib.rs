#![forbid(unsafe_code)]
//! Sources: mutable handles over directory-block entries.
//!
//! An [`Entry`] addresses a byte-indexed stream through a balanced tree of
//! pointer blocks. A [`Source`] is the live handle over one entry slot:
//! it walks the tree, copies blocks forward on write when their epoch lags,
//! grows the tree when the stream outgrows its height, and closes every
//! reachable label when the stream is truncated or removed.
//!
//! Sources carry no mutable in-memory state of their own; everything lives
//! in cache blocks. The locks here only order multi-block operations.
//! Callers lock a source before operating on it, exactly one level below
//! the file-layer locks.

use fossil_cache::{Block, Cache};
use fossil_error::{FossilError, Result};
use fossil_ondisk::{ENTRY_ACTIVE, ENTRY_DIR, ENTRY_LOCAL, Entry, Label, LabelState, Score};
use fossil_types::{BlockAddr, BlockType, ENTRY_SIZE, Epoch, MAX_FILE_SIZE, Mode, SCORE_SIZE, Tag};
use fossil_venti::zero_score;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The live epoch window, shared by the file system, its sources, and the
/// snapshot machinery. Readers see a consistent `(low, high)` pair.
#[derive(Debug)]
pub struct EpochWindow {
    win: RwLock<(Epoch, Epoch)>,
}

impl EpochWindow {
    #[must_use]
    pub fn new(low: Epoch, high: Epoch) -> Self {
        Self {
            win: RwLock::new((low, high)),
        }
    }

    #[must_use]
    pub fn window(&self) -> (Epoch, Epoch) {
        *self.win.read()
    }

    #[must_use]
    pub fn low(&self) -> Epoch {
        self.win.read().0
    }

    #[must_use]
    pub fn high(&self) -> Epoch {
        self.win.read().1
    }

    pub fn set_high(&self, high: Epoch) {
        self.win.write().1 = high;
    }

    pub fn set_low(&self, low: Epoch) {
        self.win.write().0 = low;
    }
}

/// Generate a fresh source tag, uniformly above the reserved namespace.
#[must_use]
pub fn tag_gen() -> Tag {
    let mut rng = rand::thread_rng();
    loop {
        let t: u32 = rng.gen();
        if Tag(t).is_user() {
            return Tag(t);
        }
    }
}

/// Whether a score slot points at nothing yet.
#[must_use]
pub fn score_is_hole(score: Score) -> bool {
    score == zero_score() || score.to_local() == Some(BlockAddr::NIL)
}

/// Guard over one locked source.
pub struct SourceGuard<'a> {
    _g: MutexGuard<'a, ()>,
}

/// Shared, movable anchor for the root source.
///
/// The epoch advance publishes a new root block; updating the anchor
/// retargets the whole open source tree without reopening any handle.
#[derive(Debug)]
pub struct RootAnchor {
    addr: RwLock<BlockAddr>,
}

impl RootAnchor {
    #[must_use]
    pub fn new(addr: BlockAddr) -> Arc<Self> {
        Arc::new(Self {
            addr: RwLock::new(addr),
        })
    }

    #[must_use]
    pub fn get(&self) -> BlockAddr {
        *self.addr.read()
    }

    pub fn set(&self, addr: BlockAddr) {
        *self.addr.write() = addr;
    }
}

/// Mutable handle over one entry.
pub struct Source {
    cache: Arc<Cache>,
    epochs: Arc<EpochWindow>,
    pub mode: Mode,
    pub issnapshot: bool,
    /// Directory source holding this source's entry; `None` for the root.
    parent: Option<Arc<Source>>,
    /// Root-block anchor, for the root source only.
    anchor: Option<Arc<RootAnchor>>,
    /// Slot offset of the entry within the parent.
    pub offset: u32,
    /// Generation at open; disagreement with the on-disk entry means the
    /// source was removed out from under this handle.
    pub gen: u32,
    pub dir: bool,
    /// Data block size of this stream.
    pub dsize: u32,
    pub tag: Tag,
    lk: Mutex<()>,
}

impl Source {
    /// Open the root source from the active root block.
    ///
    /// The root block must be a dir block tagged [`Tag::ROOT`]; in write
    /// mode it must already live at the current high epoch, which the epoch
    /// advance guarantees.
    pub fn root(
        cache: Arc<Cache>,
        epochs: Arc<EpochWindow>,
        anchor: Arc<RootAnchor>,
        mode: Mode,
    ) -> Result<Arc<Self>> {
        let (_, ehi) = epochs.window();
        let addr = anchor.get();
        let b = cache.local_data(addr, BlockType::DIR, Tag::ROOT, None, Mode::ReadOnly)?;
        if mode.is_write() && b.label().epoch != ehi {
            warn!(target: "fossil::source", %addr, epoch = %b.label().epoch, %ehi, "root epoch lags");
            return Err(FossilError::Corrupt {
                kind: "root epoch",
                addr,
            });
        }
        let e = b.read(|data| Entry::unpack(data, 0))?;
        if !e.is_active() {
            return Err(FossilError::Corrupt {
                kind: "root entry",
                addr,
            });
        }
        Ok(Arc::new(Self {
            cache,
            epochs,
            mode,
            issnapshot: false,
            parent: None,
            anchor: Some(anchor),
            offset: 0,
            gen: e.gen,
            dir: e.is_dir(),
            dsize: u32::from(e.dsize),
            tag: e.tag,
            lk: Mutex::new(()),
        }))
    }

    /// Open the source at slot `offset` of this directory source.
    pub fn open(
        self: &Arc<Self>,
        offset: u32,
        mode: Mode,
        issnapshot: bool,
    ) -> Result<Arc<Self>> {
        if !self.dir {
            return Err(FossilError::NotDir);
        }
        let (b, idx) = self.slot_block(offset, Mode::ReadOnly)?;
        let e = b.read(|data| Entry::unpack(data, idx))?;
        drop(b);
        if !e.is_active() {
            return Err(FossilError::NoFile);
        }
        trace!(target: "fossil::source", offset, tag = %e.tag, dir = e.is_dir(), "open source");
        Ok(Arc::new(Self {
            cache: Arc::clone(&self.cache),
            epochs: Arc::clone(&self.epochs),
            mode,
            issnapshot,
            parent: Some(Arc::clone(self)),
            anchor: None,
            offset,
            gen: e.gen,
            dir: e.is_dir(),
            dsize: u32::from(e.dsize),
            tag: e.tag,
            lk: Mutex::new(()),
        }))
    }

    // ── Locking ─────────────────────────────────────────────────────────

    /// Lock this source for a multi-block operation.
    pub fn lock(&self) -> SourceGuard<'_> {
        SourceGuard { _g: self.lk.lock() }
    }

    /// Lock a source pair in canonical order so two threads locking the
    /// same pair never deadlock.
    pub fn lock2<'a>(a: &'a Source, b: &'a Source) -> (SourceGuard<'a>, SourceGuard<'a>) {
        // order by (parent slot, identity); a source and its meta twin
        // always have distinct slots
        if (a.offset, std::ptr::from_ref(a) as usize) <= (b.offset, std::ptr::from_ref(b) as usize)
        {
            let ga = a.lock();
            let gb = b.lock();
            (ga, gb)
        } else {
            let gb = b.lock();
            let ga = a.lock();
            (ga, gb)
        }
    }

    // ── Entry access ────────────────────────────────────────────────────

    /// Entries per block of the parent's directory stream.
    fn parent_epb(&self) -> u32 {
        match &self.parent {
            Some(p) => p.dsize / ENTRY_SIZE as u32,
            None => 1,
        }
    }

    /// Pin the dir block holding slot `offset` of *this* source's stream.
    fn slot_block(&self, offset: u32, mode: Mode) -> Result<(Block, usize)> {
        let epb = self.dsize / ENTRY_SIZE as u32;
        let bn = offset / epb;
        let idx = (offset % epb) as usize;
        let b = self
            .block(bn, mode)?
            .ok_or(FossilError::BadOffset)?;
        Ok((b, idx))
    }

    /// Pin the block holding this source's own entry.
    fn entry_block(&self, mode: Mode) -> Result<(Block, usize)> {
        match (&self.parent, &self.anchor) {
            (Some(p), _) => {
                let epb = self.parent_epb();
                let bn = self.offset / epb;
                let idx = (self.offset % epb) as usize;
                let b = p
                    .block(bn, mode)?
                    .ok_or(FossilError::Removed)?;
                Ok((b, idx))
            }
            (None, Some(anchor)) => {
                let b = self
                    .cache
                    .local_data(anchor.get(), BlockType::DIR, Tag::ROOT, None, mode)?;
                Ok((b, self.offset as usize))
            }
            (None, None) => Err(FossilError::Internal("source without anchor".to_owned())),
        }
    }

    /// Materialize this source's entry block on the write path, copying the
    /// chain into the current epoch. The snapshot freeze uses this so the
    /// entries it records sit in the new epoch's tree.
    pub fn walk_entry(&self) -> Result<()> {
        let _ = self.entry_block(Mode::ReadWrite)?;
        Ok(())
    }

    /// Read this source's entry, verifying it is still the one this handle
    /// was opened against.
    pub fn get_entry(&self) -> Result<Entry> {
        let (b, idx) = self.entry_block(Mode::ReadOnly)?;
        let e = b.read(|data| Entry::unpack(data, idx))?;
        if !e.is_active() || e.gen != self.gen {
            return Err(FossilError::Removed);
        }
        Ok(e)
    }

    /// Rewrite this source's entry, preserving the generation counter.
    pub fn set_entry(&self, e: &Entry) -> Result<()> {
        if !self.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        let (b, idx) = self.entry_block(Mode::ReadWrite)?;
        let old = b.read(|data| Entry::unpack(data, idx))?;
        if !old.is_active() || old.gen != self.gen {
            return Err(FossilError::Removed);
        }
        let mut e = *e;
        e.gen = old.gen;
        b.write(|data| e.pack(data, idx));
        self.cache.dirty(&b)?;
        Ok(())
    }

    // ── Tree walk ───────────────────────────────────────────────────────

    /// Pointer fan-out of this stream.
    fn ppb(&self, e: &Entry) -> u64 {
        u64::from(e.psize) / SCORE_SIZE as u64
    }

    /// Smallest tree height that reaches leaf block `bn`.
    fn depth_for(&self, e: &Entry, bn: u32) -> u8 {
        let ppb = self.ppb(e);
        let mut depth = 0_u8;
        let mut cap = 1_u64;
        while u64::from(bn) >= cap {
            cap = cap.saturating_mul(ppb);
            depth += 1;
        }
        depth
    }

    /// Pin leaf block `bn` of the stream.
    ///
    /// Read mode returns `None` for holes. Write mode materializes the whole
    /// path, copying lagging blocks into the current epoch and recording a
    /// dependency edge from each rewritten parent to its new child.
    pub fn block(&self, bn: u32, mode: Mode) -> Result<Option<Block>> {
        if mode.is_write() && !self.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        let (elo, ehi) = self.epochs.window();
        let mut e = self.get_entry()?;

        let need = self.depth_for(&e, bn);
        if need > e.depth {
            if !mode.is_write() {
                return Ok(None);
            }
            self.grow_depth(need)?;
            e = self.get_entry()?;
        }

        let ppb = self.ppb(&e);

        // the entry slot acts as the topmost pointer slot
        let (mut pb, mut slot) = self.entry_block(mode)?;
        let mut slot_is_entry = true;
        let mut score = e.score;
        let mut typ = e.block_type();
        // a never-written entry has no stored tag yet; mint one for the
        // blocks this walk allocates and pin it into the entry below
        let tag = if e.tag == Tag::BAD { tag_gen() } else { e.tag };

        for level in (0..=e.depth).rev() {
            let cur = if score_is_hole(score) {
                if !mode.is_write() {
                    return Ok(None);
                }
                let nb = self.cache.alloc_block(typ, tag, ehi, elo)?;
                self.store_slot(&pb, slot, slot_is_entry, Score::local(nb.addr()), tag)?;
                self.cache.dependency(&pb, &nb, Some(slot), Some(score));
                nb
            } else {
                let b = self.cache.global(
                    score,
                    typ,
                    tag,
                    if mode.is_write() { Mode::ReadOnly } else { mode },
                )?;
                if mode.is_write() && (b.addr().is_nil() || b.label().epoch < ehi) {
                    let nb = self.cache.block_copy(&b, tag, ehi, elo)?;
                    self.store_slot(&pb, slot, slot_is_entry, Score::local(nb.addr()), tag)?;
                    self.cache.dependency(&pb, &nb, Some(slot), Some(score));
                    nb
                } else if mode.is_write() {
                    // re-pin writable now that the epoch checks out
                    drop(b);
                    let addr = score.to_local().expect("current-epoch block is local");
                    self.cache.local_data(addr, typ, tag, None, Mode::ReadWrite)?
                } else {
                    b
                }
            };

            if level == 0 {
                return Ok(Some(cur));
            }

            // descend one pointer level
            let stride = ppb.pow(u32::from(level) - 1);
            let idx = ((u64::from(bn) / stride) % ppb) as usize;
            score = cur.read(|data| Score::read(data, idx * SCORE_SIZE))?;
            typ = typ.child().expect("pointer levels remain");
            pb = cur;
            slot = idx;
            slot_is_entry = false;
        }
        unreachable!("loop returns at level 0");
    }

    /// Write a new child score into a pointer slot or into the entry.
    fn store_slot(
        &self,
        pb: &Block,
        slot: usize,
        slot_is_entry: bool,
        new_score: Score,
        tag: Tag,
    ) -> Result<()> {
        if slot_is_entry {
            let mut e = pb.read(|data| Entry::unpack(data, slot))?;
            e.score = new_score;
            e.flags |= ENTRY_LOCAL;
            if e.tag == Tag::BAD {
                e.tag = tag;
            }
            b_pack_entry(pb, slot, &e);
        } else {
            pb.write(|data| new_score.put(data, slot * SCORE_SIZE));
        }
        self.cache.dirty(pb)
    }

    /// Raise the tree height to `need` levels.
    fn grow_depth(&self, need: u8) -> Result<()> {
        let (elo, ehi) = self.epochs.window();
        let (eb, idx) = self.entry_block(Mode::ReadWrite)?;
        let mut e = eb.read(|data| Entry::unpack(data, idx))?;
        if !e.is_active() || e.gen != self.gen {
            return Err(FossilError::Removed);
        }
        let leaf = if e.is_dir() {
            BlockType::DIR
        } else {
            BlockType::DATA
        };
        if e.tag == Tag::BAD {
            e.tag = tag_gen();
        }
        while e.depth < need {
            let nb = self
                .cache
                .alloc_block(BlockType::pointer(leaf, e.depth + 1), e.tag, ehi, elo)?;
            if !score_is_hole(e.score) {
                nb.write(|data| e.score.put(data, 0));
            }
            self.cache.dirty(&nb)?;
            let old = e.score;
            e.depth += 1;
            e.score = Score::local(nb.addr());
            e.flags |= ENTRY_LOCAL;
            b_pack_entry(&eb, idx, &e);
            self.cache.dependency(&eb, &nb, Some(idx), Some(old));
            self.cache.dirty(&eb)?;
            trace!(target: "fossil::source", depth = e.depth, "grew tree");
        }
        Ok(())
    }

    // ── Sizes ───────────────────────────────────────────────────────────

    #[must_use = "sizes feed offset math"]
    pub fn get_size(&self) -> Result<u64> {
        Ok(self.get_entry()?.size)
    }

    /// Number of leaf blocks currently addressed by `size`.
    fn nblocks(&self, size: u64) -> u32 {
        let d = u64::from(self.dsize);
        u32::try_from(size.div_ceil(d)).unwrap_or(u32::MAX)
    }

    /// Number of entry slots a directory stream of `size` bytes holds.
    pub fn dir_size(&self) -> Result<u32> {
        let size = self.get_size()?;
        let epb = u64::from(self.dsize) / ENTRY_SIZE as u64;
        let full = (size / u64::from(self.dsize)) * epb;
        let partial = (size % u64::from(self.dsize)) / ENTRY_SIZE as u64;
        Ok(u32::try_from(full + partial).unwrap_or(u32::MAX))
    }

    /// Grow or shrink the stream. Shrinking frees the tail blocks.
    pub fn set_size(&self, size: u64) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(FossilError::BadOffset);
        }
        let mut e = self.get_entry()?;
        if size == e.size {
            return Ok(());
        }
        if size < e.size {
            self.free_tail(&e, size)?;
            e = self.get_entry()?;
        }
        e.size = size;
        self.set_entry(&e)
    }

    /// Truncate to zero, freeing the whole tree but keeping the entry.
    pub fn truncate(&self) -> Result<()> {
        let (_, ehi) = self.epochs.window();
        let mut e = self.get_entry()?;
        if !score_is_hole(e.score) {
            self.free_tree(e.score, e.block_type(), ehi)?;
        }
        e.score = Score::local(BlockAddr::NIL);
        e.depth = 0;
        e.size = 0;
        self.set_entry(&e)?;
        debug!(target: "fossil::source", offset = self.offset, "truncated");
        Ok(())
    }

    /// Unlink the stream: close every reachable block and deactivate the
    /// entry, bumping its generation so stale handles notice.
    pub fn remove(&self) -> Result<()> {
        let (_, ehi) = self.epochs.window();
        let e = self.get_entry()?;
        if !score_is_hole(e.score) {
            self.free_tree(e.score, e.block_type(), ehi)?;
        }
        let (b, idx) = self.entry_block(Mode::ReadWrite)?;
        let mut dead = e;
        dead.flags = 0;
        dead.gen = e.gen.wrapping_add(1);
        dead.size = 0;
        dead.depth = 0;
        dead.tag = Tag::BAD;
        dead.score = Score::local(BlockAddr::NIL);
        b.write(|data| dead.pack(data, idx));
        self.cache.dirty(&b)?;
        debug!(target: "fossil::source", offset = self.offset, "removed");
        Ok(())
    }

    /// Free the tail of the stream down to `new_size` bytes, leaf by leaf
    /// through the write walk so shared blocks are never mutated in place.
    fn free_tail(&self, e: &Entry, new_size: u64) -> Result<()> {
        let (_, ehi) = self.epochs.window();
        let keep = self.nblocks(new_size);
        let old = self.nblocks(e.size);
        for bn in keep..old {
            let cur = self.get_entry()?;
            if cur.depth == 0 {
                // single-block stream; only bn 0 can exist
                if bn == 0 && !score_is_hole(cur.score) {
                    self.free_tree(cur.score, cur.block_type(), ehi)?;
                    let mut z = cur;
                    z.score = Score::local(BlockAddr::NIL);
                    self.set_entry(&z)?;
                }
                continue;
            }
            self.free_leaf(bn, ehi)?;
        }
        Ok(())
    }

    /// Drop leaf `bn`: zero its pointer slot and close the block.
    fn free_leaf(&self, bn: u32, ehi: Epoch) -> Result<()> {
        let e = self.get_entry()?;
        let ppb = self.ppb(&e);
        if self.depth_for(&e, bn) > e.depth {
            return Ok(());
        }
        // pin the level-1 pointer block on the write path
        let parent = match self.pointer_block_for(bn, &e)? {
            Some(b) => b,
            None => return Ok(()),
        };
        let idx = (u64::from(bn) % ppb) as usize;
        let score = parent.read(|data| Score::read(data, idx * SCORE_SIZE))?;
        if score_is_hole(score) {
            return Ok(());
        }
        let leaf = if self.dir {
            BlockType::DIR
        } else {
            BlockType::DATA
        };
        self.free_tree(score, leaf, ehi)?;
        parent.write(|data| Score::local(BlockAddr::NIL).put(data, idx * SCORE_SIZE));
        self.cache.dirty(&parent)?;
        Ok(())
    }

    /// Writable level-1 pointer block above leaf `bn`, or `None` when the
    /// path is all holes.
    fn pointer_block_for(&self, bn: u32, e: &Entry) -> Result<Option<Block>> {
        debug_assert!(e.depth >= 1);
        let ppb = self.ppb(e);
        let (elo, ehi) = self.epochs.window();
        let (mut pb, mut slot) = self.entry_block(Mode::ReadWrite)?;
        let mut slot_is_entry = true;
        let mut score = e.score;
        let mut typ = e.block_type();
        for level in (1..=e.depth).rev() {
            if score_is_hole(score) {
                return Ok(None);
            }
            let b = self.cache.global(score, typ, e.tag, Mode::ReadOnly)?;
            let cur = if b.addr().is_nil() || b.label().epoch < ehi {
                let nb = self.cache.block_copy(&b, e.tag, ehi, elo)?;
                self.store_slot(&pb, slot, slot_is_entry, Score::local(nb.addr()), e.tag)?;
                self.cache.dependency(&pb, &nb, Some(slot), Some(score));
                nb
            } else {
                drop(b);
                let addr = score.to_local().expect("current-epoch block is local");
                self.cache.local_data(addr, typ, e.tag, None, Mode::ReadWrite)?
            };
            if level == 1 {
                return Ok(Some(cur));
            }
            let stride = ppb.pow(u32::from(level) - 1);
            let idx = ((u64::from(bn) / stride) % ppb) as usize;
            score = cur.read(|data| Score::read(data, idx * SCORE_SIZE))?;
            typ = typ.child().expect("pointer levels remain");
            pb = cur;
            slot = idx;
            slot_is_entry = false;
        }
        unreachable!("loop returns at level 1");
    }

    /// Close every local block reachable from `score`.
    ///
    /// Blocks born in the current epoch that were never copied can go
    /// straight back to free; anything older closes at `ehi` and becomes
    /// reclaimable once the low epoch passes it.
    fn free_tree(&self, score: Score, typ: BlockType, ehi: Epoch) -> Result<()> {
        let Some(addr) = score.to_local() else {
            return Ok(()); // archive-tier blocks are permanent
        };
        if addr.is_nil() {
            return Ok(());
        }
        let b = self
            .cache
            .local(fossil_device::Partition::Data, addr, Mode::ReadOnly)?;
        if typ.is_pointer() {
            let child = typ.child().expect("pointer has children");
            let scores: Vec<Score> = b.read(|data| {
                (0..data.len() / SCORE_SIZE)
                    .map(|i| Score::read(data, i * SCORE_SIZE).expect("in bounds"))
                    .collect()
            });
            for s in scores {
                if !score_is_hole(s) {
                    self.free_tree(s, child, ehi)?;
                }
            }
        }
        let l = b.label();
        let closed = if l.epoch == ehi && !l.state.contains(LabelState::COPIED) {
            Label::free()
        } else {
            Label {
                state: l.state.with(LabelState::CLOSED),
                epoch_close: ehi,
                ..l
            }
        };
        self.cache.set_label(&b, closed)?;
        trace!(target: "fossil::source", %addr, label = %closed, "closed");
        Ok(())
    }

    // ── Slot management for directory sources ───────────────────────────

    /// Allocate a child source in this directory source.
    ///
    /// Scans for an inactive slot from `offset_hint`, growing the stream by
    /// one block when every slot is live. The new entry gets a fresh tag and
    /// the old slot's generation plus one, so removed-slot reuse is
    /// detectable.
    pub fn create(
        self: &Arc<Self>,
        dsize: u32,
        dir: bool,
        offset_hint: u32,
    ) -> Result<Arc<Source>> {
        if !self.dir {
            return Err(FossilError::NotDir);
        }
        if !self.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        let epb = self.dsize / ENTRY_SIZE as u32;
        let nslots = self.dir_size()?;

        let mut slot = None;
        for offset in offset_hint..nslots {
            let (b, idx) = self.slot_block(offset, Mode::ReadOnly)?;
            let e = b.read(|data| Entry::unpack(data, idx));
            match e {
                Ok(e) if !e.is_active() => {
                    slot = Some((offset, e.gen));
                    break;
                }
                Ok(_) => {}
                Err(_) => {
                    // unreadable slot; skip it rather than clobber
                    warn!(target: "fossil::source", offset, "skipping unreadable entry slot");
                }
            }
        }

        let (offset, old_gen) = match slot {
            Some(s) => s,
            None => {
                // extend the directory by one block of fresh slots
                let bn = nslots / epb;
                let b = self
                    .block(bn, Mode::ReadWrite)?
                    .ok_or_else(|| FossilError::Internal("write walk returned hole".into()))?;
                drop(b);
                let e = self.get_entry()?;
                let new_size = (u64::from(bn) + 1) * u64::from(self.dsize);
                if new_size > e.size {
                    let mut grown = e;
                    grown.size = new_size;
                    self.set_entry(&grown)?;
                }
                (nslots, 0)
            }
        };

        let mut psize = self.cache.block_size() as u32;
        psize -= psize % SCORE_SIZE as u32;
        let entry = Entry {
            gen: old_gen.wrapping_add(1),
            psize: u16::try_from(psize).map_err(|_| FossilError::BadMeta)?,
            dsize: u16::try_from(dsize).map_err(|_| FossilError::BadMeta)?,
            flags: ENTRY_ACTIVE | ENTRY_LOCAL | if dir { ENTRY_DIR } else { 0 },
            depth: 0,
            size: 0,
            score: Score::local(BlockAddr::NIL),
            tag: tag_gen(),
            snap: Epoch::ZERO,
            archive: false,
        };
        let (b, idx) = self.slot_block(offset, Mode::ReadWrite)?;
        b.write(|data| entry.pack(data, idx));
        self.cache.dirty(&b)?;
        drop(b);
        debug!(target: "fossil::source", offset, tag = %entry.tag, dir, "created source");

        self.open(offset, self.mode, false)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn epochs(&self) -> &Arc<EpochWindow> {
        &self.epochs
    }
}

/// Pack an entry into a pinned dir block.
fn b_pack_entry(b: &Block, idx: usize, e: &Entry) {
    b.write(|data| e.pack(data, idx));
}

#[cfg(test)]
mod tests {
    use super::*;
    use fossil_cache::CacheConfig;
    use fossil_device::{ByteDevice, Disk, MemByteDevice, partition, write_header};
    use fossil_types::BlockSize;

    const BS: u32 = 1024;

    /// Minimal bootstrap: a root block holding one dir entry, the way the
    /// formatter lays it out.
    fn scaffold() -> (Arc<Cache>, Arc<EpochWindow>, Arc<Source>) {
        let block_size = BlockSize::new(BS).unwrap();
        let dev = Arc::new(MemByteDevice::new(32 * 1024 * 1024));
        let header = partition(dev.len_bytes(), block_size).unwrap();
        write_header(dev.as_ref(), &header).unwrap();
        let disk = Arc::new(Disk::open(dev).unwrap());
        let cache = Arc::new(Cache::new(disk, None, CacheConfig::default()));
        let epochs = Arc::new(EpochWindow::new(Epoch(1), Epoch(1)));

        // top dir block holding the tree of sources
        let top = cache
            .alloc_block(BlockType::DIR, tag_gen(), Epoch(1), Epoch(1))
            .unwrap();
        let tag = top.label().tag;
        let mut psize = BS;
        psize -= psize % SCORE_SIZE as u32;
        let e = Entry {
            gen: 1,
            psize: psize as u16,
            dsize: BS as u16,
            flags: ENTRY_ACTIVE | ENTRY_LOCAL | ENTRY_DIR,
            depth: 0,
            size: u64::from(BS),
            score: Score::local(top.addr()),
            tag,
            snap: Epoch::ZERO,
            archive: false,
        };

        // root block: entry 0 is the whole tree
        let root = cache
            .alloc_block(BlockType::DIR, Tag::ROOT, Epoch(1), Epoch(1))
            .unwrap();
        root.write(|data| e.pack(data, 0));
        cache.dirty(&root).unwrap();
        cache.sync().unwrap();

        let src = Source::root(
            Arc::clone(&cache),
            Arc::clone(&epochs),
            RootAnchor::new(root.addr()),
            Mode::ReadWrite,
        )
        .unwrap();
        (cache, epochs, src)
    }

    #[test]
    fn root_source_opens() {
        let (_c, _e, src) = scaffold();
        assert!(src.dir);
        assert_eq!(src.dsize, BS);
        assert_eq!(src.get_size().unwrap(), u64::from(BS));
    }

    #[test]
    fn create_and_reopen_child() {
        let (_c, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        assert!(!child.dir);
        assert_eq!(child.get_size().unwrap(), 0);
        assert!(child.tag.is_user());

        let again = root.open(child.offset, Mode::ReadOnly, false).unwrap();
        assert_eq!(again.gen, child.gen);
        assert_eq!(again.tag, child.tag);
    }

    #[test]
    fn write_then_read_single_block() {
        let (cache, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        let b = child.block(0, Mode::ReadWrite).unwrap().unwrap();
        b.write(|data| data[..5].copy_from_slice(b"hello"));
        cache.dirty(&b).unwrap();
        child.set_size(5).unwrap();
        cache.sync().unwrap();

        let rb = child.block(0, Mode::ReadOnly).unwrap().unwrap();
        rb.read(|data| assert_eq!(&data[..5], b"hello"));
        assert_eq!(child.get_size().unwrap(), 5);
    }

    #[test]
    fn holes_read_as_none() {
        let (_c, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        child.set_size(10 * u64::from(BS)).unwrap();
        assert!(child.block(3, Mode::ReadOnly).unwrap().is_none());
    }

    #[test]
    fn tree_grows_across_pointer_levels() {
        let (cache, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        // BS=1024 -> ppb=51; block 60 needs depth 2
        let bn = 60_u32;
        let b = child.block(bn, Mode::ReadWrite).unwrap().unwrap();
        b.write(|data| data[0] = 0x77);
        cache.dirty(&b).unwrap();
        child
            .set_size(u64::from(bn + 1) * u64::from(BS))
            .unwrap();
        cache.sync().unwrap();

        let e = child.get_entry().unwrap();
        assert_eq!(e.depth, 2);
        let back = child.block(bn, Mode::ReadOnly).unwrap().unwrap();
        back.read(|data| assert_eq!(data[0], 0x77));
        // untouched shallow block is still a hole
        assert!(child.block(1, Mode::ReadOnly).unwrap().is_none());
    }

    #[test]
    fn truncate_frees_blocks() {
        let (cache, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        let mut addrs = Vec::new();
        for bn in 0..4 {
            let b = child.block(bn, Mode::ReadWrite).unwrap().unwrap();
            addrs.push(b.addr());
            cache.dirty(&b).unwrap();
        }
        child.set_size(4 * u64::from(BS)).unwrap();
        cache.sync().unwrap();

        child.truncate().unwrap();
        cache.sync().unwrap();
        assert_eq!(child.get_size().unwrap(), 0);
        // blocks born and killed in the same epoch go straight to free
        for addr in addrs {
            assert!(cache.read_label(addr).unwrap().is_free(), "{addr}");
        }
    }

    #[test]
    fn shrink_frees_tail_only() {
        let (cache, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        let mut addrs = Vec::new();
        for bn in 0..3 {
            let b = child.block(bn, Mode::ReadWrite).unwrap().unwrap();
            b.write(|data| data[0] = bn as u8 + 1);
            addrs.push(b.addr());
            cache.dirty(&b).unwrap();
        }
        child.set_size(3 * u64::from(BS)).unwrap();
        cache.sync().unwrap();

        child.set_size(u64::from(BS)).unwrap();
        cache.sync().unwrap();
        assert!(!cache.read_label(addrs[0]).unwrap().is_free());
        assert!(cache.read_label(addrs[1]).unwrap().is_free());
        assert!(cache.read_label(addrs[2]).unwrap().is_free());
        let keep = child.block(0, Mode::ReadOnly).unwrap().unwrap();
        keep.read(|data| assert_eq!(data[0], 1));
    }

    #[test]
    fn remove_deactivates_entry_and_bumps_gen() {
        let (cache, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        let offset = child.offset;
        let gen = child.gen;
        let b = child.block(0, Mode::ReadWrite).unwrap().unwrap();
        let data_addr = b.addr();
        cache.dirty(&b).unwrap();
        drop(b);
        child.set_size(u64::from(BS)).unwrap();

        let stale = root.open(offset, Mode::ReadOnly, false).unwrap();
        child.remove().unwrap();
        cache.sync().unwrap();

        assert!(matches!(root.open(offset, Mode::ReadOnly, false), Err(FossilError::NoFile)));
        assert!(matches!(stale.get_entry(), Err(FossilError::Removed)));
        assert!(cache.read_label(data_addr).unwrap().is_free());

        // the freed slot comes back with a higher generation
        let reborn = root.create(BS, false, 0).unwrap();
        assert_eq!(reborn.offset, offset);
        assert_eq!(reborn.gen, gen.wrapping_add(1).wrapping_add(1));
    }

    #[test]
    fn cow_on_epoch_advance() {
        let (cache, epochs, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        let b = child.block(0, Mode::ReadWrite).unwrap().unwrap();
        b.write(|data| data[0] = 1);
        cache.dirty(&b).unwrap();
        let old_addr = b.addr();
        drop(b);
        child.set_size(u64::from(BS)).unwrap();
        cache.sync().unwrap();

        // advance the epoch; the next write must fork the block
        epochs.set_high(Epoch(2));
        let b2 = child.block(0, Mode::ReadWrite).unwrap().unwrap();
        assert_ne!(b2.addr(), old_addr);
        assert_eq!(b2.label().epoch, Epoch(2));
        b2.read(|data| assert_eq!(data[0], 1, "copy carries contents"));
        // old block is marked copied
        assert!(cache
            .read_label(old_addr)
            .unwrap()
            .state
            .contains(LabelState::COPIED));
    }

    #[test]
    fn read_mode_never_allocates() {
        let (cache, _e, root) = scaffold();
        let child = root.create(BS, false, 0).unwrap();
        cache.sync().unwrap();
        let (used_before, _) = cache.count_used(Epoch(1)).unwrap();
        assert!(child.block(5, Mode::ReadOnly).unwrap().is_none());
        let (used_after, _) = cache.count_used(Epoch(1)).unwrap();
        assert_eq!(used_before, used_after);
    }

    #[test]
    fn lock2_is_order_insensitive() {
        let (_c, _e, root) = scaffold();
        let a = root.create(BS, false, 0).unwrap();
        let b = root.create(BS, false, 0).unwrap();
        {
            let (_ga, _gb) = Source::lock2(&a, &b);
        }
        {
            let (_gb, _ga) = Source::lock2(&b, &a);
        }
    }

    #[test]
    fn directory_grows_slots_when_full() {
        let (_c, _e, root) = scaffold();
        let epb = BS / ENTRY_SIZE as u32;
        // the scaffold's top block starts with epb slots; fill them and one more
        let mut children = Vec::new();
        for _ in 0..=epb {
            children.push(root.create(BS, false, 0).unwrap());
        }
        assert_eq!(children.len() as u32, epb + 1);
        assert!(root.get_size().unwrap() >= 2 * u64::from(BS));
        // all offsets distinct
        let mut offsets: Vec<u32> = children.iter().map(|c| c.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len() as u32, epb + 1);
    }
}
