//! Files and directories.
//!
//! A [`File`] is the in-memory node for one directory entry: it pairs a data
//! source with, for directories, the meta source that stores the children's
//! entries. Parents keep weak links to their children; children keep their
//! parent alive. Metadata changes are buffered on the node (`dirty`) and
//! written back by [`File::meta_flush`], which repacks the entry into its
//! meta block or migrates it to another block when it no longer fits.
//!
//! Locking order is downward: a thread may hold a file's lock and then take
//! locks of its sources, never the reverse.

use crate::{FsShared, now_unix};
use fossil_cache::Block;
use fossil_error::{FossilError, Result};
use fossil_ondisk::meta::{DirEntry, MetaBlock, MetaEntry};
use fossil_ondisk::{ENTRY_NOARCHIVE, Entry};
use fossil_source::Source;
use fossil_types::{
    BlockAddr, ENTRY_SIZE, Epoch, MAX_STRING_SIZE, MODE_APPEND, MODE_DIR, MODE_SNAPSHOT,
    MODE_TEMPORARY, Mode,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Sentinel for "no meta block": a removed file or the root.
pub const NIL_BOFF: u32 = u32::MAX;

struct FileInner {
    dir: DirEntry,
    /// Meta-block index within the parent's meta source.
    boff: u32,
    dirty: bool,
    removed: bool,
    /// Opened without sources, only to clear a broken entry.
    partial: bool,
    mode: Mode,
    issnapshot: bool,
    source: Option<Arc<Source>>,
    msource: Option<Arc<Source>>,
    /// Root only: the meta source holding the root's own entry.
    own_meta: Option<Arc<Source>>,
}

/// One open file or directory.
pub struct File {
    shared: Arc<FsShared>,
    up: Option<Arc<File>>,
    inner: RwLock<FileInner>,
    kids: Mutex<Vec<Weak<File>>>,
}

impl File {
    /// Assemble the root from the top-level source: slot 0 is the root
    /// directory, slot 1 its meta stream, slot 2 the meta stream holding
    /// the root's own entry.
    pub fn root(shared: Arc<FsShared>, top: &Arc<Source>) -> Result<Arc<Self>> {
        let mode = shared.mode;
        let r0 = top.open(0, mode, false)?;
        let r1 = top.open(1, mode, false)?;
        let r2 = top.open(2, mode, false)?;

        let b = r2
            .block(0, Mode::ReadOnly)?
            .ok_or(FossilError::BadMeta)?;
        let mb = b.read(|data| MetaBlock::unpack(data))?;
        if mb.nindex() == 0 {
            return Err(FossilError::BadMeta);
        }
        let me = mb.index_entry(0);
        let dir = mb.dir_entry(&me)?;
        drop(b);

        Ok(Arc::new(Self {
            shared,
            up: None,
            inner: RwLock::new(FileInner {
                dir,
                boff: 0,
                dirty: false,
                removed: false,
                partial: false,
                mode,
                issnapshot: false,
                source: Some(r0),
                msource: Some(r1),
                own_meta: Some(r2),
            }),
            kids: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.up.is_none()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.inner.read().dir.mode & MODE_DIR != 0
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.inner.read().removed
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.inner.read().issnapshot
    }

    #[must_use]
    pub fn qid(&self) -> u64 {
        self.inner.read().dir.qid
    }

    #[must_use]
    pub fn elem(&self) -> String {
        self.inner.read().dir.elem.clone()
    }

    #[must_use]
    pub fn mode_bits(&self) -> u32 {
        self.inner.read().dir.mode
    }

    /// Full path from the root, for diagnostics.
    #[must_use]
    pub fn path(&self) -> String {
        match &self.up {
            None => "/".to_owned(),
            Some(up) => {
                let parent = up.path();
                let elem = self.elem();
                if parent == "/" {
                    format!("/{elem}")
                } else {
                    format!("{parent}/{elem}")
                }
            }
        }
    }

    fn source(&self) -> Result<Arc<Source>> {
        self.inner
            .read()
            .source
            .clone()
            .ok_or(FossilError::Removed)
    }

    fn msource(&self) -> Result<Arc<Source>> {
        self.inner
            .read()
            .msource
            .clone()
            .ok_or(FossilError::Removed)
    }

    /// Meta source holding this file's own entry: the parent's, or for the
    /// root its private third stream.
    fn holding_msource(&self) -> Result<Arc<Source>> {
        match &self.up {
            Some(up) => up.msource(),
            None => self
                .inner
                .read()
                .own_meta
                .clone()
                .ok_or(FossilError::Removed),
        }
    }

    // ── Access stamps ───────────────────────────────────────────────────

    fn r_access(&self) {
        if self.shared.noatime() || !self.shared.mode.is_write() {
            return;
        }
        let mut inner = self.inner.write();
        if inner.mode.is_write() && !inner.issnapshot {
            inner.dir.atime = now_unix();
            inner.dirty = true;
        }
    }

    fn w_access(&self, uid: &str) {
        let mut inner = self.inner.write();
        if !inner.mode.is_write() {
            return;
        }
        let now = now_unix();
        inner.dir.mtime = now;
        inner.dir.atime = now;
        if inner.dir.mid != uid {
            inner.dir.mid = uid.to_owned();
        }
        inner.dir.mcount = inner.dir.mcount.wrapping_add(1);
        inner.dirty = true;
    }

    // ── Walking ─────────────────────────────────────────────────────────

    /// Walk one element down.
    pub fn walk(self: &Arc<Self>, elem: &str) -> Result<Arc<File>> {
        self.walk_impl(elem, false)
    }

    fn walk_impl(self: &Arc<Self>, elem: &str, partial: bool) -> Result<Arc<File>> {
        self.r_access();
        if elem.is_empty() {
            return Err(FossilError::BadPath);
        }
        if !self.is_dir() {
            return Err(FossilError::NotDir);
        }
        if elem == "." {
            return Ok(Arc::clone(self));
        }
        if elem == ".." {
            return Ok(self.up.clone().unwrap_or_else(|| Arc::clone(self)));
        }

        // live children first
        {
            let mut kids = self.kids.lock();
            kids.retain(|w| w.strong_count() > 0);
            for w in kids.iter() {
                if let Some(kid) = w.upgrade() {
                    if !kid.is_removed() && kid.elem() == elem {
                        return Ok(kid);
                    }
                }
            }
        }

        let (de, boff) = self.dir_lookup(elem)?;
        let (mode, issnapshot) = {
            let inner = self.inner.read();
            (inner.mode, inner.issnapshot)
        };
        let (mode, issnapshot) = if de.mode & MODE_SNAPSHOT != 0 {
            (Mode::ReadOnly, true)
        } else {
            (mode, issnapshot)
        };

        let (source, msource) = if partial {
            // no sources: the caller only gets to unlink this entry
            (None, None)
        } else if de.is_dir() {
            let s = self.open_child_source(de.entry, de.gen, true, mode, issnapshot)?;
            let ms = self.open_child_source(de.mentry, de.mgen, false, mode, issnapshot)?;
            (Some(s), Some(ms))
        } else {
            let s = self.open_child_source(de.entry, de.gen, false, mode, issnapshot)?;
            (Some(s), None)
        };

        let kid = Arc::new(File {
            shared: Arc::clone(&self.shared),
            up: Some(Arc::clone(self)),
            inner: RwLock::new(FileInner {
                dir: de,
                boff,
                dirty: false,
                removed: false,
                partial,
                mode,
                issnapshot,
                source,
                msource,
                own_meta: None,
            }),
            kids: Mutex::new(Vec::new()),
        });
        self.kids.lock().push(Arc::downgrade(&kid));
        trace!(target: "fossil::file", path = %kid.path(), "walked");
        Ok(kid)
    }

    fn open_child_source(
        &self,
        offset: u32,
        gen: u32,
        dir: bool,
        mode: Mode,
        issnapshot: bool,
    ) -> Result<Arc<Source>> {
        let source = self.source()?;
        let _g = source.lock();
        let r = source.open(offset, mode, issnapshot)?;
        if r.gen != gen {
            return Err(FossilError::Removed);
        }
        if r.dir != dir {
            warn!(
                target: "fossil::file",
                offset, want_dir = dir, got_dir = r.dir,
                "entry kind mismatch"
            );
            return Err(FossilError::BadMeta);
        }
        Ok(r)
    }

    /// Scan the meta source for one element.
    fn dir_lookup(&self, elem: &str) -> Result<(DirEntry, u32)> {
        let meta = self.msource()?;
        let _g = meta.lock();
        let dsize = u64::from(meta.dsize);
        let nb = meta.get_size()?.div_ceil(dsize);
        for bo in 0..nb {
            let bo = u32::try_from(bo).map_err(|_| FossilError::BadMeta)?;
            let b = meta
                .block(bo, Mode::ReadOnly)?
                .ok_or(FossilError::BadMeta)?;
            let mb = b.read(|data| MetaBlock::unpack(data))?;
            if let Ok((_, me)) = mb.search(elem)? {
                let de = mb.dir_entry(&me)?;
                return Ok((de, bo));
            }
        }
        Err(FossilError::NoFile)
    }

    // ── Reading and writing ─────────────────────────────────────────────

    pub fn get_size(&self) -> Result<u64> {
        let source = self.source()?;
        let _g = source.lock();
        source.get_size()
    }

    /// Read up to `count` bytes at `offset`; holes come back as zeros.
    pub fn read_at(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        self.r_access();
        let source = self.source()?;
        let _g = source.lock();

        let size = source.get_size()?;
        let offset = offset.min(size);
        let count = count.min(usize::try_from(size - offset).unwrap_or(usize::MAX));
        let dsize = u64::from(source.dsize);

        let mut out = vec![0_u8; count];
        let mut done = 0_usize;
        let mut bn = u32::try_from(offset / dsize).map_err(|_| FossilError::BadOffset)?;
        let mut off = usize::try_from(offset % dsize).unwrap_or(0);
        while done < count {
            let n = (count - done).min(source.dsize as usize - off);
            if let Some(b) = source.block(bn, Mode::ReadOnly)? {
                b.read(|data| out[done..done + n].copy_from_slice(&data[off..off + n]));
            }
            done += n;
            off = 0;
            bn += 1;
        }
        Ok(out)
    }

    /// Write at `offset` (or at end-of-file for append-mode files).
    /// Returns the byte count written.
    pub fn write_at(&self, buf: &[u8], offset: u64, uid: &str) -> Result<usize> {
        self.shared.check_halted()?;
        if self.is_dir() {
            return Err(FossilError::NotFile);
        }
        let source = self.source()?;
        if !source.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        let append = self.mode_bits() & MODE_APPEND != 0;
        self.w_access(uid);
        let _g = source.lock();

        let dsize = u64::from(source.dsize);
        let eof = source.get_size()?;
        let offset = if append { eof } else { offset };

        let mut done = 0_usize;
        let mut pos = offset;
        while done < buf.len() {
            let bn = u32::try_from(pos / dsize).map_err(|_| FossilError::BadOffset)?;
            let off = usize::try_from(pos % dsize).unwrap_or(0);
            let n = (buf.len() - done).min(source.dsize as usize - off);
            let mode = if n == source.dsize as usize {
                Mode::OverWrite
            } else {
                Mode::ReadWrite
            };
            let b = source
                .block(bn, mode)?
                .ok_or_else(|| FossilError::Internal("write walk returned hole".into()))?;
            b.write(|data| data[off..off + n].copy_from_slice(&buf[done..done + n]));
            self.shared.cache.dirty(&b)?;
            done += n;
            pos += n as u64;
        }
        if pos > eof {
            source.set_size(pos)?;
        }
        trace!(target: "fossil::file", path = %self.path(), offset, n = done, "wrote");
        Ok(done)
    }

    /// Truncate a plain file to zero length.
    pub fn truncate(&self, uid: &str) -> Result<()> {
        self.shared.check_halted()?;
        if self.is_dir() {
            return Err(FossilError::NotFile);
        }
        let source = self.source()?;
        if !source.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        {
            let _g = source.lock();
            source.truncate()?;
        }
        self.w_access(uid);
        Ok(())
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// Copy of the directory entry, with the true size for plain files.
    pub fn get_dir(&self) -> Result<DirEntry> {
        let mut de = self.inner.read().dir.clone();
        if de.mode & MODE_DIR == 0 {
            de.size = self.get_size()?;
        }
        Ok(de)
    }

    /// Apply a `wstat`: rename, permission, ownership, time, and size
    /// changes.
    pub fn set_dir(&self, nde: &DirEntry, uid: &str) -> Result<()> {
        self.shared.check_halted()?;
        if self.is_root() {
            return Err(FossilError::Root);
        }
        let source = self.source()?;
        if !source.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }

        let oelem = self.elem();
        if oelem != nde.elem {
            check_name(&nde.elem)?;
            let up = self.up.as_ref().expect("non-root has a parent");
            if up.dir_lookup(&nde.elem).is_ok() {
                return Err(FossilError::Exists);
            }
        }

        if self.mode_bits() & MODE_DIR == 0 {
            let _g = source.lock();
            let size = source.get_size()?;
            if size != nde.size {
                source.set_size(nde.size)?;
            }
        }
        if (self.mode_bits() ^ nde.mode) & MODE_TEMPORARY != 0 {
            self.set_temporary(nde.mode & MODE_TEMPORARY != 0)?;
        }

        {
            let mut inner = self.inner.write();
            inner.dir.elem = nde.elem.clone();
            inner.dir.uid = nde.uid.clone();
            inner.dir.gid = nde.gid.clone();
            inner.dir.mtime = nde.mtime;
            inner.dir.atime = nde.atime;
            let keep = MODE_DIR | MODE_SNAPSHOT;
            inner.dir.mode = (inner.dir.mode & keep) | (nde.mode & !keep);
            inner.dirty = true;
        }
        self.meta_flush_one(&oelem)?;
        if let Some(up) = &self.up {
            up.w_access(uid);
        }
        Ok(())
    }

    /// Toggle the no-archive flag on both sources.
    fn set_temporary(&self, istmp: bool) -> Result<()> {
        let (source, msource) = {
            let inner = self.inner.read();
            (inner.source.clone(), inner.msource.clone())
        };
        for s in [source, msource].into_iter().flatten() {
            let _g = s.lock();
            let mut e = s.get_entry()?;
            if istmp {
                e.flags |= ENTRY_NOARCHIVE;
            } else {
                e.flags &= !ENTRY_NOARCHIVE;
            }
            s.set_entry(&e)?;
        }
        Ok(())
    }

    // ── Create and remove ───────────────────────────────────────────────

    /// Create a child of this directory.
    pub fn create(self: &Arc<Self>, elem: &str, mode: u32, uid: &str) -> Result<Arc<File>> {
        self.shared.check_halted()?;
        check_name(elem)?;
        if !self.is_dir() {
            return Err(FossilError::NotDir);
        }

        // duplicate in memory or on disk
        {
            let kids = self.kids.lock();
            for w in kids.iter() {
                if let Some(kid) = w.upgrade() {
                    if !kid.is_removed() && kid.elem() == elem {
                        return Err(FossilError::Exists);
                    }
                }
            }
        }
        if self.dir_lookup(elem).is_ok() {
            return Err(FossilError::Exists);
        }

        let pr = self.source()?;
        let pms = self.msource()?;
        if !pr.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        let isdir = mode & MODE_DIR != 0;

        let (_ga, _gb) = Source::lock2(&pr, &pms);
        let r = pr.create(pr.dsize, isdir, 0)?;
        let mr = if isdir {
            Some(pr.create(pr.dsize, false, r.offset)?)
        } else {
            None
        };

        let now = now_unix();
        let de = DirEntry {
            elem: elem.to_owned(),
            entry: r.offset,
            gen: r.gen,
            mentry: mr.as_ref().map_or(0, |m| m.offset),
            mgen: mr.as_ref().map_or(0, |m| m.gen),
            qid: self.shared.next_qid(),
            uid: uid.to_owned(),
            gid: self.inner.read().dir.gid.clone(),
            mid: uid.to_owned(),
            mtime: now,
            mcount: 0,
            ctime: now,
            atime: now,
            mode,
            size: 0,
            qid_space: None,
        };

        let boff = match self.meta_alloc(&de, 0) {
            Ok(boff) => boff,
            Err(e) => {
                // roll the fresh sources back before surfacing
                let _ = r.remove();
                if let Some(m) = mr {
                    let _ = m.remove();
                }
                return Err(e);
            }
        };

        if mode & MODE_TEMPORARY != 0 {
            for s in std::iter::once(&r).chain(mr.iter()) {
                let mut e = s.get_entry()?;
                e.flags |= ENTRY_NOARCHIVE;
                s.set_entry(&e)?;
            }
        }

        let kid = Arc::new(File {
            shared: Arc::clone(&self.shared),
            up: Some(Arc::clone(self)),
            inner: RwLock::new(FileInner {
                dir: de,
                boff,
                dirty: false,
                removed: false,
                partial: false,
                mode: self.inner.read().mode,
                issnapshot: false,
                source: Some(r),
                msource: mr,
                own_meta: None,
            }),
            kids: Mutex::new(Vec::new()),
        });
        self.kids.lock().push(Arc::downgrade(&kid));
        self.w_access(uid);
        debug!(target: "fossil::file", path = %kid.path(), mode = %crate::mode::mode_string(mode), "created");
        Ok(kid)
    }

    /// All meta blocks of a directory must be empty before removal.
    fn check_empty(&self) -> Result<()> {
        let meta = self.msource()?;
        let _g = meta.lock();
        let dsize = u64::from(meta.dsize);
        let nb = meta.get_size()?.div_ceil(dsize);
        for bo in 0..nb {
            let bo = u32::try_from(bo).map_err(|_| FossilError::BadMeta)?;
            let b = meta
                .block(bo, Mode::ReadOnly)?
                .ok_or(FossilError::BadMeta)?;
            let mb = b.read(|data| MetaBlock::unpack(data))?;
            if mb.nindex() > 0 {
                return Err(FossilError::NotEmpty);
            }
        }
        Ok(())
    }

    /// Remove this file: unlink its sources, then its directory entry.
    pub fn remove(self: &Arc<Self>, uid: &str) -> Result<()> {
        self.shared.check_halted()?;
        if self.is_root() {
            return Err(FossilError::Root);
        }
        let source = self.source()?;
        if !source.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        if self.is_dir() {
            self.check_empty()?;
        }

        let msource = self.inner.write().msource.take();
        {
            let _guards = match &msource {
                Some(ms) => Some(Source::lock2(&source, ms)),
                None => None,
            };
            let _solo = if msource.is_none() {
                Some(source.lock())
            } else {
                None
            };
            source.remove()?;
            if let Some(ms) = &msource {
                ms.remove()?;
            }
        }
        self.inner.write().source = None;

        self.meta_remove(uid)?;
        debug!(target: "fossil::file", path = %self.path(), "removed");
        Ok(())
    }

    /// Drop this file's directory entry without touching its sources.
    /// The repair path for entries whose sources are gone.
    pub fn clri(self: &Arc<Self>, uid: &str) -> Result<()> {
        self.shared.check_halted()?;
        let up = self.up.as_ref().ok_or(FossilError::Root)?;
        if !up.source()?.mode.is_write() {
            return Err(FossilError::ReadOnly);
        }
        self.meta_remove(uid)
    }

    /// Delete the directory entry from the parent's meta source.
    fn meta_remove(self: &Arc<Self>, uid: &str) -> Result<()> {
        let up = self.up.as_ref().ok_or(FossilError::Root)?;
        up.w_access(uid);

        let ms = up.msource()?;
        let _g = ms.lock();
        let (boff, elem) = {
            let inner = self.inner.read();
            (inner.boff, inner.dir.elem.clone())
        };
        if boff == NIL_BOFF {
            return Err(FossilError::Removed);
        }
        let b = ms
            .block(boff, Mode::ReadWrite)?
            .ok_or(FossilError::BadMeta)?;
        let mut mb = b.read(|data| MetaBlock::unpack(data))?;
        match mb.search(&elem)? {
            Ok((i, _)) => {
                mb.delete(i);
                mb.pack();
                write_meta_block(&b, &mb);
                self.shared.cache.dirty(&b)?;
            }
            Err(_) => {
                warn!(target: "fossil::file", %elem, boff, "entry missing at removal");
            }
        }

        let mut inner = self.inner.write();
        inner.removed = true;
        inner.boff = NIL_BOFF;
        inner.dirty = false;
        Ok(())
    }

    // ── Meta flush ──────────────────────────────────────────────────────

    /// Write out this file's dirty entry and, recursively, its children's.
    pub fn meta_flush(self: &Arc<Self>, rec: bool) -> Result<bool> {
        let mut flushed = self.meta_flush_one("")?;
        if !rec || !self.is_dir() {
            return Ok(flushed);
        }
        let kids: Vec<Arc<File>> = {
            let kids = self.kids.lock();
            kids.iter().filter_map(Weak::upgrade).collect()
        };
        for kid in kids {
            flushed |= kid.meta_flush(true)?;
        }
        Ok(flushed)
    }

    /// Write this file's entry back to its meta block.
    ///
    /// `oelem` is the on-disk name when a rename is in flight; the record is
    /// found by its old name and reinserted under the new one. When the
    /// record outgrew its block it moves to another one, and the deletion
    /// from the old block is dependency-ordered after the insertion.
    fn meta_flush_one(&self, oelem: &str) -> Result<bool> {
        let (dirty, boff, de) = {
            let inner = self.inner.read();
            (inner.dirty, inner.boff, inner.dir.clone())
        };
        if !dirty {
            return Ok(false);
        }
        if boff == NIL_BOFF {
            return Ok(false);
        }
        let oelem = if oelem.is_empty() { &de.elem } else { oelem };

        let ms = self.holding_msource()?;
        let _g = ms.lock();
        let b = ms
            .block(boff, Mode::ReadWrite)?
            .ok_or(FossilError::BadMeta)?;
        let mut mb = b.read(|data| MetaBlock::unpack(data))?;
        let Ok((i, _)) = mb.search(oelem)? else {
            return Err(FossilError::BadMeta);
        };

        if mb.update(i, &de)? {
            write_meta_block(&b, &mb);
            self.shared.cache.dirty(&b)?;
            self.inner.write().dirty = false;
            return Ok(true);
        }

        // no longer fits here; move it to a sibling block. A crash between
        // the two writes leaves a duplicate entry, which fsck resolves, so
        // the new record must land first.
        let up_alloc = match &self.up {
            Some(up) => up.meta_alloc_into(&de, boff + 1)?,
            None => return Err(FossilError::BadMeta),
        };
        let (new_boff, nb_block) = up_alloc;
        debug!(
            target: "fossil::file",
            path = %self.path(), from = boff, to = new_boff,
            "entry moved between meta blocks"
        );

        mb = b.read(|data| MetaBlock::unpack(data))?;
        if let Ok((i, _)) = mb.search(oelem)? {
            mb.delete(i);
            mb.pack();
            write_meta_block(&b, &mb);
        }
        self.shared.cache.dependency(&b, &nb_block, None, None);
        self.shared.cache.dirty(&b)?;

        let mut inner = self.inner.write();
        inner.boff = new_boff;
        inner.dirty = false;
        Ok(true)
    }

    /// Pack a new entry into some meta block of this directory, growing the
    /// meta source when none has room. Returns the chosen block offset.
    ///
    /// The caller holds this directory's meta source lock.
    fn meta_alloc(self: &Arc<Self>, de: &DirEntry, start: u32) -> Result<u32> {
        self.meta_alloc_into(de, start).map(|(boff, _)| boff)
    }

    fn meta_alloc_into(&self, de: &DirEntry, start: u32) -> Result<(u32, Block)> {
        let s = self.source()?;
        let ms = self.msource()?;

        let n = de.packed_size();
        let dsize = u64::from(ms.dsize);
        let nb = u32::try_from(ms.get_size()?.div_ceil(dsize)).map_err(|_| FossilError::BadMeta)?;
        let start = start.min(nb);

        let mut found = None;
        for bo in start..nb {
            let b = ms
                .block(bo, Mode::ReadWrite)?
                .ok_or(FossilError::BadMeta)?;
            let mb = b.read(|data| MetaBlock::unpack(data))?;
            if mb.has_room(n) {
                found = Some((bo, b, mb));
                break;
            }
        }
        let (bo, b, mut mb) = match found {
            Some(f) => f,
            None => {
                let b = ms
                    .block(nb, Mode::ReadWrite)?
                    .ok_or_else(|| FossilError::Internal("write walk returned hole".into()))?;
                ms.set_size((u64::from(nb) + 1) * dsize)?;
                let mb = MetaBlock::init(ms.dsize as usize, MetaBlock::maxindex_for(ms.dsize as usize));
                (nb, b, mb)
            }
        };

        let offset = mb.alloc(n).ok_or(FossilError::BadMeta)?;
        let me = MetaEntry {
            offset,
            size: u16::try_from(n).map_err(|_| FossilError::BadMeta)?,
        };
        let i = match mb.search(&de.elem)? {
            Ok(_) => return Err(FossilError::Exists),
            Err(i) => i,
        };
        mb.pack_dir_entry(de, me);
        mb.insert(i, me);
        mb.pack();
        write_meta_block(&b, &mb);

        // ordering: the meta record must not land before the super block
        // that covers its qid, nor before the entry blocks it references
        if let Ok(sb) = self
            .shared
            .cache
            .local(fossil_device::Partition::Super, BlockAddr(0), Mode::ReadOnly)
        {
            self.shared.cache.dependency(&b, &sb, None, None);
        }
        let epb = s.dsize / ENTRY_SIZE as u32;
        if let Some(eb) = s.block(de.entry / epb, Mode::ReadOnly)? {
            self.shared.cache.dependency(&b, &eb, None, None);
        }
        if de.is_dir() {
            if let Some(eb) = s.block(de.mentry / epb, Mode::ReadOnly)? {
                self.shared.cache.dependency(&b, &eb, None, None);
            }
        }
        self.shared.cache.dirty(&b)?;
        Ok((bo, b))
    }

    // ── Snapshot support ────────────────────────────────────────────────

    /// The raw entries behind this file's sources.
    pub fn get_sources(&self) -> Result<(Entry, Entry)> {
        let s = self.source()?;
        let ms = self.msource()?;
        Ok((s.get_entry()?, ms.get_entry()?))
    }

    /// Copy the entry paths of both sources into the current epoch.
    pub fn walk_sources(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Some(s) = &inner.source {
            s.walk_entry()?;
        }
        if let Some(ms) = &inner.msource {
            ms.walk_entry()?;
        }
        Ok(())
    }

    /// Point this (freshly created) directory's sources at `src`'s trees,
    /// frozen at `epoch`.
    pub fn snapshot_from(&self, src: &File, epoch: Epoch, doarchive: bool) -> Result<()> {
        let (mut e, mut ee) = src.get_sources()?;
        e.snap = epoch;
        e.archive = doarchive;
        ee.snap = epoch;
        ee.archive = doarchive;

        let s = self.source()?;
        let ms = self.msource()?;
        s.set_entry(&e)?;
        ms.set_entry(&ee)?;
        Ok(())
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<FsShared> {
        &self.shared
    }

    /// Sources for verification walks; `None` while removed or partial.
    #[must_use]
    pub fn sources(&self) -> (Option<Arc<Source>>, Option<Arc<Source>>) {
        let inner = self.inner.read();
        (inner.source.clone(), inner.msource.clone())
    }
}

/// Copy a packed meta block image into its cache block.
fn write_meta_block(b: &Block, mb: &MetaBlock) {
    b.write(|data| data.copy_from_slice(mb.bytes()));
}

/// Element names: nonempty, no dot aliases, printable, bounded.
pub fn check_name(elem: &str) -> Result<()> {
    if elem.is_empty() || elem == "." || elem == ".." || elem.len() > MAX_STRING_SIZE {
        return Err(FossilError::BadPath);
    }
    if elem.bytes().any(|c| c < 0x20 || c == b'/') {
        return Err(FossilError::BadPath);
    }
    Ok(())
}

/// Walk a slash-separated path from `root`.
pub fn open_path(root: &Arc<File>, path: &str, partial: bool) -> Result<Arc<File>> {
    let mut f = Arc::clone(root);
    let elems: Vec<&str> = path.split('/').filter(|e| !e.is_empty()).collect();
    for (i, elem) in elems.iter().enumerate() {
        let leaf = i == elems.len() - 1;
        f = f.walk_impl(elem, partial && leaf)?;
    }
    Ok(f)
}

// ── Directory enumeration ───────────────────────────────────────────────────

/// Iterator over a directory's entries, one meta block at a time.
pub struct DirEntryEnum {
    file: Arc<File>,
    boff: u32,
    i: usize,
    buf: Vec<DirEntry>,
}

impl DirEntryEnum {
    pub fn open(file: Arc<File>) -> Result<Self> {
        if !file.is_dir() {
            return Err(FossilError::NotDir);
        }
        // flush children so the on-disk blocks are current
        file.meta_flush(true)?;
        Ok(Self {
            file,
            boff: 0,
            i: 0,
            buf: Vec::new(),
        })
    }

    fn fill(&mut self) -> Result<bool> {
        let (source, meta) = {
            let inner = self.file.inner.read();
            (
                inner.source.clone().ok_or(FossilError::Removed)?,
                inner.msource.clone().ok_or(FossilError::Removed)?,
            )
        };
        let (_gs, _gm) = Source::lock2(&source, &meta);

        let dsize = u64::from(meta.dsize);
        let nb = meta.get_size()?.div_ceil(dsize);
        if u64::from(self.boff) >= nb {
            return Ok(false);
        }
        let b = meta
            .block(self.boff, Mode::ReadOnly)?
            .ok_or(FossilError::BadMeta)?;
        let mb = b.read(|data| MetaBlock::unpack(data))?;
        self.buf.clear();
        self.i = 0;
        for i in 0..mb.nindex() {
            let me = mb.index_entry(i);
            let mut de = mb.dir_entry(&me)?;
            if de.mode & MODE_DIR == 0 {
                de.size = dir_entry_size(&source, de.entry, de.gen)?;
            }
            self.buf.push(de);
        }
        self.boff += 1;
        Ok(true)
    }

    /// Next entry, or `None` at the end of the directory.
    pub fn read(&mut self) -> Result<Option<DirEntry>> {
        while self.i >= self.buf.len() {
            if !self.fill()? {
                return Ok(None);
            }
        }
        let de = self.buf[self.i].clone();
        self.i += 1;
        Ok(Some(de))
    }
}

/// True byte size of a child, read from its entry slot; hanging entries
/// count as zero.
fn dir_entry_size(source: &Arc<Source>, offset: u32, gen: u32) -> Result<u64> {
    let epb = source.dsize / ENTRY_SIZE as u32;
    let bn = offset / epb;
    let idx = (offset % epb) as usize;
    let Some(b) = source.block(bn, Mode::ReadOnly)? else {
        return Ok(0);
    };
    let e = b.read(|data| Entry::unpack(data, idx))?;
    if !e.is_active() || e.gen != gen {
        Ok(0)
    } else {
        Ok(e.size)
    }
}
