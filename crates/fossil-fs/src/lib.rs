#![forbid(unsafe_code)]
//! The fossil file system proper.
//!
//! [`Fs`] ties the layers together: it owns the cache, the epoch window,
//! the root source and root [`File`], the snapshot machinery, and the
//! archiver. The super block is the only commit point; everything else is
//! rebuildable from it.
//!
//! Lock hierarchy, top to bottom: the epoch lock (`elk`), file locks,
//! source locks, cache internals. Mutating operations hold `elk` for read;
//! epoch advance, low-epoch moves, and fsck hold it for write.

pub mod file;
pub mod format;
pub mod mode;
pub mod snap;

pub use file::{DirEntryEnum, File};
pub use format::format;
pub use mode::{mode_string, parse_mode};

use fossil_cache::{Cache, CacheConfig};
use fossil_device::Disk;
use fossil_error::{FossilError, Result};
use fossil_source::{EpochWindow, RootAnchor, Source};
use fossil_types::{BlockAddr, BlockType, Epoch, Mode, Tag};
use fossil_venti::VentiSession;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Seconds since the Unix epoch, clamped to the on-disk u32 width.
#[must_use]
pub fn now_unix() -> u32 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// State shared between the [`Fs`], its files, and background workers.
pub struct FsShared {
    pub name: String,
    pub cache: Arc<Cache>,
    pub epochs: Arc<EpochWindow>,
    pub mode: Mode,
    /// The epoch lock. Every mutator holds it for read; the epoch advance,
    /// low-epoch moves, and fsck hold it for write.
    pub elk: RwLock<()>,
    halted: AtomicBool,
    noatime: AtomicBool,
    qid: Mutex<u64>,
}

impl FsShared {
    /// Fail fast once the file system is halted.
    pub fn check_halted(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            Err(FossilError::Halted)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn noatime(&self) -> bool {
        self.noatime.load(Ordering::Relaxed)
    }

    /// Hand out the next qid.
    pub fn next_qid(&self) -> u64 {
        let mut qid = self.qid.lock();
        let q = *qid;
        *qid += 1;
        q
    }

    #[must_use]
    pub fn qid_watermark(&self) -> u64 {
        *self.qid.lock()
    }
}

/// Open options for [`Fs::open`].
pub struct FsConfig {
    pub name: String,
    pub mode: Mode,
    pub cache: CacheConfig,
    /// Skip access-time updates.
    pub noatime: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            name: "main".to_owned(),
            mode: Mode::ReadWrite,
            cache: CacheConfig::default(),
            noatime: false,
        }
    }
}

/// An open fossil file system.
pub struct Fs {
    shared: Arc<FsShared>,
    venti: Option<Arc<dyn VentiSession>>,
    anchor: Arc<RootAnchor>,
    /// Top-level source: entry 0 of the active root block.
    source: Mutex<Arc<Source>>,
    root: Mutex<Option<Arc<File>>>,
    snap_times: Mutex<snap::SnapTimes>,
    snap_last: Mutex<Option<u32>>,
    /// Serializes archiver passes between the worker and the console.
    pub(crate) arch_lock: Mutex<()>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutdown: Arc<AtomicBool>,
}

struct WorkerHandle {
    name: &'static str,
    join: std::thread::JoinHandle<()>,
}

impl Fs {
    /// Open a formatted disk.
    pub fn open(
        disk: Arc<Disk>,
        venti: Option<Arc<dyn VentiSession>>,
        config: FsConfig,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Cache::new(
            Arc::clone(&disk),
            venti.clone(),
            config.cache.clone(),
        ));
        let (_sb, sup) = cache.super_get()?;
        info!(
            target: "fossil::fs",
            name = %config.name,
            elo = %sup.epoch_low,
            ehi = %sup.epoch_high,
            active = %sup.active,
            "opening"
        );

        let epochs = Arc::new(EpochWindow::new(sup.epoch_low, sup.epoch_high));
        let anchor = RootAnchor::new(sup.active);
        let shared = Arc::new(FsShared {
            name: config.name,
            cache: Arc::clone(&cache),
            epochs: Arc::clone(&epochs),
            mode: config.mode,
            elk: RwLock::new(()),
            halted: AtomicBool::new(false),
            noatime: AtomicBool::new(config.noatime),
            qid: Mutex::new(sup.qid),
        });

        let source = Source::root(cache, epochs, Arc::clone(&anchor), config.mode)?;
        let root = File::root(Arc::clone(&shared), &source)?;

        let fs = Arc::new(Self {
            shared,
            venti,
            anchor,
            source: Mutex::new(source),
            root: Mutex::new(Some(root)),
            snap_times: Mutex::new(snap::SnapTimes::default()),
            snap_last: Mutex::new(None),
            arch_lock: Mutex::new(()),
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        if fs.venti.is_some() && config.mode.is_write() {
            fs.spawn_archiver();
        }
        Ok(fs)
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<FsShared> {
        &self.shared
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.shared.cache
    }

    #[must_use]
    pub fn venti(&self) -> Option<&Arc<dyn VentiSession>> {
        self.venti.as_ref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.shared.cache.block_size()
    }

    /// The current `(low, high)` epoch window.
    #[must_use]
    pub fn epoch_window(&self) -> (Epoch, Epoch) {
        self.shared.epochs.window()
    }

    /// Hold the epoch lock for read, as every mutating operation must.
    #[must_use]
    pub fn rlock(&self) -> RwLockReadGuard<'_, ()> {
        self.shared.elk.read()
    }

    /// Hold the epoch lock for write: epoch moves and fsck only.
    #[must_use]
    pub fn wlock(&self) -> RwLockWriteGuard<'_, ()> {
        self.shared.elk.write()
    }

    /// The root directory.
    pub fn root(&self) -> Result<Arc<File>> {
        self.root
            .lock()
            .clone()
            .ok_or_else(|| FossilError::Internal("file system closed".to_owned()))
    }

    /// The top-level source.
    #[must_use]
    pub fn source(&self) -> Arc<Source> {
        Arc::clone(&self.source.lock())
    }

    /// Walk a slash-separated path from the root.
    pub fn open_path(&self, path: &str) -> Result<Arc<File>> {
        file::open_path(&self.root()?, path, false)
    }

    /// Partial walk for `clri`: the final element is returned without
    /// opening its sources, usable only to unlink it.
    pub fn open_path_partial(&self, path: &str) -> Result<Arc<File>> {
        file::open_path(&self.root()?, path, true)
    }

    // ── Durability ──────────────────────────────────────────────────────

    /// Flush metadata and the write buffer; publish the qid watermark.
    ///
    /// On return every block dirty at call time, and every label and super
    /// write it depends on, is durable.
    pub fn sync(&self) -> Result<()> {
        let _elk = self.wlock();
        self.sync_locked()
    }

    pub(crate) fn sync_locked(&self) -> Result<()> {
        if !self.shared.mode.is_write() {
            return Ok(());
        }
        if let Some(root) = self.root.lock().clone() {
            root.meta_flush(true)?;
        }
        let (_sb, mut sup) = self.shared.cache.super_get()?;
        sup.qid = self.shared.qid_watermark();
        let (elo, ehi) = self.shared.epochs.window();
        sup.epoch_low = elo;
        sup.epoch_high = ehi;
        sup.active = self.anchor.get();
        self.shared.cache.super_write(&sup, true)?;
        Ok(())
    }

    /// Refuse new mutations; in-flight work drains.
    pub fn halt(&self) -> Result<()> {
        self.shared.halted.store(true, Ordering::Release);
        let _elk = self.wlock();
        debug!(target: "fossil::fs", name = %self.shared.name, "halted");
        Ok(())
    }

    pub fn unhalt(&self) -> Result<()> {
        self.shared.halted.store(false, Ordering::Release);
        debug!(target: "fossil::fs", name = %self.shared.name, "unhalted");
        Ok(())
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// Orderly shutdown: halt new work, stop the workers, flush everything.
    pub fn close(&self) -> Result<()> {
        self.shared.halted.store(true, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
        for w in self.workers.lock().drain(..) {
            if w.join.join().is_err() {
                warn!(target: "fossil::fs", worker = w.name, "worker panicked");
            }
        }
        {
            let _elk = self.wlock();
            self.sync_locked()?;
        }
        self.root.lock().take();
        info!(target: "fossil::fs", name = %self.shared.name, "closed");
        Ok(())
    }

    // ── Epochs ──────────────────────────────────────────────────────────

    /// Advance the high epoch: fork the root block into the new epoch,
    /// link the previous root from slot 1, and publish through the super.
    /// Returns the address of the superseded root.
    ///
    /// Caller holds the epoch lock for write.
    pub fn epoch_advance(&self) -> Result<BlockAddr> {
        let (elo, ehi) = self.shared.epochs.window();
        if !ehi.can_advance() {
            return Err(FossilError::Internal(
                "epoch ceiling reached; lower the window and reformat".to_owned(),
            ));
        }
        let new = ehi.next();
        let cache = &self.shared.cache;

        let old_addr = self.anchor.get();
        let old_root = cache.local_data(old_addr, BlockType::DIR, Tag::ROOT, None, Mode::ReadOnly)?;
        let new_root = cache.block_copy(&old_root, Tag::ROOT, new, elo)?;

        // slot 1 links the previous epoch's root, a convenience for the
        // verifier's root search
        let prev_link = format::prev_root_entry(self.block_size(), old_addr);
        new_root.write(|data| prev_link.pack(data, 1));
        cache.dirty(&new_root)?;

        self.shared.epochs.set_high(new);
        self.anchor.set(new_root.addr());

        let (_sb, mut sup) = cache.super_get()?;
        sup.epoch_high = new;
        sup.active = new_root.addr();
        sup.qid = self.shared.qid_watermark();
        cache.super_write(&sup, true)?;
        info!(target: "fossil::fs", epoch = %new, root = %new_root.addr(), "advanced epoch");
        Ok(old_addr)
    }

    /// Raise the low epoch. Closed blocks below it become reclaimable.
    ///
    /// Caller holds the epoch lock for write and has confirmed no snapshot
    /// still references epochs below `low`.
    pub fn epoch_low(&self, low: Epoch) -> Result<()> {
        let (_, ehi) = self.shared.epochs.window();
        if low == Epoch::ZERO {
            return Err(FossilError::Internal("low epoch cannot be zero".to_owned()));
        }
        if low > ehi {
            return Err(FossilError::Internal(format!(
                "low epoch {low} above high epoch {ehi}"
            )));
        }
        self.shared.epochs.set_low(low);
        let (_sb, mut sup) = self.shared.cache.super_get()?;
        sup.epoch_low = low;
        self.shared.cache.super_write(&sup, true)?;
        info!(target: "fossil::fs", %low, "moved low epoch");
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Take a snapshot. Empty paths pick `/active` and a generated
    /// timestamped destination.
    pub fn snapshot(&self, srcpath: &str, dstpath: &str, doarchive: bool) -> Result<()> {
        self.shared.check_halted()?;
        snap::snapshot(self, srcpath, dstpath, doarchive)
    }

    /// Archive the tree at `path` immediately; returns the root score.
    pub fn vac(&self, path: &str) -> Result<fossil_ondisk::Score> {
        self.shared.check_halted()?;
        snap::vac(self, path)
    }

    /// Remove ephemeral snapshots older than `lifetime_minutes`, then raise
    /// the low epoch past anything no longer referenced.
    pub fn snapshot_cleanup(&self, lifetime_minutes: u32) -> Result<usize> {
        self.shared.check_halted()?;
        snap::cleanup(self, lifetime_minutes)
    }

    #[must_use]
    pub fn snap_get_times(&self) -> snap::SnapTimes {
        *self.snap_times.lock()
    }

    pub fn snap_set_times(&self, times: snap::SnapTimes) {
        *self.snap_times.lock() = times;
    }

    /// List snapshots under `/archive` and `/snapshot` with a snap epoch
    /// below `elo`. The caller must not hold the epoch lock.
    pub fn esearch(&self, below: Epoch) -> Result<Vec<snap::SnapRef>> {
        let _elk = self.rlock();
        let mut out = Vec::new();
        for path in ["/archive", "/snapshot"] {
            if let Ok(f) = self.open_path(path) {
                snap::esearch(&f, path, below, &mut out)?;
            }
        }
        Ok(out)
    }

    // ── Accounting ──────────────────────────────────────────────────────

    /// `df`: (used blocks, total blocks, block size).
    pub fn df(&self) -> Result<(u32, u32, usize)> {
        let _elk = self.rlock();
        let (elo, _) = self.shared.epochs.window();
        let (used, total) = self.shared.cache.count_used(elo)?;
        Ok((used, total, self.block_size()))
    }

    // ── Background workers ──────────────────────────────────────────────

    fn spawn_archiver(self: &Arc<Self>) {
        let fs = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        let join = std::thread::Builder::new()
            .name("fossil-arch".to_owned())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    let Some(fs) = fs.upgrade() else { break };
                    match snap::archiver_step(&fs) {
                        Ok(true) => continue, // archived something; look again
                        Ok(false) => {}
                        Err(e) => {
                            warn!(target: "fossil::arch", error = %e, "archiver step failed");
                        }
                    }
                    drop(fs);
                    std::thread::sleep(std::time::Duration::from_millis(250));
                }
            })
            .expect("spawn archiver");
        self.workers.lock().push(WorkerHandle {
            name: "archiver",
            join,
        });
    }

    /// One scheduler tick: takes due snapshots and expires old ones per the
    /// configured times. Exposed for the console and driven by the caller's
    /// clock; consecutive calls within the same minute are collapsed.
    pub fn snap_tick(&self, minute_of_day: u32) -> Result<()> {
        {
            let mut last = self.snap_last.lock();
            if *last == Some(minute_of_day) {
                return Ok(());
            }
            *last = Some(minute_of_day);
        }
        let times = self.snap_get_times();
        snap::tick(self, &times, minute_of_day)
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for w in self.workers.lock().drain(..) {
            let _ = w.join.join();
        }
    }
}
