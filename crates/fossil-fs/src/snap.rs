//! Snapshots and the archiver.
//!
//! An ephemeral snapshot advances the epoch and records the frozen tree
//! under a timestamped directory. An archival snapshot additionally queues
//! the superseded root for the archiver, which walks it bottom-up, stores
//! every reachable block in the archive tier, and publishes the resulting
//! root score through `super.last`.

use crate::file::{DirEntryEnum, open_path};
use crate::{File, Fs, now_unix};
use fossil_cache::Cache;
use fossil_error::{FossilError, Result};
use fossil_ondisk::{ENTRY_LOCAL, Entry, LabelState, Score};
use fossil_types::{
    BlockAddr, BlockType, ENTRY_SIZE, Epoch, MODE_DIR, MODE_SNAPSHOT, Mode, SCORE_SIZE, Tag,
};
use fossil_venti::{VentiSession, zero_score};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot scheduling knobs; `None` disables the corresponding behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapTimes {
    /// Minute of day for the daily archival snapshot.
    pub arch_minute: Option<u32>,
    /// Minutes between ephemeral snapshots.
    pub snap_interval: Option<u32>,
    /// Minutes an ephemeral snapshot is kept.
    pub snap_lifetime: Option<u32>,
}

/// One snapshot found by the epoch search.
#[derive(Debug, Clone)]
pub struct SnapRef {
    pub path: String,
    pub snap: Epoch,
    pub archive: bool,
    pub mtime: u32,
}

// ── Timestamped snapshot names ──────────────────────────────────────────────

/// Civil date from a day count since the Unix epoch (Gregorian).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    (y, m as u32, d as u32)
}

/// `(yyyy, mmdd, hhmm)` components for snapshot naming.
fn date_parts(secs: u32) -> (String, String, String) {
    let days = i64::from(secs) / 86_400;
    let rem = i64::from(secs) % 86_400;
    let (y, m, d) = civil_from_days(days);
    let (hh, mm) = (rem / 3600, (rem % 3600) / 60);
    (
        format!("{y:04}"),
        format!("{m:02}{d:02}"),
        format!("{hh:02}{mm:02}"),
    )
}

/// Default destination for a snapshot taken now.
fn default_dst(doarchive: bool, secs: u32) -> String {
    let (y, md, hm) = date_parts(secs);
    if doarchive {
        format!("/archive/{y}/{md}")
    } else {
        format!("/snapshot/{y}/{md}/{hm}")
    }
}

/// Minute of the day for `secs`, for the scheduler.
#[must_use]
pub fn minute_of_day(secs: u32) -> u32 {
    (secs % 86_400) / 60
}

// ── Snapshot creation ───────────────────────────────────────────────────────

/// Create the directory chain for `path`; the leaf gets `leaf_mode`.
fn create_path(fs: &Fs, path: &str, leaf_mode: u32, uid: &str) -> Result<Arc<File>> {
    let elems: Vec<&str> = path.split('/').filter(|e| !e.is_empty()).collect();
    if elems.is_empty() {
        return Err(FossilError::BadPath);
    }
    let mut f = fs.root()?;
    for (i, elem) in elems.iter().enumerate() {
        let leaf = i == elems.len() - 1;
        f = match f.walk(elem) {
            Ok(kid) => {
                if leaf {
                    return Err(FossilError::Exists);
                }
                kid
            }
            Err(FossilError::NoFile) => {
                let mode = if leaf { leaf_mode } else { MODE_DIR | 0o555 };
                f.create(elem, mode, uid)?
            }
            Err(e) => return Err(e),
        };
    }
    Ok(f)
}

/// Pick a destination that does not exist yet, suffixing `.N` on collision.
fn unique_dst(fs: &Fs, base: &str) -> String {
    if fs.open_path(base).is_err() {
        return base.to_owned();
    }
    for n in 1.. {
        let cand = format!("{base}.{n}");
        if fs.open_path(&cand).is_err() {
            return cand;
        }
    }
    unreachable!("suffix search terminates");
}

/// Take a snapshot: advance the epoch, then record the superseded tree
/// under the destination path.
pub fn snapshot(fs: &Fs, srcpath: &str, dstpath: &str, doarchive: bool) -> Result<()> {
    let _elk = fs.wlock();

    if doarchive {
        let (_sb, sup) = fs.cache().super_get()?;
        if !sup.next.is_nil() || !sup.current.is_nil() {
            return Err(FossilError::SnapInProgress);
        }
    }

    let srcpath = if srcpath.is_empty() { "/active" } else { srcpath };
    let now = now_unix();
    let dstpath = if dstpath.is_empty() {
        unique_dst(fs, &default_dst(doarchive, now))
    } else {
        dstpath.to_owned()
    };

    let frozen = fs.epoch_window().1;
    let old_root = fs.epoch_advance()?;

    let src = fs.open_path(srcpath)?;
    if !src.is_dir() {
        return Err(FossilError::NotDir);
    }
    src.walk_sources()?;

    let dst = create_path(fs, &dstpath, MODE_DIR | MODE_SNAPSHOT | 0o555, "adm")?;
    dst.snapshot_from(&src, frozen, doarchive)?;
    dst.meta_flush(false)?;

    if doarchive {
        let (_sb, mut sup) = fs.cache().super_get()?;
        sup.next = old_root;
        fs.cache().super_write(&sup, false)?;
    }
    fs.sync_locked()?;
    info!(
        target: "fossil::snap",
        src = srcpath, dst = %dstpath, epoch = %frozen, archive = doarchive,
        "snapshot taken"
    );
    Ok(())
}

// ── Epoch search and cleanup ────────────────────────────────────────────────

/// Recursively list snapshot entries with `snap < below` under `f`.
pub fn esearch(f: &Arc<File>, prefix: &str, below: Epoch, out: &mut Vec<SnapRef>) -> Result<()> {
    let mut dee = DirEntryEnum::open(Arc::clone(f))?;
    while let Some(de) = dee.read()? {
        let path = format!("{prefix}/{}", de.elem);
        if de.mode & MODE_SNAPSHOT != 0 {
            match f.walk(&de.elem) {
                Ok(kid) => match kid.get_sources() {
                    Ok((e, _)) => {
                        if e.snap != Epoch::ZERO && e.snap < below {
                            out.push(SnapRef {
                                path,
                                snap: e.snap,
                                archive: e.archive,
                                mtime: de.mtime,
                            });
                        }
                    }
                    Err(e) => {
                        warn!(target: "fossil::snap", %path, error = %e, "cannot read snapshot sources");
                    }
                },
                Err(e) => {
                    warn!(target: "fossil::snap", %path, error = %e, "cannot walk snapshot");
                }
            }
        } else if de.mode & MODE_DIR != 0 {
            if let Ok(kid) = f.walk(&de.elem) {
                esearch(&kid, &path, below, out)?;
            }
        }
    }
    Ok(())
}

/// Drop ephemeral snapshots older than `lifetime_minutes`, then raise the
/// low epoch to the oldest snapshot still referenced.
pub fn cleanup(fs: &Fs, lifetime_minutes: u32) -> Result<usize> {
    let cutoff = now_unix().saturating_sub(lifetime_minutes.saturating_mul(60));
    let mut removed = 0_usize;

    let victims: Vec<SnapRef> = {
        let _elk = fs.rlock();
        let mut all = Vec::new();
        if let Ok(f) = fs.open_path("/snapshot") {
            esearch(&f, "/snapshot", Epoch::INFINITY, &mut all)?;
        }
        all.into_iter()
            .filter(|s| !s.archive && s.mtime <= cutoff)
            .collect()
    };
    for v in &victims {
        let _elk = fs.rlock();
        match fs.open_path_partial(&v.path) {
            Ok(f) => {
                f.clri("adm")?;
                removed += 1;
                debug!(target: "fossil::snap", path = %v.path, snap = %v.snap, "expired snapshot");
            }
            Err(e) => {
                warn!(target: "fossil::snap", path = %v.path, error = %e, "cannot expire snapshot");
            }
        }
    }

    // raise the low epoch past everything no longer referenced
    let remaining = fs.esearch(Epoch::INFINITY)?;
    let (_, ehi) = fs.epoch_window();
    let new_low = remaining
        .iter()
        .map(|s| s.snap)
        .min()
        .map_or(ehi, |lowest| lowest.min(ehi));
    {
        let _elk = fs.wlock();
        fs.epoch_low(new_low)?;
    }
    Ok(removed)
}

/// Scheduler: fire due snapshots for this minute of the day.
pub fn tick(fs: &Fs, times: &SnapTimes, minute: u32) -> Result<()> {
    if times.arch_minute == Some(minute) {
        fs.snapshot("", "", true)?;
    }
    if let Some(interval) = times.snap_interval {
        if interval > 0 && minute % interval == 0 {
            fs.snapshot("", "", false)?;
        }
    }
    if let Some(life) = times.snap_lifetime {
        fs.snapshot_cleanup(life)?;
    }
    Ok(())
}

// ── The archiver ────────────────────────────────────────────────────────────

/// One archiver pass: promote `super.next` to `super.current`, store the
/// tree, publish `super.last`. Returns whether any work happened.
pub fn archiver_step(fs: &Fs) -> Result<bool> {
    let Some(venti) = fs.venti().cloned() else {
        return Ok(false);
    };
    let _serial = fs.arch_lock.lock();
    let cache = fs.cache();

    let work = {
        let _elk = fs.rlock();
        let (_sb, mut sup) = cache.super_get()?;
        if !sup.current.is_nil() {
            sup.current
        } else if !sup.next.is_nil() {
            sup.current = sup.next;
            sup.next = BlockAddr::NIL;
            let current = sup.current;
            cache.super_write(&sup, true)?;
            current
        } else {
            return Ok(false);
        }
    };

    info!(target: "fossil::arch", root = %work, "archiving");
    let root_score = archive_tree(cache, venti.as_ref(), Score::local(work), BlockType::DIR)?;
    venti.sync()?;

    {
        let _elk = fs.rlock();
        let (_sb, mut sup) = cache.super_get()?;
        sup.last = root_score;
        sup.current = BlockAddr::NIL;
        cache.super_write(&sup, true)?;
    }
    info!(target: "fossil::arch", score = %root_score, "archive complete");
    Ok(true)
}

/// Store the tree under `score` in the archive tier, bottom-up, and return
/// its content score. Pointer slots and entries in the stored payloads are
/// rewritten to content scores, so the stored tree is self-contained.
fn archive_tree(
    cache: &Arc<Cache>,
    venti: &dyn VentiSession,
    score: Score,
    typ: BlockType,
) -> Result<Score> {
    if !score.is_local() {
        return Ok(score); // already archived
    }
    let addr = score.to_local().expect("checked local");
    if addr.is_nil() {
        return Ok(zero_score());
    }

    let b = cache.local(fossil_device::Partition::Data, addr, Mode::ReadOnly)?;
    let label = b.label();
    debug_assert_eq!(label.typ, typ);
    let mut data = b.copy_data();
    drop(b);

    if label.typ.is_pointer() {
        let child = label.typ.child().expect("pointer has children");
        for i in 0..data.len() / SCORE_SIZE {
            let s = Score::read(&data, i * SCORE_SIZE)?;
            if s == zero_score() || s.to_local() == Some(BlockAddr::NIL) {
                continue;
            }
            let vs = archive_tree(cache, venti, s, child)?;
            vs.put(&mut data, i * SCORE_SIZE);
        }
    } else if label.typ.is_dir_tree() {
        for i in 0..data.len() / ENTRY_SIZE {
            let Ok(mut e) = Entry::unpack(&data, i) else {
                warn!(target: "fossil::arch", %addr, slot = i, "skipping unreadable entry");
                continue;
            };
            if !e.is_active() {
                continue;
            }
            if e.no_archive()
                || (e.snap != Epoch::ZERO && !e.archive)
                || (e.is_local() && e.tag == Tag::ROOT)
            {
                // temporary files, ephemeral snapshots, and the previous-root
                // link stay out of the permanent record
                let dead = Entry {
                    flags: 0,
                    score: Score::local(BlockAddr::NIL),
                    tag: Tag::BAD,
                    size: 0,
                    depth: 0,
                    ..e
                };
                dead.pack(&mut data, i);
                continue;
            }
            let vs = archive_tree(cache, venti, e.score, e.block_type())?;
            e.score = vs;
            e.flags &= !ENTRY_LOCAL;
            e.tag = Tag::BAD;
            e.pack(&mut data, i);
        }
    }

    let vscore = venti.write(label.typ, &data)?;

    // remember locally that this block has a durable copy
    let b = cache.local(fossil_device::Partition::Data, addr, Mode::ReadOnly)?;
    let l = b.label();
    if !l.state.contains(LabelState::VENTI) {
        let mut marked = l;
        marked.state = l.state.with(LabelState::VENTI);
        cache.set_label(&b, marked)?;
    }
    Ok(vscore)
}

/// Archive the tree at `path` right now; returns the root score.
///
/// The stored root is a directory payload holding the path's two source
/// entries, rewritten to content scores.
pub fn vac(fs: &Fs, path: &str) -> Result<Score> {
    let venti = fs.venti().cloned().ok_or(FossilError::NoVenti)?;
    let cache = fs.cache();
    let _elk = fs.rlock();

    let f = open_path(&fs.root()?, path, false)?;
    let (mut e, mut ee) = f.get_sources()?;

    e.score = archive_tree(cache, venti.as_ref(), e.score, e.block_type())?;
    e.flags &= !ENTRY_LOCAL;
    e.tag = Tag::BAD;
    ee.score = archive_tree(cache, venti.as_ref(), ee.score, ee.block_type())?;
    ee.flags &= !ENTRY_LOCAL;
    ee.tag = Tag::BAD;

    let mut payload = vec![0_u8; fs.block_size()];
    e.pack(&mut payload, 0);
    ee.pack(&mut payload, 1);
    let score = venti.write(BlockType::DIR, &payload)?;
    venti.sync()?;
    info!(target: "fossil::snap", %path, %score, "vac");
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(365), (1971, 1, 1));
        // 2000-03-01, the day after a century leap day
        assert_eq!(civil_from_days(11_017), (2000, 3, 1));
        // 2026-08-02
        assert_eq!(civil_from_days(20_666), (2026, 8, 2));
    }

    #[test]
    fn date_part_formatting() {
        // 2026-08-02 13:07:09 UTC
        let secs = 20_666 * 86_400 + 13 * 3600 + 7 * 60 + 9;
        let (y, md, hm) = date_parts(secs);
        assert_eq!(y, "2026");
        assert_eq!(md, "0802");
        assert_eq!(hm, "1307");
        assert_eq!(minute_of_day(secs), 13 * 60 + 7);
    }

    #[test]
    fn default_dst_shapes() {
        let secs = 20_666 * 86_400 + 600;
        assert_eq!(default_dst(false, secs), "/snapshot/2026/0802/0010");
        assert_eq!(default_dst(true, secs), "/archive/2026/0802");
    }
}
