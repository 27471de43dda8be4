//! Conformance scenarios: format, mutate, snapshot, archive, verify.

use fossil_check::{CheckOpts, RepairFlags, check};
use fossil_error::FossilError;
use fossil_harness::{TestImage, venti_read_file, venti_walk};
use fossil_types::{BlockType, Epoch, MODE_DIR, Mode};
use fossil_venti::{MemVenti, VentiSession};
use std::sync::Arc;

#[test]
fn fresh_image_checks_clean() {
    let img = TestImage::new(8192).unwrap();
    let fs = img.open().unwrap();
    let report = check(&fs, &CheckOpts::default()).unwrap();
    assert!(report.is_clean(), "findings: {:?}", report.findings);
    assert_eq!(report.nlost, 0);

    let (used, total, bsize) = fs.df().unwrap();
    assert_eq!(bsize, 8192);
    assert!(used < 16, "fresh image uses {used} of {total}");
}

#[test]
fn write_sync_reopen_readonly() {
    let img = TestImage::new(8192).unwrap();
    let payload: Vec<u8> = (0..100 * 1024_u32).map(|i| (i % 251) as u8).collect();
    {
        let fs = img.open().unwrap();
        {
            let _elk = fs.rlock();
            let active = fs.open_path("/active").unwrap();
            let a = active.create("a", MODE_DIR | 0o755, "adm").unwrap();
            let b = a.create("b", MODE_DIR | 0o755, "adm").unwrap();
            let c = b.create("c", 0o644, "adm").unwrap();
            c.write_at(&payload, 0, "adm").unwrap();
        }
        fs.sync().unwrap();
        fs.close().unwrap();
    }

    let fs = img.open_readonly().unwrap();
    let _elk = fs.rlock();
    let c = fs.open_path("/active/a/b/c").unwrap();
    assert_eq!(c.get_size().unwrap(), 102_400);
    assert_eq!(c.read_at(0, payload.len()).unwrap(), payload);

    let de = c.get_dir().unwrap();
    assert_eq!(de.size, 102_400);
    assert_eq!(de.uid, "adm");
    assert_eq!(fossil_fs::mode_string(de.mode), "0644");

    let b = fs.open_path("/active/a/b").unwrap();
    assert_eq!(fossil_fs::mode_string(b.mode_bits()), "d0755");

    // read-only really is read-only
    assert!(matches!(
        fs.open_path("/active/a/b/c")
            .unwrap()
            .write_at(b"x", 0, "adm"),
        Err(FossilError::ReadOnly)
    ));
}

#[test]
fn snapshot_preserves_removed_files() {
    let img = TestImage::new(8192).unwrap();
    let fs = img.open().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        let x = active.create("x", 0o644, "adm").unwrap();
        x.write_at(b"remember me", 0, "adm").unwrap();
    }
    fs.snapshot("/active", "/snapshot/s1", false).unwrap();
    {
        let _elk = fs.rlock();
        fs.open_path("/active/x").unwrap().remove("adm").unwrap();
    }
    fs.sync().unwrap();

    let _elk = fs.rlock();
    let frozen = fs.open_path("/snapshot/s1/x").unwrap();
    assert!(frozen.is_snapshot());
    assert_eq!(frozen.read_at(0, 64).unwrap(), b"remember me");
    assert!(matches!(
        fs.open_path("/active/x"),
        Err(FossilError::NoFile)
    ));

    // snapshots reject mutation
    assert!(matches!(
        frozen.write_at(b"no", 0, "adm"),
        Err(FossilError::ReadOnly)
    ));
}

#[test]
fn snapshot_epoch_window_and_reopen() {
    let img = TestImage::new(8192).unwrap();
    {
        let fs = img.open().unwrap();
        assert_eq!(fs.epoch_window(), (Epoch(1), Epoch(1)));
        fs.snapshot("", "", false).unwrap();
        assert_eq!(fs.epoch_window(), (Epoch(1), Epoch(2)));
        fs.close().unwrap();
    }
    let fs = img.open().unwrap();
    assert_eq!(fs.epoch_window(), (Epoch(1), Epoch(2)));
    let report = check(&fs, &CheckOpts::default()).unwrap();
    assert!(report.is_clean(), "findings: {:?}", report.findings);
}

#[test]
fn truncate_across_pointer_levels_leaves_no_leaks() {
    let img = TestImage::new(1024).unwrap();
    let fs = img.open().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        let f = active.create("big", 0o644, "adm").unwrap();
        // 1K blocks, 51 pointers per block: 120 blocks needs two levels
        let chunk = vec![0x5a_u8; 1024];
        for bn in 0..120_u64 {
            f.write_at(&chunk, bn * 1024, "adm").unwrap();
        }
        assert_eq!(f.get_size().unwrap(), 120 * 1024);
        f.truncate("adm").unwrap();
        assert_eq!(f.get_size().unwrap(), 0);
    }
    fs.sync().unwrap();

    let report = check(&fs, &CheckOpts::default()).unwrap();
    assert!(report.is_clean(), "findings: {:?}", report.findings);
    assert_eq!(report.nlost, 0);
}

#[test]
fn create_remove_cycle_checks_clean() {
    let img = TestImage::new(8192).unwrap();
    let fs = img.open().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        for i in 0..10 {
            let name = format!("f{i}");
            let f = active.create(&name, 0o644, "adm").unwrap();
            f.write_at(&vec![i as u8; 4096], 0, "adm").unwrap();
        }
        for i in 0..10 {
            let f = fs.open_path(&format!("/active/f{i}")).unwrap();
            f.remove("adm").unwrap();
        }
    }
    fs.sync().unwrap();
    let report = check(&fs, &CheckOpts::default()).unwrap();
    assert!(report.is_clean(), "findings: {:?}", report.findings);
    assert_eq!(report.nlost, 0);
}

#[test]
fn corrupt_label_found_then_fixed() {
    let img = TestImage::new(8192).unwrap();
    let victim;
    {
        let fs = img.open().unwrap();
        {
            let _elk = fs.rlock();
            let active = fs.open_path("/active").unwrap();
            let f = active.create("doomed", 0o644, "adm").unwrap();
            f.write_at(b"short file, one data block", 0, "adm").unwrap();
            let source = f.sources().0.expect("plain file has a data source");
            let e = source.get_entry().unwrap();
            victim = e.score.to_local().expect("local block").0;
        }
        fs.sync().unwrap();
        fs.close().unwrap();
    }

    // flip one byte of the victim's label tag
    let off = img.label_byte_offset(victim, 10).unwrap();
    let old = img.peek(off).unwrap();
    img.poke(off, old ^ 0x55).unwrap();

    let fs = img.open().unwrap();
    let report = check(&fs, &CheckOpts::default()).unwrap();
    assert!(!report.is_clean());

    let fixed = check(
        &fs,
        &CheckOpts {
            repair: RepairFlags::all(),
            ..CheckOpts::default()
        },
    )
    .unwrap();
    assert!(fixed.nclre + fixed.nclri + fixed.nclose >= 1);

    let again = check(&fs, &CheckOpts::default()).unwrap();
    assert!(again.is_clean(), "findings: {:?}", again.findings);
}

#[test]
fn vac_archives_whole_tree() {
    let img = TestImage::new(8192).unwrap();
    let venti: Arc<MemVenti> = Arc::new(MemVenti::new());
    let fs = img
        .open_with(Some(Arc::clone(&venti) as Arc<dyn VentiSession>), Mode::ReadWrite)
        .unwrap();

    let payload: Vec<u8> = (0..30_000_u32).map(|i| (i % 13) as u8).collect();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        let f = active.create("c", 0o644, "adm").unwrap();
        f.write_at(&payload, 0, "adm").unwrap();
        active.create("d", MODE_DIR | 0o755, "adm").unwrap();
    }
    fs.sync().unwrap();

    let score = fs.vac("/active").unwrap();
    assert!(!score.is_local());

    // the stored tree is readable without touching the image
    let restored = venti_read_file(venti.as_ref(), score, 8192, "c").unwrap();
    assert_eq!(restored, payload);

    // and self-contained: every reference resolves inside the store
    let mut buf = vec![0_u8; 8192];
    venti.read(score, BlockType::DIR, &mut buf).unwrap();
    let n = venti_walk(venti.as_ref(), score, BlockType::DIR, 8192).unwrap();
    assert!(n >= 3, "archive holds {n} blocks");
}

#[test]
fn archival_snapshot_publishes_super_last() {
    let img = TestImage::new(8192).unwrap();
    let venti: Arc<MemVenti> = Arc::new(MemVenti::new());
    let fs = img
        .open_with(Some(Arc::clone(&venti) as Arc<dyn VentiSession>), Mode::ReadWrite)
        .unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        let f = active.create("keep", 0o644, "adm").unwrap();
        f.write_at(b"archived bytes", 0, "adm").unwrap();
    }
    fs.snapshot("", "", true).unwrap();

    // drive the archiver; the background worker may be racing us, so wait
    // until the handoff slots drain
    while fossil_fs::snap::archiver_step(&fs).unwrap() {}
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let (_b, sup) = fs.cache().super_get().unwrap();
        if sup.current.is_nil() && sup.next.is_nil() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "archiver stuck");
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let (_b, sup) = fs.cache().super_get().unwrap();
    assert!(sup.current.is_nil());
    assert!(sup.next.is_nil());
    assert_ne!(sup.last, fossil_venti::zero_score());

    // the published root is readable from the store
    let n = venti_walk(venti.as_ref(), sup.last, BlockType::DIR, 8192).unwrap();
    assert!(n >= 1, "archived root walk read {n} blocks");

    fs.close().unwrap();
}

#[test]
fn halt_fails_mutations_fast() {
    let img = TestImage::new(8192).unwrap();
    let fs = img.open().unwrap();
    fs.halt().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        assert!(matches!(
            active.create("nope", 0o644, "adm"),
            Err(FossilError::Halted)
        ));
    }
    fs.unhalt().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        active.create("yep", 0o644, "adm").unwrap();
    }
    fs.close().unwrap();
}

#[test]
fn snapclean_expires_and_raises_low_epoch() {
    let img = TestImage::new(8192).unwrap();
    let fs = img.open().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        let f = active.create("junk", 0o644, "adm").unwrap();
        f.write_at(b"ephemeral", 0, "adm").unwrap();
    }
    fs.snapshot("", "/snapshot/old", false).unwrap();
    let (elo0, ehi0) = fs.epoch_window();
    assert_eq!((elo0, ehi0), (Epoch(1), Epoch(2)));

    // lifetime zero expires everything immediately
    let removed = fs.snapshot_cleanup(0).unwrap();
    assert_eq!(removed, 1);
    let (elo, ehi) = fs.epoch_window();
    assert_eq!(ehi, Epoch(2));
    assert_eq!(elo, Epoch(2), "low epoch follows once nothing references 1");

    assert!(matches!(
        {
            let _elk = fs.rlock();
            fs.open_path("/snapshot/old")
        },
        Err(FossilError::NoFile)
    ));
    fs.close().unwrap();
}

#[test]
fn boundary_block_sizes_format_and_check() {
    for bs in [512_u32, 56 * 1024] {
        let img = TestImage::new(bs).unwrap();
        let fs = img.open().unwrap();
        {
            let _elk = fs.rlock();
            let active = fs.open_path("/active").unwrap();
            let f = active.create("t", 0o644, "adm").unwrap();
            f.write_at(&vec![9_u8; 3 * bs as usize + 17], 0, "adm").unwrap();
        }
        fs.sync().unwrap();
        let report = check(&fs, &CheckOpts::default()).unwrap();
        assert!(report.is_clean(), "bs {bs}: {:?}", report.findings);
    }
}

#[test]
fn directory_spanning_meta_blocks_lists_fully() {
    let img = TestImage::new(1024).unwrap();
    let fs = img.open().unwrap();
    let n = 60_usize;
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        for i in 0..n {
            active
                .create(&format!("entry-{i:04}"), 0o644, "adm")
                .unwrap();
        }
    }
    fs.sync().unwrap();

    let _elk = fs.rlock();
    let active = fs.open_path("/active").unwrap();
    let mut dee = fossil_fs::DirEntryEnum::open(active).unwrap();
    let mut seen = Vec::new();
    while let Some(de) = dee.read().unwrap() {
        seen.push(de.elem);
    }
    assert_eq!(seen.len(), n);
    let mut sorted = seen.clone();
    sorted.sort();
    // entries come out sorted within each meta block; globally all present
    for i in 0..n {
        assert!(sorted.contains(&format!("entry-{i:04}")));
    }
    drop(_elk);

    let report = check(&fs, &CheckOpts::default()).unwrap();
    assert!(report.is_clean(), "findings: {:?}", report.findings);
}

#[test]
fn wstat_renames_and_remodes() {
    let img = TestImage::new(8192).unwrap();
    let fs = img.open().unwrap();
    {
        let _elk = fs.rlock();
        let active = fs.open_path("/active").unwrap();
        let f = active.create("before", 0o644, "adm").unwrap();
        let mut de = f.get_dir().unwrap();
        de.elem = "after".to_owned();
        de.mode = 0o600;
        f.set_dir(&de, "adm").unwrap();
    }
    fs.sync().unwrap();
    fs.close().unwrap();

    let fs = img.open_readonly().unwrap();
    let _elk = fs.rlock();
    assert!(matches!(
        fs.open_path("/active/before"),
        Err(FossilError::NoFile)
    ));
    let f = fs.open_path("/active/after").unwrap();
    assert_eq!(f.mode_bits() & 0o777, 0o600);
}
