#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fossil_check::{CheckOpts, RepairFlags};
use fossil_device::{Disk, FileByteDevice, Partition};
use fossil_fs::format::{FormatOpts, format};
use fossil_fs::{DirEntryEnum, Fs, FsConfig, mode_string, parse_mode};
use fossil_ondisk::{Label, LabelState};
use fossil_types::{BlockAddr, BlockSize, BlockType, Epoch, Mode, Tag};
use fossil_venti::{DirVenti, VentiSession};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "fossil", about = "fossil — archival file system console")]
struct Cli {
    /// Directory-backed archive store for snapshots and vac.
    #[arg(long, global = true)]
    venti: Option<PathBuf>,
    /// Open the image read-only.
    #[arg(short = 'r', long, global = true)]
    readonly: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image file.
    Format {
        image: PathBuf,
        /// Block size, e.g. 8192 or 8K.
        #[arg(short = 'b', long, default_value = "8K")]
        block_size: String,
        /// Textual label stored in the super block.
        #[arg(short = 'l', long, default_value = "vfs")]
        label: String,
    },
    /// Verify an image; repair under the given flags.
    Check {
        image: PathBuf,
        /// Any of: pblock pdir pfile bclose clre clri clrp fix venti snapshot.
        flags: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show block usage.
    Df {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print one file's directory entry.
    Stat {
        image: PathBuf,
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Change a file's metadata: name, mode string, uid, gid.
    Wstat {
        image: PathBuf,
        path: String,
        #[arg(long)]
        elem: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        uid: Option<String>,
        #[arg(long)]
        gid: Option<String>,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Create a file or directory (mode string, e.g. d0755).
    Create {
        image: PathBuf,
        path: String,
        #[arg(default_value = "0644")]
        mode: String,
        #[arg(long, default_value = "adm")]
        uid: String,
    },
    /// Read a file to stdout.
    Read { image: PathBuf, path: String },
    /// Write stdin into a file at offset 0.
    Write {
        image: PathBuf,
        path: String,
        #[arg(long, default_value = "adm")]
        uid: String,
    },
    /// Remove a file or empty directory.
    Remove { image: PathBuf, path: String },
    /// Unlink a directory entry without touching its sources.
    Clri { image: PathBuf, path: String },
    /// Print or rewrite one block label: addr [type state epoch epochClose tag].
    Label {
        image: PathBuf,
        addr: String,
        fields: Vec<String>,
    },
    /// Print or patch block bytes: addr offset [count [hexdata]].
    Block {
        image: PathBuf,
        addr: String,
        offset: usize,
        count: Option<usize>,
        data: Option<String>,
    },
    /// Force block labels back to free.
    Bfree {
        image: PathBuf,
        addrs: Vec<String>,
    },
    /// Zero directory-block entry slots: addr offset...
    Clre {
        image: PathBuf,
        addr: String,
        offsets: Vec<usize>,
    },
    /// Zero pointer-block slots: addr offset...
    Clrp {
        image: PathBuf,
        addr: String,
        offsets: Vec<usize>,
    },
    /// Take a snapshot.
    Snap {
        image: PathBuf,
        /// Archival snapshot: queue the frozen root for the archiver.
        #[arg(short = 'a', long)]
        archive: bool,
        #[arg(short = 's', long, default_value = "")]
        src: String,
        #[arg(short = 'd', long, default_value = "")]
        dst: String,
    },
    /// Expire old ephemeral snapshots.
    Snapclean {
        image: PathBuf,
        #[arg(default_value = "60")]
        max_minutes: u32,
    },
    /// Print the epoch window, or raise the low epoch.
    Epoch {
        image: PathBuf,
        low: Option<u32>,
        /// Raise even when snapshots still reference older epochs.
        #[arg(short = 'y', long)]
        force: bool,
    },
    /// Archive a tree right now; prints the root score.
    Vac { image: PathBuf, path: String },
    /// Flush everything and exit.
    Sync { image: PathBuf },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DfOutput {
    used_blocks: u32,
    total_blocks: u32,
    block_size: usize,
    used_bytes: u64,
    total_bytes: u64,
}

#[derive(Debug, Serialize)]
struct StatOutput {
    path: String,
    elem: String,
    qid: u64,
    mode: String,
    uid: String,
    gid: String,
    mid: String,
    mtime: u32,
    size: u64,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    clean: bool,
    findings: Vec<String>,
    nclose: usize,
    nclre: usize,
    nclri: usize,
    nclrp: usize,
    blocks_total: u32,
    blocks_free: u32,
    blocks_lost: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli)
}

fn open_fs(image: &PathBuf, venti: &Option<PathBuf>, readonly: bool) -> Result<Arc<Fs>> {
    let dev = FileByteDevice::open(image)
        .with_context(|| format!("open image {}", image.display()))?;
    let disk = Arc::new(Disk::open(Arc::new(dev)).context("read partition header")?);
    let venti: Option<Arc<dyn VentiSession>> = match venti {
        Some(dir) => Some(Arc::new(DirVenti::open(dir)?)),
        None => None,
    };
    let config = FsConfig {
        mode: if readonly {
            Mode::ReadOnly
        } else {
            Mode::ReadWrite
        },
        ..FsConfig::default()
    };
    Ok(Fs::open(disk, venti, config)?)
}

/// `8K`-style sizes, plus plain byte counts.
fn parse_block_size(s: &str) -> Result<BlockSize> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1024_u32),
        _ => (s, 1),
    };
    let n: u32 = digits.parse().with_context(|| format!("bad size {s:?}"))?;
    let bytes = n.checked_mul(mult).context("size overflows")?;
    Ok(BlockSize::new(bytes)?)
}

fn parse_addr(s: &str) -> Result<BlockAddr> {
    let v = if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)?
    } else {
        s.parse()?
    };
    Ok(BlockAddr(v))
}

fn run(cli: Cli) -> Result<()> {
    let Cli {
        venti,
        readonly,
        command,
    } = cli;
    match command {
        Command::Format {
            image,
            block_size,
            label,
        } => {
            let dev = FileByteDevice::open(&image)
                .with_context(|| format!("open image {}", image.display()))?;
            let opts = FormatOpts {
                block_size: parse_block_size(&block_size)?,
                label,
            };
            format(Arc::new(dev), &opts)?;
            println!("formatted {}", image.display());
        }

        Command::Check { image, flags, json } => {
            let mut opts = CheckOpts::default();
            for flag in &flags {
                match flag.as_str() {
                    "pblock" => opts.print_blocks = true,
                    "pdir" => opts.print_dirs = true,
                    "pfile" => opts.print_files = true,
                    "bclose" => opts.repair.bclose = true,
                    "clre" => opts.repair.clre = true,
                    "clri" => opts.repair.clri = true,
                    "clrp" => opts.repair.clrp = true,
                    "fix" => opts.repair = RepairFlags::all(),
                    "venti" => opts.use_venti = true,
                    "snapshot" => opts.walk_snapshots = true,
                    other => bail!("unknown check flag {other:?}"),
                }
            }
            let fs = open_fs(&image, &venti, readonly)?;
            let report = fossil_check::check(&fs, &opts)?;
            let out = CheckOutput {
                clean: report.is_clean(),
                findings: report.findings.iter().map(ToString::to_string).collect(),
                nclose: report.nclose,
                nclre: report.nclre,
                nclri: report.nclri,
                nclrp: report.nclrp,
                blocks_total: report.nblocks,
                blocks_free: report.nfree,
                blocks_lost: report.nlost,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for f in &out.findings {
                    println!("error: {f}");
                }
                println!(
                    "fsck: {} clri, {} clre, {} clrp, {} bclose",
                    out.nclri, out.nclre, out.nclrp, out.nclose
                );
                if !out.clean {
                    std::process::exit(1);
                }
            }
        }

        Command::Df { image, json } => {
            let fs = open_fs(&image, &venti, true)?;
            let (used, total, bsize) = fs.df()?;
            let out = DfOutput {
                used_blocks: used,
                total_blocks: total,
                block_size: bsize,
                used_bytes: u64::from(used) * bsize as u64,
                total_bytes: u64::from(total) * bsize as u64,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "{}: {} used + {} free = {} ({:.1}% used)",
                    fs.name(),
                    out.used_bytes,
                    out.total_bytes - out.used_bytes,
                    out.total_bytes,
                    f64::from(used) * 100.0 / f64::from(total.max(1))
                );
            }
        }

        Command::Stat { image, path, json } => {
            let fs = open_fs(&image, &venti, true)?;
            let _elk = fs.rlock();
            let f = fs.open_path(&path)?;
            let de = f.get_dir()?;
            let out = StatOutput {
                path,
                elem: de.elem.clone(),
                qid: de.qid,
                mode: mode_string(de.mode),
                uid: de.uid.clone(),
                gid: de.gid.clone(),
                mid: de.mid.clone(),
                mtime: de.mtime,
                size: de.size,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "stat {} {} {} {} {} {}",
                    out.elem, out.qid, out.uid, out.gid, out.mode, out.size
                );
            }
        }

        Command::Wstat {
            image,
            path,
            elem,
            mode,
            uid,
            gid,
        } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let _elk = fs.rlock();
            let f = fs.open_path(&path)?;
            let mut de = f.get_dir()?;
            if let Some(elem) = elem {
                de.elem = elem;
            }
            if let Some(mode) = mode {
                de.mode = parse_mode(&mode)
                    .with_context(|| format!("bad mode string {mode:?}"))?;
            }
            if let Some(uid) = uid {
                de.uid = uid;
            }
            if let Some(gid) = gid {
                de.gid = gid;
            }
            f.set_dir(&de, "adm")?;
            drop(_elk);
            fs.sync()?;
        }

        Command::Ls { image, path, json } => {
            let fs = open_fs(&image, &venti, true)?;
            let _elk = fs.rlock();
            let f = fs.open_path(&path)?;
            let mut dee = DirEntryEnum::open(f)?;
            let mut entries = Vec::new();
            while let Some(de) = dee.read()? {
                entries.push(StatOutput {
                    path: format!("{}/{}", path.trim_end_matches('/'), de.elem),
                    elem: de.elem.clone(),
                    qid: de.qid,
                    mode: mode_string(de.mode),
                    uid: de.uid.clone(),
                    gid: de.gid.clone(),
                    mid: de.mid.clone(),
                    mtime: de.mtime,
                    size: de.size,
                });
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in &entries {
                    println!("{:>10} {:>8} {:>8} {:>12} {}", e.mode, e.uid, e.gid, e.size, e.elem);
                }
            }
        }

        Command::Create {
            image,
            path,
            mode,
            uid,
        } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let mode = parse_mode(&mode).with_context(|| format!("bad mode string {mode:?}"))?;
            {
                let _elk = fs.rlock();
                let (dir, elem) = split_path(&path)?;
                let parent = fs.open_path(dir)?;
                parent.create(elem, mode, &uid)?;
            }
            fs.sync()?;
        }

        Command::Read { image, path } => {
            let fs = open_fs(&image, &venti, true)?;
            let _elk = fs.rlock();
            let f = fs.open_path(&path)?;
            let size = f.get_size()?;
            let mut offset = 0_u64;
            let chunk = 1 << 20;
            use std::io::Write;
            let mut stdout = std::io::stdout().lock();
            while offset < size {
                let n = chunk.min(usize::try_from(size - offset).unwrap_or(chunk));
                let buf = f.read_at(offset, n)?;
                stdout.write_all(&buf)?;
                offset += buf.len() as u64;
            }
        }

        Command::Write { image, path, uid } => {
            let fs = open_fs(&image, &venti, readonly)?;
            {
                let _elk = fs.rlock();
                let (dir, elem) = split_path(&path)?;
                let parent = fs.open_path(dir)?;
                let f = match parent.walk(elem) {
                    Ok(f) => f,
                    Err(fossil_error::FossilError::NoFile) => parent.create(elem, 0o644, &uid)?,
                    Err(e) => return Err(e.into()),
                };
                use std::io::Read;
                let mut data = Vec::new();
                std::io::stdin().read_to_end(&mut data)?;
                f.truncate(&uid)?;
                f.write_at(&data, 0, &uid)?;
            }
            fs.sync()?;
        }

        Command::Remove { image, path } => {
            let fs = open_fs(&image, &venti, readonly)?;
            {
                let _elk = fs.rlock();
                let f = fs.open_path(&path)?;
                f.remove("adm")?;
            }
            fs.sync()?;
        }

        Command::Clri { image, path } => {
            let fs = open_fs(&image, &venti, readonly)?;
            {
                let _elk = fs.rlock();
                let f = fs.open_path_partial(&path)?;
                f.clri("adm")?;
            }
            fs.sync()?;
        }

        Command::Label {
            image,
            addr,
            fields,
        } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let _elk = fs.rlock();
            let addr = parse_addr(&addr)?;
            let l = fs.cache().read_label(addr)?;
            let prefix = if fields.is_empty() { "" } else { "old: " };
            println!(
                "{prefix}label {addr} {} {} {} {} {}",
                l.typ.raw(),
                l.state.raw(),
                l.epoch,
                l.epoch_close,
                l.tag
            );
            if !fields.is_empty() {
                if fields.len() != 5 {
                    bail!("label rewrite takes 5 fields: type state epoch epochClose tag");
                }
                let keep = |s: &String| s == "-";
                let nl = Label {
                    typ: if keep(&fields[0]) {
                        l.typ
                    } else {
                        BlockType::from_raw(fields[0].parse()?)
                            .map_err(fossil_error::FossilError::Parse)?
                    },
                    state: if keep(&fields[1]) {
                        l.state
                    } else {
                        LabelState::from_raw(fields[1].parse()?)
                            .map_err(fossil_error::FossilError::Parse)?
                    },
                    epoch: if keep(&fields[2]) {
                        l.epoch
                    } else {
                        Epoch(fields[2].parse()?)
                    },
                    epoch_close: if keep(&fields[3]) {
                        l.epoch_close
                    } else {
                        Epoch(fields[3].parse()?)
                    },
                    tag: if keep(&fields[4]) {
                        l.tag
                    } else {
                        Tag(fields[4].parse()?)
                    },
                };
                println!(
                    "new: label {addr} {} {} {} {} {}",
                    nl.typ.raw(),
                    nl.state.raw(),
                    nl.epoch,
                    nl.epoch_close,
                    nl.tag
                );
                let b = fs.cache().local(Partition::Data, addr, Mode::ReadOnly)?;
                fs.cache().set_label(&b, nl)?;
                fs.cache().sync()?;
            }
        }

        Command::Block {
            image,
            addr,
            offset,
            count,
            data,
        } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let _elk = fs.rlock();
            let addr = parse_addr(&addr)?;
            let bsize = fs.block_size();
            if offset >= bsize {
                bail!("offset {offset} past block size {bsize}");
            }
            let count = count.unwrap_or(bsize - offset).min(bsize - offset);
            let mode = if data.is_some() {
                Mode::ReadWrite
            } else {
                Mode::ReadOnly
            };
            let b = fs.cache().local(Partition::Data, addr, mode)?;
            let prefix = if data.is_some() { "old: " } else { "" };
            let old = b.read(|d| hex(&d[offset..offset + count]));
            println!("{prefix}block {addr} {offset} {count} {old}");
            if let Some(hexdata) = data {
                let bytes = unhex(&hexdata)?;
                if bytes.len() != count {
                    bail!("data length {} does not match count {count}", bytes.len());
                }
                b.write(|d| d[offset..offset + count].copy_from_slice(&bytes));
                fs.cache().dirty(&b)?;
                let new = b.read(|d| hex(&d[offset..offset + count]));
                println!("new: block {addr} {offset} {count} {new}");
                fs.cache().sync()?;
            }
        }

        Command::Bfree { image, addrs } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let _elk = fs.rlock();
            for a in &addrs {
                let addr = parse_addr(a)?;
                let l = fs.cache().read_label(addr)?;
                if l.is_free() {
                    println!("{addr} is already free");
                    continue;
                }
                println!(
                    "label {addr} {} {} {} {} {}",
                    l.typ.raw(),
                    l.state.raw(),
                    l.epoch,
                    l.epoch_close,
                    l.tag
                );
                let b = fs.cache().local(Partition::Data, addr, Mode::ReadOnly)?;
                fs.cache().set_label(&b, Label::free())?;
            }
            fs.cache().sync()?;
        }

        Command::Clre {
            image,
            addr,
            offsets,
        } => clr_slots(&venti, readonly, &image, &addr, &offsets, true)?,

        Command::Clrp {
            image,
            addr,
            offsets,
        } => clr_slots(&venti, readonly, &image, &addr, &offsets, false)?,

        Command::Snap {
            image,
            archive,
            src,
            dst,
        } => {
            let fs = open_fs(&image, &venti, readonly)?;
            fs.snapshot(&src, &dst, archive)?;
            if archive {
                // drive the archiver to completion before exiting
                while fossil_fs::snap::archiver_step(&fs)? {}
            }
            fs.close()?;
        }

        Command::Snapclean { image, max_minutes } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let n = fs.snapshot_cleanup(max_minutes)?;
            println!("expired {n} snapshots");
            fs.close()?;
        }

        Command::Epoch { image, low, force } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let (elo, ehi) = fs.epoch_window();
            println!("low {elo} hi {ehi}");
            if let Some(low) = low {
                let low = Epoch(low);
                let held = fs.esearch(low)?;
                for s in &held {
                    println!("\t{}\tclri {}", s.snap, s.path);
                }
                println!("{} snapshots found with epoch < {low}", held.len());
                if !held.is_empty() && !force {
                    println!("not setting low epoch");
                } else {
                    let _elk = fs.wlock();
                    fs.epoch_low(low)?;
                    println!("new: epoch {low}");
                }
            }
            fs.close()?;
        }

        Command::Vac { image, path } => {
            let fs = open_fs(&image, &venti, readonly)?;
            if fs.venti().is_none() {
                bail!("vac needs --venti DIR");
            }
            let score = fs.vac(&path)?;
            println!("vac:{score}");
            fs.close()?;
        }

        Command::Sync { image } => {
            let fs = open_fs(&image, &venti, readonly)?;
            let n = fs.cache().dirty_count();
            fs.sync()?;
            println!("sync: wrote {n} blocks");
            fs.close()?;
        }
    }
    Ok(())
}

/// Zero entry (`clre`) or pointer (`clrp`) slots of one block.
fn clr_slots(venti: &Option<PathBuf>, readonly: bool, image: &PathBuf, addr: &str, offsets: &[usize], entries: bool) -> Result<()> {
    let fs = open_fs(image, venti, readonly)?;
    let _elk = fs.rlock();
    let addr = parse_addr(addr)?;
    let b = fs.cache().local(Partition::Data, addr, Mode::ReadWrite)?;
    let l = b.label();
    let sz = if entries {
        if l.typ != BlockType::DIR {
            bail!("wrong block type: {} is {}", addr, l.typ);
        }
        fossil_types::ENTRY_SIZE
    } else {
        if !l.typ.is_pointer() {
            bail!("wrong block type: {} is {}", addr, l.typ);
        }
        fossil_types::SCORE_SIZE
    };
    let max = fs.block_size() / sz;
    for &o in offsets {
        if o >= max {
            println!("offset {o} too large (>= {max})");
            continue;
        }
        let old = b.read(|d| hex(&d[o * sz..(o + 1) * sz]));
        println!("block {addr} {} {sz} {old}", o * sz);
        b.write(|d| d[o * sz..(o + 1) * sz].fill(0));
    }
    fs.cache().dirty(&b)?;
    fs.cache().sync()?;
    Ok(())
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(i) => Ok((&path[..i], &path[i + 1..])),
        None => bail!("path {path:?} has no parent"),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn unhex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        bail!("odd hex length");
    }
    (0..s.len() / 2)
        .map(|i| Ok(u8::from_str_radix(&s[2 * i..2 * i + 2], 16)?))
        .collect()
}
