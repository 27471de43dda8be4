#![forbid(unsafe_code)]
//! Byte devices and the partitioned disk layer.
//!
//! A [`ByteDevice`] is raw fixed-offset I/O over a backing file. [`Disk`]
//! layers the partition [`Header`] on top and exposes partition-relative
//! block addressing to the cache.

use fossil_error::{FossilError, Result};
use fossil_ondisk::Header;
use fossil_types::{BlockAddr, BlockSize, HEADER_OFFSET, HEADER_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Byte-addressed device with pread/pwrite semantics.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(target: "fossil::device", path = %path.as_ref().display(), len, writable, "opened device");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

fn check_range(offset: u64, len: usize, device_len: u64, what: &'static str) -> Result<()> {
    let len = u64::try_from(len).map_err(|_| FossilError::BadOffset)?;
    let end = offset.checked_add(len).ok_or(FossilError::BadOffset)?;
    if end > device_len {
        return Err(FossilError::Internal(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FossilError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Memory-backed byte device for tests and throwaway images.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let o = usize::try_from(offset).map_err(|_| FossilError::BadOffset)?;
        buf.copy_from_slice(&bytes[o..o + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let o = usize::try_from(offset).map_err(|_| FossilError::BadOffset)?;
        bytes[o..o + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Partition roles of the on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    Super,
    Label,
    Data,
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Super => write!(f, "super"),
            Self::Label => write!(f, "label"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// Partition-addressed block I/O over one byte device.
pub struct Disk {
    dev: Arc<dyn ByteDevice>,
    header: Header,
}

impl Disk {
    /// Read and validate the header, then wrap the device.
    pub fn open(dev: Arc<dyn ByteDevice>) -> Result<Self> {
        let mut buf = [0_u8; HEADER_SIZE];
        dev.read_exact_at(HEADER_OFFSET, &mut buf)?;
        let header = Header::unpack(&buf)?;
        let need = u64::from(header.end) * u64::from(header.block_size.get());
        if need > dev.len_bytes() {
            return Err(FossilError::Internal(format!(
                "device too small for header: need {need} bytes, have {}",
                dev.len_bytes()
            )));
        }
        debug!(
            target: "fossil::device",
            block_size = header.block_size.get(),
            data_blocks = header.data_blocks(),
            "opened disk"
        );
        Ok(Self { dev, header })
    }

    /// Wrap a device with a header the caller just wrote (formatter path).
    pub fn with_header(dev: Arc<dyn ByteDevice>, header: Header) -> Result<Self> {
        header.validate()?;
        Ok(Self { dev, header })
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.header.block_size
    }

    /// Number of blocks in a partition.
    #[must_use]
    pub fn size(&self, part: Partition) -> u32 {
        match part {
            Partition::Super => self.header.super_blocks(),
            Partition::Label => self.header.label_blocks(),
            Partition::Data => self.header.data_blocks(),
        }
    }

    fn byte_offset(&self, part: Partition, addr: BlockAddr) -> Result<u64> {
        if addr.is_nil() || addr.0 >= self.size(part) {
            return Err(FossilError::Internal(format!(
                "block out of range: {part} partition, addr {addr}"
            )));
        }
        let first = match part {
            Partition::Super => self.header.super_first,
            Partition::Label => self.header.label_first,
            Partition::Data => self.header.data_first,
        };
        Ok(u64::from(first + addr.0) * u64::from(self.block_size().get()))
    }

    pub fn read(&self, part: Partition, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size().bytes());
        let offset = self.byte_offset(part, addr)?;
        trace!(target: "fossil::device", %part, %addr, "read block");
        self.dev.read_exact_at(offset, buf)
    }

    pub fn write(&self, part: Partition, addr: BlockAddr, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size().bytes());
        let offset = self.byte_offset(part, addr)?;
        trace!(target: "fossil::device", %part, %addr, "write block");
        self.dev.write_all_at(offset, buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

/// Write a freshly computed header at its fixed offset.
pub fn write_header(dev: &dyn ByteDevice, header: &Header) -> Result<()> {
    header.validate()?;
    let mut buf = [0_u8; HEADER_SIZE];
    header.pack(&mut buf);
    dev.write_all_at(HEADER_OFFSET, &buf)?;
    dev.sync()
}

/// Compute the partition layout for a device of `nbytes`, reproducing the
/// formatter's geometry: two blocks of slack after the header, one super
/// block, then labels sized so every data block has a label slot.
pub fn partition(nbytes: u64, block_size: BlockSize) -> Result<Header> {
    let bsize = u64::from(block_size.get());
    let nblock32 = u32::try_from(nbytes / bsize).unwrap_or(u32::MAX);
    let nblock = u64::from(nblock32);
    if nblock < (HEADER_OFFSET * 10) / bsize {
        return Err(FossilError::Internal(format!(
            "device too small: {nblock} blocks of {bsize} bytes"
        )));
    }

    let lpb = u64::from(block_size.labels_per_block());
    let super_first = (HEADER_OFFSET + 2 * bsize) / bsize;
    let label_first = super_first + 1;
    let ndata = lpb * (nblock - label_first) / (lpb + 1);
    let nlabel = ndata.div_ceil(lpb);
    let data_first = label_first + nlabel;
    let end = data_first + ndata;

    let narrow = |v: u64, field: &'static str| {
        u32::try_from(v).map_err(|_| {
            FossilError::Parse(fossil_types::ParseError::IntegerConversion { field })
        })
    };
    let header = Header {
        version: fossil_types::HEADER_VERSION,
        block_size,
        super_first: narrow(super_first, "super_first")?,
        label_first: narrow(label_first, "label_first")?,
        data_first: narrow(data_first, "data_first")?,
        end: narrow(end, "end")?,
    };
    header.validate()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BS: u32 = 8192;

    fn mem_disk() -> Disk {
        let block_size = BlockSize::new(BS).unwrap();
        let dev = Arc::new(MemByteDevice::new(64 * 1024 * 1024));
        let header = partition(dev.len_bytes(), block_size).unwrap();
        write_header(dev.as_ref(), &header).unwrap();
        Disk::open(dev).unwrap()
    }

    #[test]
    fn partition_layout_covers_every_data_block() {
        let block_size = BlockSize::new(BS).unwrap();
        let header = partition(64 * 1024 * 1024, block_size).unwrap();
        let lpb = block_size.labels_per_block();
        assert!(header.label_blocks() * lpb >= header.data_blocks());
        // not wasteful: one fewer label block would not cover
        assert!((header.label_blocks() - 1) * lpb < header.data_blocks());
        assert_eq!(header.super_blocks(), 1);
    }

    #[test]
    fn partition_rejects_tiny_device() {
        let block_size = BlockSize::new(512).unwrap();
        assert!(partition(1024 * 1024, block_size).is_err());
    }

    #[test]
    fn header_round_trip_through_device() {
        let disk = mem_disk();
        assert_eq!(disk.block_size().get(), BS);
        assert!(disk.size(Partition::Data) > 0);
    }

    #[test]
    fn read_write_blocks_per_partition() {
        let disk = mem_disk();
        let mut buf = vec![0_u8; BS as usize];
        buf[0] = 0xaa;
        buf[BS as usize - 1] = 0x55;
        for part in [Partition::Super, Partition::Label, Partition::Data] {
            disk.write(part, BlockAddr(0), &buf).unwrap();
            let mut back = vec![0_u8; BS as usize];
            disk.read(part, BlockAddr(0), &mut back).unwrap();
            assert_eq!(back, buf, "partition {part}");
        }
    }

    #[test]
    fn partitions_do_not_alias() {
        let disk = mem_disk();
        let ones = vec![1_u8; BS as usize];
        let twos = vec![2_u8; BS as usize];
        disk.write(Partition::Label, BlockAddr(0), &ones).unwrap();
        disk.write(Partition::Data, BlockAddr(0), &twos).unwrap();
        let mut back = vec![0_u8; BS as usize];
        disk.read(Partition::Label, BlockAddr(0), &mut back).unwrap();
        assert_eq!(back, ones);
    }

    #[test]
    fn out_of_range_addresses_fail() {
        let disk = mem_disk();
        let mut buf = vec![0_u8; BS as usize];
        let end = disk.size(Partition::Data);
        assert!(disk.read(Partition::Data, BlockAddr(end), &mut buf).is_err());
        assert!(disk.read(Partition::Data, BlockAddr::NIL, &mut buf).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; 4 * 1024 * 1024]).unwrap();
        tmp.flush().unwrap();
        let dev = FileByteDevice::open(tmp.path()).unwrap();
        assert!(dev.is_writable());
        dev.write_all_at(4096, b"fossil").unwrap();
        let mut back = [0_u8; 6];
        dev.read_exact_at(4096, &mut back).unwrap();
        assert_eq!(&back, b"fossil");
        assert!(dev.read_exact_at(dev.len_bytes(), &mut back).is_err());
    }

    #[test]
    fn disk_open_rejects_truncated_device() {
        let block_size = BlockSize::new(BS).unwrap();
        let dev = Arc::new(MemByteDevice::new(64 * 1024 * 1024));
        let mut header = partition(dev.len_bytes(), block_size).unwrap();
        header.end += 100_000;
        // bypass write_header's validation; size check happens at open
        let mut buf = [0_u8; HEADER_SIZE];
        header.pack(&mut buf);
        dev.write_all_at(HEADER_OFFSET, &buf).unwrap();
        assert!(Disk::open(dev).is_err());
    }
}
