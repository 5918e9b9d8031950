//! Buffer page files.
//!
//! Each page is one durable file:
//!
//! ```text
//! +--------------------+
//! | Header (19 bytes)  |  magic u32 | format u16 | id u64 | sealed u8 | count u32
//! +--------------------+
//! | [size: u32][write] |  repeated, big-endian
//! +--------------------+
//! | crc32 (sealed only)|  CRC-32/ISCSI over the entry region
//! +--------------------+
//! ```
//!
//! The newest page accepts appends; sealing finalizes the count and trailing
//! checksum, after which the page only waits to be transferred and deleted.
//! On recovery a torn tail on the unsealed page is truncated, while a sealed
//! page that fails its checksum is rejected as corrupt.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::storage::revision::Write;

pub const PAGE_MAGIC: u32 = 0x50_41_47; // ASCII "PAG"
pub const PAGE_FORMAT: u16 = 1;
pub const PAGE_HEADER_SIZE: usize = 19;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// One page of the write-ahead buffer: an append-only file mirrored by an
/// in-memory vector of its writes.
#[derive(Debug)]
pub struct Page {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    writes: RwLock<Vec<Write>>,
    /// Bytes of entry data written (excluding the header).
    size: AtomicUsize,
    sealed: AtomicBool,
}

impl Page {
    /// Create a fresh page file in `dir`.
    pub fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(format!("{id:05}.page"));
        let mut file = OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
        write_header(&mut file, id, false, 0)?;
        file.sync_data()?;
        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            writes: RwLock::new(Vec::new()),
            size: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
        })
    }

    /// Reopen a page file, replaying its entries into memory. A sealed page
    /// must pass its checksum; an unsealed page has any torn tail truncated.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < PAGE_HEADER_SIZE {
            return errcorrupt!("page file {} is truncated", path.display());
        }

        let mut header = &bytes[..PAGE_HEADER_SIZE];
        let magic = header.read_u32::<BigEndian>()?;
        if magic != PAGE_MAGIC {
            return errcorrupt!("bad page magic {magic:#x} in {}", path.display());
        }
        let format = header.read_u16::<BigEndian>()?;
        if format != PAGE_FORMAT {
            return errcorrupt!("unsupported page format {format}");
        }
        let id = header.read_u64::<BigEndian>()?;
        let sealed = header.read_u8()? != 0;
        let count = header.read_u32::<BigEndian>()?;

        let entry_region = if sealed {
            if bytes.len() < PAGE_HEADER_SIZE + 4 {
                return errcorrupt!("sealed page {} is missing its checksum", path.display());
            }
            let region = &bytes[PAGE_HEADER_SIZE..bytes.len() - 4];
            let mut trailer = &bytes[bytes.len() - 4..];
            let expected = trailer.read_u32::<BigEndian>()?;
            let actual = CRC32.checksum(region);
            if actual != expected {
                return errcorrupt!(
                    "page {} checksum mismatch: {actual:#x} != {expected:#x}",
                    path.display()
                );
            }
            region
        } else {
            &bytes[PAGE_HEADER_SIZE..]
        };

        let mut writes = Vec::new();
        let mut good = 0usize; // bytes of clean entries
        let mut slice = entry_region;
        loop {
            if slice.is_empty() {
                break;
            }
            let parsed = (|| -> Result<(Write, usize)> {
                let mut cursor = slice;
                let size = cursor.read_u32::<BigEndian>()? as usize;
                if size > cursor.len() {
                    return errcorrupt!("entry overruns page");
                }
                let (mut entry, _) = cursor.split_at(size);
                let write = Write::read_from(&mut entry)?;
                Ok((write, 4 + size))
            })();
            match parsed {
                Ok((write, consumed)) => {
                    writes.push(write);
                    good += consumed;
                    slice = &slice[consumed..];
                }
                Err(e) if sealed => {
                    // A sealed page passed its checksum, so a parse failure
                    // is real corruption rather than a torn tail.
                    return Err(e);
                }
                Err(_) => {
                    tracing::warn!(
                        page = id,
                        offset = PAGE_HEADER_SIZE + good,
                        "truncating torn tail on unsealed page"
                    );
                    file.set_len((PAGE_HEADER_SIZE + good) as u64)?;
                    file.sync_data()?;
                    break;
                }
            }
        }

        if sealed && writes.len() != count as usize {
            return errcorrupt!(
                "sealed page {} holds {} entries, header claims {count}",
                path.display(),
                writes.len()
            );
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            writes: RwLock::new(writes),
            size: AtomicUsize::new(good),
            sealed: AtomicBool::new(sealed),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Bytes of entry data in the page.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.writes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.read().is_empty()
    }

    /// Append a write. Fails with [`Error::ReadOnly`] once sealed, in which
    /// case the caller retries against the buffer's new current page.
    /// Returns the page's entry-byte size after the append.
    pub fn append(&self, write: Write) -> Result<usize> {
        let mut file = self.file.lock();
        if self.is_sealed() {
            return Err(Error::ReadOnly);
        }

        let mut entry = Vec::with_capacity(4 + write.size());
        entry.write_u32::<BigEndian>(write.size() as u32)?;
        write.write_to(&mut entry)?;

        file.seek(SeekFrom::End(0))?;
        file.write_all(&entry)?;

        self.writes.write().push(write);
        Ok(self.size.fetch_add(entry.len(), Ordering::SeqCst) + entry.len())
    }

    /// Flush appended entries to stable storage.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }

    /// Seal the page: write the trailing checksum, finalize the header, and
    /// refuse all further appends. Idempotent.
    pub fn seal(&self) -> Result<()> {
        let mut file = self.file.lock();
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let writes = self.writes.read();
        let mut digest = CRC32.digest();
        let mut entry = Vec::new();
        for write in writes.iter() {
            entry.clear();
            entry.write_u32::<BigEndian>(write.size() as u32)?;
            write.write_to(&mut entry)?;
            digest.update(&entry);
        }
        let checksum = digest.finalize();
        let count = writes.len() as u32;
        drop(writes);

        file.seek(SeekFrom::End(0))?;
        file.write_u32::<BigEndian>(checksum)?;
        write_header(&mut file, self.id, true, count)?;
        file.sync_data()?;
        Ok(())
    }

    /// Run `f` over every write in insertion order, under the page's read
    /// lock so that a scan sees a consistent prefix even while appends and
    /// transfers are in flight.
    pub fn scan(&self, mut f: impl FnMut(&Write) -> Result<()>) -> Result<()> {
        let writes = self.writes.read();
        for write in writes.iter() {
            f(write)?;
        }
        Ok(())
    }

    /// Delete the backing file. The page must not be scanned afterwards.
    pub fn delete(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File, id: u64, sealed: bool, count: u32) -> Result<()> {
    let mut header = Vec::with_capacity(PAGE_HEADER_SIZE);
    header.write_u32::<BigEndian>(PAGE_MAGIC)?;
    header.write_u16::<BigEndian>(PAGE_FORMAT)?;
    header.write_u64::<BigEndian>(id)?;
    header.write_u8(sealed as u8)?;
    header.write_u32::<BigEndian>(count)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}
