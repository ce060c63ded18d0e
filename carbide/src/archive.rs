//! Memory-mapped round-robin archive files, one per metric.
//!
//! An archive file holds a ladder of fixed-size ring buffers. The first
//! archive has the finest precision and receives every write; each following
//! archive receives consolidated values computed from the one above it.
//!
//! # File Format
//!
//! ```text
//! [0..32)              Header
//!   [0..4)             magic "CRBW"
//!   [4..8)             format version (u32 LE)
//!   [8..12)            aggregation method code (u32 LE)
//!   [12..16)           x-files-factor (f32 LE)
//!   [16..20)           archive count (u32 LE)
//!   [20..32)           reserved
//! [32..32+16N)         Archive descriptors: offset u64, seconds_per_point u32, points u32
//! [..)                 Archive data: `points` slots of (timestamp i64 LE, value f64 LE)
//! ```
//!
//! A slot is live only when its stored timestamp equals the aligned timestamp
//! the reader expects; anything else is a leftover from an earlier lap of the
//! ring and reads as missing.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{ArchiveError, Result};
use crate::points::DataPoint;
use crate::schema::{AggregationMethod, Retention};

/// Magic bytes identifying an archive file.
const ARCHIVE_MAGIC: [u8; 4] = *b"CRBW";

/// Current archive format version.
const ARCHIVE_VERSION: u32 = 1;

/// Size of the file header in bytes.
const HEADER_SIZE: usize = 32;

/// Size of one archive descriptor in bytes.
const DESCRIPTOR_SIZE: usize = 16;

/// Size of one `(timestamp, value)` slot in bytes.
const SLOT_SIZE: usize = 16;

/// Location and shape of one archive inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Byte offset of the first slot.
    pub offset: usize,
    /// Width of one slot in seconds.
    pub seconds_per_point: u32,
    /// Number of slots.
    pub points: u32,
}

impl ArchiveInfo {
    /// Total time covered, in seconds.
    pub fn retention(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.points)
    }

    fn size(&self) -> usize {
        self.points as usize * SLOT_SIZE
    }

    /// Start of the interval containing `timestamp`.
    fn align(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(i64::from(self.seconds_per_point))
    }

    /// Byte offset of the slot holding the aligned `timestamp`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // rem_euclid result is in [0, points)
    fn slot_offset(&self, aligned: i64) -> usize {
        let index = (aligned / i64::from(self.seconds_per_point)).rem_euclid(i64::from(self.points));
        self.offset + index as usize * SLOT_SIZE
    }
}

/// Backing-store handle used by the store writer.
///
/// A handle is opened right before one batch is written and closed right
/// after; it is never shared between threads.
pub trait ArchiveHandle: Send {
    /// Writes the samples, in order, and propagates them into lower archives.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be applied.
    fn update_many(&mut self, points: &[DataPoint]) -> Result<()>;

    /// Flushes and releases the handle.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Creates and opens archive handles.
///
/// The store writer depends only on this trait, so tests can substitute a
/// recording or failing implementation.
pub trait ArchiveFactory: Send + Sync {
    /// Opens an existing archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or unreadable.
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveHandle>>;

    /// Creates a new archive. Must fail if the file already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be created.
    fn create(
        &self,
        path: &Path,
        retentions: &[Retention],
        method: AggregationMethod,
        x_files_factor: f32,
    ) -> Result<Box<dyn ArchiveHandle>>;
}

/// The on-disk [`ArchiveFactory`] backed by [`ArchiveFile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskArchives;

impl ArchiveFactory for DiskArchives {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveHandle>> {
        Ok(Box::new(ArchiveFile::open(path)?))
    }

    fn create(
        &self,
        path: &Path,
        retentions: &[Retention],
        method: AggregationMethod,
        x_files_factor: f32,
    ) -> Result<Box<dyn ArchiveHandle>> {
        Ok(Box::new(ArchiveFile::create(
            path,
            retentions,
            method,
            x_files_factor,
        )?))
    }
}

/// A memory-mapped archive file.
#[derive(Debug)]
pub struct ArchiveFile {
    mmap: MmapMut,
    path: PathBuf,
    method: AggregationMethod,
    x_files_factor: f32,
    archives: Vec<ArchiveInfo>,
}

impl ArchiveFile {
    /// Creates a new archive file sized for `retentions`.
    ///
    /// The ladder is expected to be validated already (see
    /// [`crate::schema::validate_retentions`]).
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Create`] if the file already exists or cannot be
    /// written, and [`ArchiveError::MemoryMap`] if mapping fails.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use carbide::archive::ArchiveFile;
    /// use carbide::schema::{AggregationMethod, Retention};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let file = ArchiveFile::create(
    ///     "cpu.wsp",
    ///     &[Retention::new(60, 1440), Retention::new(3600, 720)],
    ///     AggregationMethod::Average,
    ///     0.5,
    /// )?;
    /// assert_eq!(file.archives().len(), 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn create<P: AsRef<Path>>(
        path: P,
        retentions: &[Retention],
        method: AggregationMethod,
        x_files_factor: f32,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut offset = HEADER_SIZE + retentions.len() * DESCRIPTOR_SIZE;
        let mut archives = Vec::with_capacity(retentions.len());
        for retention in retentions {
            let info = ArchiveInfo {
                offset,
                seconds_per_point: retention.seconds_per_point,
                points: retention.points,
            };
            offset += info.size();
            archives.push(info);
        }
        let file_size = offset;

        // create_new refuses to clobber an existing archive
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ArchiveError::Create {
                path: path.clone(),
                source: e,
            })?;

        file.set_len(file_size as u64)
            .map_err(|e| ArchiveError::Create {
                path: path.clone(),
                source: e,
            })?;

        // SAFETY: The file was just created by us with create_new and sized
        // above; no other mapping of it exists.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| ArchiveError::MemoryMap {
                path: path.clone(),
                source: e,
            })?
        };

        let mut archive = Self {
            mmap,
            path,
            method,
            x_files_factor,
            archives,
        };
        archive.write_header();
        Ok(archive)
    }

    /// Opens and validates an existing archive file.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Open`] if the file cannot be opened and
    /// [`ArchiveError::Corrupted`] if the header or size is invalid.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ArchiveError::Open {
                path: path.clone(),
                source: e,
            })?;

        let len = file
            .metadata()
            .map_err(|e| ArchiveError::Open {
                path: path.clone(),
                source: e,
            })?
            .len();

        if len < HEADER_SIZE as u64 {
            return Err(corrupted(
                &path,
                format!("file too small: {len} bytes, expected at least {HEADER_SIZE}"),
            ));
        }

        // SAFETY: The file is open read/write and at least HEADER_SIZE bytes.
        // The sharding of writes guarantees a single writer per file.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| ArchiveError::MemoryMap {
                path: path.clone(),
                source: e,
            })?
        };

        if mmap[0..4] != ARCHIVE_MAGIC {
            return Err(corrupted(
                &path,
                format!(
                    "invalid magic bytes: expected {:?}, found {:?}",
                    ARCHIVE_MAGIC,
                    &mmap[0..4]
                ),
            ));
        }

        let version = read_u32(&mmap, 4);
        if version != ARCHIVE_VERSION {
            return Err(corrupted(
                &path,
                format!("unsupported version: expected {ARCHIVE_VERSION}, found {version}"),
            ));
        }

        let method = AggregationMethod::from_code(read_u32(&mmap, 8)).ok_or_else(|| {
            corrupted(
                &path,
                format!("unknown aggregation code {}", read_u32(&mmap, 8)),
            )
        })?;
        let x_files_factor = f32::from_bits(read_u32(&mmap, 12));
        let count = read_u32(&mmap, 16) as usize;

        let data_start = HEADER_SIZE + count * DESCRIPTOR_SIZE;
        if count == 0 || mmap.len() < data_start {
            return Err(corrupted(
                &path,
                format!("invalid archive count {count} for {} bytes", mmap.len()),
            ));
        }

        let mut archives = Vec::with_capacity(count);
        let mut expected_offset = data_start;
        for i in 0..count {
            let at = HEADER_SIZE + i * DESCRIPTOR_SIZE;
            let info = ArchiveInfo {
                offset: usize::try_from(read_u64(&mmap, at)).unwrap_or(usize::MAX),
                seconds_per_point: read_u32(&mmap, at + 8),
                points: read_u32(&mmap, at + 12),
            };
            if info.offset != expected_offset || info.seconds_per_point == 0 || info.points == 0 {
                return Err(corrupted(&path, format!("invalid descriptor for archive {i}")));
            }
            expected_offset += info.size();
            archives.push(info);
        }

        if mmap.len() != expected_offset {
            return Err(corrupted(
                &path,
                format!(
                    "file size mismatch: {} bytes, expected {expected_offset}",
                    mmap.len()
                ),
            ));
        }

        Ok(Self {
            mmap,
            path,
            method,
            x_files_factor,
            archives,
        })
    }

    fn write_header(&mut self) {
        self.mmap[0..4].copy_from_slice(&ARCHIVE_MAGIC);
        write_u32(&mut self.mmap, 4, ARCHIVE_VERSION);
        write_u32(&mut self.mmap, 8, self.method.code());
        write_u32(&mut self.mmap, 12, self.x_files_factor.to_bits());
        #[allow(clippy::cast_possible_truncation)] // ladders are a handful of rungs
        write_u32(&mut self.mmap, 16, self.archives.len() as u32);

        for (i, info) in self.archives.iter().enumerate() {
            let at = HEADER_SIZE + i * DESCRIPTOR_SIZE;
            write_u64(&mut self.mmap, at, info.offset as u64);
            write_u32(&mut self.mmap, at + 8, info.seconds_per_point);
            write_u32(&mut self.mmap, at + 12, info.points);
        }
    }

    /// Consolidation method recorded in the header.
    pub fn method(&self) -> AggregationMethod {
        self.method
    }

    /// Coverage fraction recorded in the header.
    pub fn x_files_factor(&self) -> f32 {
        self.x_files_factor
    }

    /// Archive ladder, finest precision first.
    pub fn archives(&self) -> &[ArchiveInfo] {
        &self.archives
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the value stored for the aligned `timestamp`, if live.
    fn read_slot(&self, info: &ArchiveInfo, aligned: i64) -> Option<f64> {
        let at = info.slot_offset(aligned);
        (read_i64(&self.mmap, at) == aligned).then(|| f64::from_bits(read_u64(&self.mmap, at + 8)))
    }

    /// Writes a slot unless it already holds a newer interval.
    fn write_slot(&mut self, info: &ArchiveInfo, aligned: i64, value: f64) -> bool {
        let at = info.slot_offset(aligned);
        if read_i64(&self.mmap, at) > aligned {
            return false;
        }
        write_u64(&mut self.mmap, at, aligned.cast_unsigned());
        write_u64(&mut self.mmap, at + 8, value.to_bits());
        true
    }

    /// Writes samples into the finest archive and propagates them down.
    ///
    /// Samples older than what a slot already holds are ignored. A lower
    /// archive interval is rewritten only when the fraction of known values
    /// beneath it reaches the x-files-factor; propagation stops at the first
    /// archive where nothing qualifies.
    ///
    /// # Errors
    ///
    /// Currently infallible for a validated file; the `Result` mirrors the
    /// [`ArchiveHandle`] contract.
    pub fn update_many(&mut self, points: &[DataPoint]) -> Result<()> {
        let Some(&finest) = self.archives.first() else {
            return Ok(());
        };

        let mut touched = BTreeSet::new();
        for point in points {
            let aligned = finest.align(point.timestamp);
            if aligned <= 0 {
                continue;
            }
            if self.write_slot(&finest, aligned, point.value) {
                touched.insert(aligned);
            }
        }

        for level in 1..self.archives.len() {
            if touched.is_empty() {
                break;
            }
            let (upper, lower) = (self.archives[level - 1], self.archives[level]);
            touched = self.propagate(&upper, &lower, &touched);
        }

        Ok(())
    }

    /// Consolidates every `lower` interval covering a touched `upper` slot.
    fn propagate(
        &mut self,
        upper: &ArchiveInfo,
        lower: &ArchiveInfo,
        touched: &BTreeSet<i64>,
    ) -> BTreeSet<i64> {
        let windows: BTreeSet<i64> = touched.iter().map(|&ts| lower.align(ts)).collect();
        let step = usize::try_from(upper.seconds_per_point).unwrap_or(usize::MAX);
        let slots_per_window = lower.seconds_per_point / upper.seconds_per_point;

        let mut written = BTreeSet::new();
        for start in windows {
            let end = start + i64::from(lower.seconds_per_point);
            let values: Vec<f64> = (start..end)
                .step_by(step)
                .map(|ts| self.read_slot(upper, ts).unwrap_or(f64::NAN))
                .collect();

            let known = values.iter().filter(|v| !v.is_nan()).count();
            #[allow(clippy::cast_precision_loss)]
            let coverage = known as f32 / slots_per_window as f32;
            if known == 0 || coverage < self.x_files_factor {
                continue;
            }

            let value = self.method.apply(&values);
            if self.write_slot(lower, start, value) {
                written.insert(start);
            }
        }
        written
    }

    /// Reads every live slot of one archive, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NoSuchArchive`] if `index` is out of range.
    pub fn fetch_archive(&self, index: usize) -> Result<Vec<DataPoint>> {
        let info = *self.archives.get(index).ok_or(ArchiveError::NoSuchArchive {
            index,
            count: self.archives.len(),
        })?;

        let mut points: Vec<DataPoint> = (0..info.points as usize)
            .filter_map(|slot| {
                let at = info.offset + slot * SLOT_SIZE;
                let timestamp = read_i64(&self.mmap, at);
                (timestamp > 0).then(|| {
                    DataPoint::new(timestamp, f64::from_bits(read_u64(&self.mmap, at + 8)))
                })
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Flushes the mapping to disk.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Sync`] if the flush fails.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| {
            ArchiveError::Sync {
                path: self.path.clone(),
                source: e,
            }
            .into()
        })
    }
}

impl ArchiveHandle for ArchiveFile {
    fn update_many(&mut self, points: &[DataPoint]) -> Result<()> {
        ArchiveFile::update_many(self, points)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.sync()
    }
}

fn corrupted(path: &Path, reason: String) -> crate::error::CarbideError {
    ArchiveError::Corrupted {
        path: path.to_path_buf(),
        reason,
    }
    .into()
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    read_u64(buf, at).cast_signed()
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
