//! Segment files and their lifecycle.
//!
//! ```text
//!   Active ──seal──▶ Sealed ──compact──▶ Compacting ──▶ Reclaimed
//!                      ▲                     │
//!                      └─────── abort ───────┘
//! ```
//!
//! Only the active segment is appended to. Sealed segments are immutable and
//! may be read through a memory map or an `O_DIRECT` handle depending on the
//! configured [`SsdIoScheme`]. A reclaimed segment's file is unlinked, but
//! readers already holding the segment keep reading through the open handles.

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::SsdIoScheme;
use crate::error::{Error, Result};

/// Segment file extension
pub const SEGMENT_EXTENSION: &str = "emb";

/// Alignment required by direct I/O reads
const DIRECT_IO_ALIGN: u64 = 4096;

/// Lifecycle state of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// Receiving appends
    Active,
    /// Immutable, readable
    Sealed,
    /// Live records being copied out
    Compacting,
    /// Emptied and unlinked
    Reclaimed,
}

impl SegmentState {
    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: SegmentState) -> bool {
        matches!(
            (self, next),
            (SegmentState::Active, SegmentState::Sealed)
                | (SegmentState::Sealed, SegmentState::Compacting)
                | (SegmentState::Compacting, SegmentState::Sealed)
                | (SegmentState::Compacting, SegmentState::Reclaimed)
        )
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentState::Active => write!(f, "Active"),
            SegmentState::Sealed => write!(f, "Sealed"),
            SegmentState::Compacting => write!(f, "Compacting"),
            SegmentState::Reclaimed => write!(f, "Reclaimed"),
        }
    }
}

/// File name of segment `id`
pub fn segment_file_name(id: u64) -> String {
    format!("segment-{:08}.{}", id, SEGMENT_EXTENSION)
}

/// Whether `path` looks like a segment file
pub fn is_segment_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.starts_with("segment-") && name.ends_with(&format!(".{}", SEGMENT_EXTENSION))
}

/// One append-only segment file
pub struct Segment {
    id: u64,
    path: PathBuf,
    scheme: SsdIoScheme,
    state: Mutex<SegmentState>,
    reader: File,
    mmap: RwLock<Option<Mmap>>,
    direct: RwLock<Option<File>>,
    /// Bytes flushed and visible to readers
    len: AtomicU64,
    live_bytes: AtomicU64,
    live_records: AtomicU64,
}

impl Segment {
    /// Create segment `id` under `dir`, returning it with its write handle
    pub fn create(dir: &Path, id: u64, scheme: SsdIoScheme) -> Result<(Self, File)> {
        let path = dir.join(segment_file_name(id));
        let writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let reader = File::open(&path)?;
        debug!("Created segment {} at {}", id, path.display());
        Ok((
            Self {
                id,
                path,
                scheme,
                state: Mutex::new(SegmentState::Active),
                reader,
                mmap: RwLock::new(None),
                direct: RwLock::new(None),
                len: AtomicU64::new(0),
                live_bytes: AtomicU64::new(0),
                live_records: AtomicU64::new(0),
            },
            writer,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    /// Move to `next`; fails if the transition is not allowed
    pub fn transition(&self, next: SegmentState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "segment {}: illegal transition {} -> {}",
                self.id, *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    /// Transition only if currently in `from`
    pub fn try_transition(&self, from: SegmentState, to: SegmentState) -> bool {
        let mut state = self.state.lock();
        if *state == from && from.can_transition_to(to) {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Bytes visible to readers
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set_len(&self, len: u64) {
        self.len.store(len, Ordering::Release);
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn live_records(&self) -> u64 {
        self.live_records.load(Ordering::Relaxed)
    }

    pub(crate) fn add_live(&self, bytes: u64) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.live_records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn drop_live(&self, bytes: u64) {
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        let _ = self
            .live_records
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Fraction of written bytes still referenced by the index
    pub fn live_ratio(&self) -> f64 {
        let len = self.len();
        if len == 0 {
            1.0
        } else {
            self.live_bytes() as f64 / len as f64
        }
    }

    /// Freeze the segment and set up the configured read path
    pub fn seal(&self) -> Result<()> {
        self.transition(SegmentState::Sealed)?;
        match self.scheme {
            SsdIoScheme::Mmap | SsdIoScheme::MmapAndMadvise => {
                if self.is_empty() {
                    return Ok(());
                }
                // SAFETY: sealed segments are never written again; the file is
                // only unlinked, never truncated, while mapped.
                let mmap = unsafe { Mmap::map(&self.reader) }?;
                if self.scheme == SsdIoScheme::MmapAndMadvise {
                    if let Err(e) = mmap.advise(memmap2::Advice::WillNeed) {
                        warn!("madvise failed on segment {}: {}", self.id, e);
                    }
                }
                *self.mmap.write() = Some(mmap);
            }
            SsdIoScheme::DirectIo => match open_direct(&self.path) {
                Ok(file) => *self.direct.write() = Some(file),
                Err(e) => warn!(
                    "Direct I/O unavailable for segment {}, using buffered reads: {}",
                    self.id, e
                ),
            },
            SsdIoScheme::Buffered => {}
        }
        Ok(())
    }

    /// Read `len` bytes at `offset`
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset + len as u64;
        if end > self.len() {
            return Err(Error::Corruption {
                segment: self.id,
                offset,
                reason: format!("read of {} bytes past segment end {}", len, self.len()),
            });
        }
        if let Some(mmap) = self.mmap.read().as_ref() {
            return Ok(mmap[offset as usize..end as usize].to_vec());
        }
        if let Some(direct) = self.direct.read().as_ref() {
            match read_direct(direct, offset, len) {
                Ok(buf) => return Ok(buf),
                Err(e) => debug!(
                    "Direct read failed on segment {}, retrying buffered: {}",
                    self.id, e
                ),
            }
        }
        let mut buf = vec![0u8; len];
        self.reader.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Read every visible byte
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.read_at(0, self.len() as usize)
    }

    /// Unlink the segment file
    pub fn delete_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("len", &self.len())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn open_direct(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_direct(_path: &Path) -> std::io::Result<File> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "O_DIRECT is only supported on Linux",
    ))
}

/// Aligned read through an `O_DIRECT` handle
fn read_direct(file: &File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let start = offset & !(DIRECT_IO_ALIGN - 1);
    let end = (offset + len as u64 + DIRECT_IO_ALIGN - 1) & !(DIRECT_IO_ALIGN - 1);
    let span = (end - start) as usize;

    let align = DIRECT_IO_ALIGN as usize;
    let mut backing = vec![0u8; span + align];
    let pad = backing.as_ptr().align_offset(align);
    let window = &mut backing[pad..pad + span];

    let mut filled = 0usize;
    while filled < span {
        let n = file.read_at(&mut window[filled..], start + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let skip = (offset - start) as usize;
    if filled < skip + len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("direct read returned {} of {} bytes", filled, skip + len),
        ));
    }
    Ok(window[skip..skip + len].to_vec())
}

// =============================================================================
// Tests
// =============================================================================
