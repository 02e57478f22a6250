//! File-backed storage devices

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

fn open_file(path: &Path, create: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)
}

fn read_file_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn write_file_at(file: &mut File, offset: u64, buf: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Logical offsets split over numbered segment files `<prefix>.<n>`.
///
/// Segment `n` covers `[n * segment_size, (n + 1) * segment_size)`. Dropping a prefix
/// deletes whole segments.
struct SegmentedFile {
    base_dir: PathBuf,
    prefix: String,
    segment_size: u64,
    state: Mutex<Segments>,
}

struct Segments {
    /// Segments below this were released.
    first: u64,
    open: BTreeMap<u64, File>,
}

impl SegmentedFile {
    fn new(base_dir: PathBuf, prefix: &str, segment_size: u64) -> io::Result<Self> {
        if segment_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "segment size must be positive"));
        }
        std::fs::create_dir_all(&base_dir)?;

        // A reopened device starts at its lowest surviving segment.
        let mut first = None;
        for entry in std::fs::read_dir(&base_dir)? {
            let name = entry?.file_name();
            let number = name
                .to_str()
                .and_then(|name| name.strip_prefix(prefix))
                .and_then(|rest| rest.strip_prefix('.'))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(n) = number {
                first = Some(first.map_or(n, |f: u64| f.min(n)));
            }
        }

        Ok(Self {
            base_dir,
            prefix: prefix.to_string(),
            segment_size,
            state: Mutex::new(Segments {
                first: first.unwrap_or(0),
                open: BTreeMap::new(),
            }),
        })
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.base_dir.join(format!("{}.{}", self.prefix, segment))
    }

    /// Run `f` on `segment`, opening it first. `None` when it does not exist and `create`
    /// is unset.
    fn with_segment<T>(
        &self,
        state: &mut Segments,
        segment: u64,
        create: bool,
        f: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> io::Result<Option<T>> {
        if !state.open.contains_key(&segment) {
            match open_file(&self.segment_path(segment), create) {
                Ok(file) => {
                    state.open.insert(segment, file);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && !create => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        match state.open.get_mut(&segment) {
            Some(file) => f(file).map(Some),
            None => Ok(None),
        }
    }

    fn released(offset: u64) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("offset {offset} lies in a released segment"))
    }
}

impl SyncStorageDevice for SegmentedFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if offset / self.segment_size < state.first {
            return Err(Self::released(offset));
        }
        let mut total = 0usize;
        while total < buf.len() {
            let position = offset + total as u64;
            let segment = position / self.segment_size;
            let within = position % self.segment_size;
            let chunk = ((self.segment_size - within) as usize).min(buf.len() - total);
            let read = self
                .with_segment(&mut state, segment, false, |file| {
                    read_file_at(file, within, &mut buf[total..total + chunk])
                })?
                .unwrap_or(0);
            total += read;
            if read < chunk {
                break;
            }
        }
        Ok(total)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if offset / self.segment_size < state.first {
            return Err(Self::released(offset));
        }
        let mut written = 0usize;
        while written < buf.len() {
            let position = offset + written as u64;
            let segment = position / self.segment_size;
            let within = position % self.segment_size;
            let chunk = ((self.segment_size - within) as usize).min(buf.len() - written);
            self.with_segment(&mut state, segment, true, |file| {
                write_file_at(file, within, &buf[written..written + chunk])
            })?;
            written += chunk;
        }
        Ok(written)
    }

    fn flush_sync(&self) -> io::Result<()> {
        let state = self.state.lock();
        for file in state.open.values() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        let last = size / self.segment_size;
        let beyond: Vec<u64> = state.open.range(last + 1..).map(|(n, _)| *n).collect();
        for segment in beyond {
            state.open.remove(&segment);
            std::fs::remove_file(self.segment_path(segment))?;
        }
        let within = size % self.segment_size;
        self.with_segment(&mut state, last, false, |file| file.set_len(within))?;
        Ok(())
    }

    fn truncate_prefix_sync(&self, offset: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        let keep_from = offset / self.segment_size;
        if keep_from <= state.first {
            return Ok(());
        }
        for segment in state.first..keep_from {
            state.open.remove(&segment);
            match std::fs::remove_file(self.segment_path(segment)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(prefix = %self.prefix, from = state.first, to = keep_from, "released segments");
        state.first = keep_from;
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        let mut state = self.state.lock();
        let mut segment = state.first;
        let mut size = 0;
        while let Some(len) = self.with_segment(&mut state, segment, false, |file| {
            file.metadata().map(|m| m.len())
        })? {
            size = segment * self.segment_size + len;
            segment += 1;
        }
        Ok(size)
    }
}

enum FileSystemDiskInner {
    SingleFile(Mutex<File>),
    Segmented(SegmentedFile),
}

/// A file-backed log device: one file, or a directory of fixed-size segments.
///
/// A single file handle sits behind a mutex because every access is a seek followed by
/// a read or write. The mutex is held only for the duration of one syscall pair. Only
/// the segmented layout can give a truncated prefix back to the file system.
pub struct FileSystemDisk {
    path: PathBuf,
    inner: FileSystemDiskInner,
}

impl FileSystemDisk {
    /// Open (creating if needed) the file at `path`. Existing contents are preserved so
    /// a recovering store can read the log written before a restart.
    pub fn single_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = open_file(&path, true)?;
        Ok(Self {
            path,
            inner: FileSystemDiskInner::SingleFile(Mutex::new(file)),
        })
    }

    /// Open a segmented device in `base_dir` whose files are named `<prefix>.<n>`.
    pub fn segmented(base_dir: impl AsRef<Path>, prefix: &str, segment_size: u64) -> io::Result<Self> {
        let path = base_dir.as_ref().to_path_buf();
        let segments = SegmentedFile::new(path.clone(), prefix, segment_size)?;
        Ok(Self {
            path,
            inner: FileSystemDiskInner::Segmented(segments),
        })
    }

    /// Path of the backing file, or the segment directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileSystemDisk {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(file) => read_file_at(&mut file.lock(), offset, buf),
            FileSystemDiskInner::Segmented(segments) => segments.read_sync(offset, buf),
        }
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(file) => {
                write_file_at(&mut file.lock(), offset, buf)?;
                Ok(buf.len())
            }
            FileSystemDiskInner::Segmented(segments) => segments.write_sync(offset, buf),
        }
    }

    fn flush_sync(&self) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(file) => file.lock().sync_data(),
            FileSystemDiskInner::Segmented(segments) => segments.flush_sync(),
        }
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(file) => file.lock().set_len(size),
            FileSystemDiskInner::Segmented(segments) => segments.truncate_sync(size),
        }
    }

    fn truncate_prefix_sync(&self, offset: u64) -> io::Result<()> {
        match &self.inner {
            // A flat file cannot drop its head; the space is reused only by a new log.
            FileSystemDiskInner::SingleFile(_) => Ok(()),
            FileSystemDiskInner::Segmented(segments) => segments.truncate_prefix_sync(offset),
        }
    }

    fn size_sync(&self) -> io::Result<u64> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(file) => file.lock().metadata().map(|m| m.len()),
            FileSystemDiskInner::Segmented(segments) => segments.size_sync(),
        }
    }
}
