//! Storage device traits

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::Pin;

/// Boxed future returned by device operations.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Async storage device.
///
/// Offsets are byte offsets into the device and map one-to-one onto logical log
/// addresses. Implementations must tolerate concurrent calls from several threads.
pub trait StorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`. Returns the number of bytes read, which is
    /// short only when the device ends before the buffer is full.
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize>;

    /// Write `buf` at `offset`.
    fn write<'a>(&'a self, offset: u64, buf: &'a [u8]) -> IoFuture<'a, usize>;

    /// Make previous writes durable.
    fn flush(&self) -> IoFuture<'_, ()>;

    /// Truncate the device to `size` bytes.
    fn truncate(&self, size: u64) -> IoFuture<'_, ()>;

    /// Release the storage behind offsets below `offset`. Later reads there are
    /// undefined. Devices that cannot drop a prefix may keep it.
    fn truncate_prefix(&self, offset: u64) -> IoFuture<'_, ()>;

    /// Current size of the device in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// Synchronous storage device; every implementation is also a [`StorageDevice`].
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read synchronously.
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write synchronously.
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush synchronously.
    fn flush_sync(&self) -> io::Result<()>;

    /// Truncate synchronously.
    fn truncate_sync(&self, size: u64) -> io::Result<()>;

    /// Release the prefix below `offset` synchronously.
    fn truncate_prefix_sync(&self, _offset: u64) -> io::Result<()> {
        Ok(())
    }

    /// Current size.
    fn size_sync(&self) -> io::Result<u64>;
}

impl<T: SyncStorageDevice> StorageDevice for T {
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        let result = self.read_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn write<'a>(&'a self, offset: u64, buf: &'a [u8]) -> IoFuture<'a, usize> {
        let result = self.write_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn flush(&self) -> IoFuture<'_, ()> {
        let result = self.flush_sync();
        Box::pin(async move { result })
    }

    fn truncate(&self, size: u64) -> IoFuture<'_, ()> {
        let result = self.truncate_sync(size);
        Box::pin(async move { result })
    }

    fn truncate_prefix(&self, offset: u64) -> IoFuture<'_, ()> {
        let result = self.truncate_prefix_sync(offset);
        Box::pin(async move { result })
    }

    fn size(&self) -> io::Result<u64> {
        self.size_sync()
    }
}

thread_local! {
    static IO_RUNTIME: RefCell<Option<tokio::runtime::Runtime>> = const { RefCell::new(None) };
}

/// Drive a device future to completion from synchronous code.
///
/// Each calling thread lazily builds a private current-thread runtime. Must not be
/// called from inside an async task.
pub fn block_on_io<F, T>(fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    IO_RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(
                tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()?,
            );
        }
        match slot.as_ref() {
            Some(rt) => rt.block_on(fut),
            None => Err(io::Error::other("io runtime unavailable")),
        }
    })
}

/// Read exactly `buf.len()` bytes at `offset`, failing on a short read.
pub(crate) fn read_exact_at<D: StorageDevice + ?Sized>(
    device: &D,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    let expected = buf.len();
    let read = block_on_io(device.read(offset, buf))?;
    if read != expected {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {offset}: expected {expected} bytes, got {read}"),
        ));
    }
    Ok(())
}

/// Write all of `buf` at `offset`, failing on a short write.
pub(crate) fn write_all_at<D: StorageDevice + ?Sized>(
    device: &D,
    offset: u64,
    buf: &[u8],
) -> io::Result<()> {
    let expected = buf.len();
    let written = block_on_io(device.write(offset, buf))?;
    if written != expected {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("partial write at {offset}: expected {expected} bytes, wrote {written}"),
        ));
    }
    Ok(())
}
