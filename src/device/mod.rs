//! Backing storage devices
//!
//! The engine treats storage as an opaque byte-addressable device: the hybrid log and the
//! object log each write whole pages at logical offsets and read byte ranges back. Each
//! log owns its own device instance.

mod file_device;
mod null_device;
mod traits;

pub use file_device::FileSystemDisk;
pub use null_device::NullDisk;
pub use traits::{block_on_io, StorageDevice, SyncStorageDevice};
pub(crate) use traits::{read_exact_at, write_all_at};
