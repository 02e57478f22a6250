//! Pending I/O manager
//!
//! Reads that reach the stable region are handed to a background worker. The worker
//! drives device futures on its own runtime and sends each completion back on the channel
//! the requesting session supplied, so sessions never share a completion queue.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::record::{record_size, RecordView, RECORD_HEADER_SIZE};

#[derive(Debug)]
pub(crate) enum IoRequest {
    /// Read the whole record starting at `address`.
    ReadRecord {
        id: u64,
        address: Address,
        reply: Sender<IoCompletion>,
    },
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct IoCompletion {
    pub(crate) id: u64,
    pub(crate) address: Address,
    /// Record bytes, or `None` when the device holds no record at `address`.
    pub(crate) result: io::Result<Option<Vec<u8>>>,
}

/// Background reader for records below the head address.
pub(crate) struct PendingIoManager {
    tx: Sender<IoRequest>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PendingIoManager {
    pub(crate) fn new<D: StorageDevice>(device: Arc<D>, page_size: u64) -> io::Result<Self> {
        let (tx, rx) = unbounded::<IoRequest>();
        let worker = thread::Builder::new()
            .name("hybridkv-io".into())
            .spawn(move || {
                // Dedicated runtime: do not depend on the caller being inside a Tokio runtime.
                let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::warn!(error = %e, "pending io runtime failed to start");
                        while let Ok(IoRequest::ReadRecord { id, address, reply }) = rx.recv() {
                            let _ = reply.send(IoCompletion {
                                id,
                                address,
                                result: Err(io::Error::other(e.to_string())),
                            });
                        }
                        return;
                    }
                };

                while let Ok(request) = rx.recv() {
                    match request {
                        IoRequest::ReadRecord { id, address, reply } => {
                            let result = rt.block_on(read_record(device.as_ref(), address, page_size));
                            // The session may have been dropped with reads in flight.
                            let _ = reply.send(IoCompletion { id, address, result });
                        }
                        IoRequest::Shutdown => break,
                    }
                }
            })?;

        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a read of the record at `address`; the completion arrives on `reply`.
    pub(crate) fn submit_read(&self, id: u64, address: Address, reply: Sender<IoCompletion>) -> bool {
        self.tx
            .send(IoRequest::ReadRecord { id, address, reply })
            .is_ok()
    }
}

impl Drop for PendingIoManager {
    fn drop(&mut self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

async fn read_record<D: StorageDevice + ?Sized>(
    device: &D,
    address: Address,
    page_size: u64,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    let n = device.read(address.control(), &mut header).await?;
    if n != header.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {address}: expected {RECORD_HEADER_SIZE}, got {n}"),
        ));
    }
    let Some((_, key_len, value_len)) = RecordView::parse_header(&header) else {
        return Ok(None);
    };

    let total = record_size(key_len, value_len);
    if total as u64 > page_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record at {address} claims {total} bytes"),
        ));
    }
    let mut bytes = vec![0u8; total];
    let n = device.read(address.control(), &mut bytes).await?;
    if n != total {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {address}: expected {total}, got {n}"),
        ));
    }
    Ok(Some(bytes))
}
