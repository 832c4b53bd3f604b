/// Byte-bounded channel between the async download and the blocking decoder
///
/// Wraps `mpsc::channel` with a `tokio::sync::Semaphore` so that the total
/// number of buffered bytes, not the number of chunks, is bounded. Chunk
/// sizes from reqwest vary widely, so an item-count bound alone does not
/// bound memory.
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};

use crate::importer::download_error::DownloadError;

/// Items that know their byte size
pub trait SizedItem {
    fn byte_size(&self) -> usize;
}

impl SizedItem for Bytes {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

/// A download chunk or the failure that ended the download
impl SizedItem for Result<Bytes, DownloadError> {
    fn byte_size(&self) -> usize {
        self.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

/// Sender half, used from the async download task
pub struct ByteBoundedSender<T: SizedItem> {
    inner: mpsc::Sender<T>,
    semaphore: Arc<Semaphore>,
    max_bytes: usize,
}

impl<T: SizedItem> ByteBoundedSender<T> {
    /// Send an item, waiting until enough byte budget is available.
    ///
    /// Acquires `min(item.byte_size(), max_bytes)` permits so a single
    /// oversized chunk can still pass through without deadlocking.
    pub async fn send(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        let permits_needed = item.byte_size().min(self.max_bytes) as u32;

        match self.semaphore.acquire_many(permits_needed).await {
            // The receiver returns the permits after consuming the item
            Ok(permit) => permit.forget(),
            Err(_) => return Err(mpsc::error::SendError(item)),
        }

        self.inner.send(item).await
    }
}

/// Receiver half, used from the blocking decode side
pub struct ByteBoundedReceiver<T: SizedItem> {
    inner: mpsc::Receiver<T>,
    semaphore: Arc<Semaphore>,
    max_bytes: usize,
}

impl<T: SizedItem> ByteBoundedReceiver<T> {
    /// Receive an item synchronously, releasing its byte budget.
    ///
    /// Must not be called from an async context.
    pub fn blocking_recv(&mut self) -> Option<T> {
        let item = self.inner.blocking_recv()?;
        self.semaphore
            .add_permits(item.byte_size().min(self.max_bytes));
        Some(item)
    }

    /// Stop accepting items and wake any sender waiting for budget
    pub fn close(&mut self) {
        self.inner.close();
        self.semaphore.close();
    }
}

/// Create a byte-bounded channel.
///
/// `max_bytes` is clamped to `u32::MAX` (the semaphore's permit type);
/// `max_items` bounds the number of queued chunks.
pub fn byte_bounded_channel<T: SizedItem>(
    max_bytes: usize,
    max_items: usize,
) -> (ByteBoundedSender<T>, ByteBoundedReceiver<T>) {
    let max_bytes = max_bytes.clamp(1, u32::MAX as usize);

    let (tx, rx) = mpsc::channel::<T>(max_items.max(1));
    let semaphore = Arc::new(Semaphore::new(max_bytes));

    let sender = ByteBoundedSender {
        inner: tx,
        semaphore: semaphore.clone(),
        max_bytes,
    };

    let receiver = ByteBoundedReceiver {
        inner: rx,
        semaphore,
        max_bytes,
    };

    (sender, receiver)
}
