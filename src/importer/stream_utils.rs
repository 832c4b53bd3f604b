/// Async/sync bridging for the download
///
/// The response body is pulled by an async task and pushed through a
/// byte-bounded channel; the decode chain reads it synchronously through
/// `ChannelReader`.
use std::io::{self, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::importer::byte_channel::{byte_bounded_channel, ByteBoundedReceiver, ByteBoundedSender};
use crate::importer::download_error::DownloadError;
use crate::importer::transform::SourceReader;

/// Maximum wait for the next body chunk before the transfer is declared dead
pub(crate) const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Typical reqwest chunk size, used to size the channel's item capacity
const AVG_CHUNK_SIZE_KB: usize = 16;

type Chunk = Result<Bytes, DownloadError>;

/// Response body of either backend, failures already classified
pub(crate) type BodyStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Reader that pulls bytes from the download channel
pub struct ChannelReader {
    rx: ByteBoundedReceiver<Chunk>,
    current: Option<Bytes>,
    offset: usize,
}

impl ChannelReader {
    pub fn new(rx: ByteBoundedReceiver<Chunk>) -> Self {
        Self {
            rx,
            current: None,
            offset: 0,
        }
    }

    fn close(&mut self) {
        self.current = None;
        self.rx.close();
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(ref data) = self.current {
                let remaining = &data[self.offset..];
                if !remaining.is_empty() {
                    let to_copy = remaining.len().min(buf.len());
                    buf[..to_copy].copy_from_slice(&remaining[..to_copy]);
                    self.offset += to_copy;
                    return Ok(to_copy);
                }
            }

            match self.rx.blocking_recv() {
                Some(Ok(data)) => {
                    self.current = Some(data);
                    self.offset = 0;
                }
                Some(Err(e)) => return Err(io::Error::other(e)),
                // Channel closed: the download finished
                None => return Ok(0),
            }
        }
    }
}

/// Backend connection feeding the bottom of a transform chain
pub struct DownloadSource {
    reader: ChannelReader,
    task: Option<JoinHandle<()>>,
    received: Arc<AtomicU64>,
}

impl DownloadSource {
    /// Start pulling `body` into a buffer of at most `buffer_bytes` bytes.
    pub(crate) fn spawn(body: BodyStream, buffer_bytes: usize) -> Self {
        let capacity = (buffer_bytes / (AVG_CHUNK_SIZE_KB * 1024)).max(16);
        let (tx, rx) = byte_bounded_channel::<Chunk>(buffer_bytes, capacity);
        let received = Arc::new(AtomicU64::new(0));

        tracing::debug!(buffer_bytes, capacity, "starting download task");
        let task = tokio::spawn(pump_body(body, tx, received.clone()));

        Self {
            reader: ChannelReader::new(rx),
            task: Some(task),
            received,
        }
    }

    /// Shared counter of raw bytes received from the backend
    pub fn received_counter(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }
}

impl Read for DownloadSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl SourceReader for DownloadSource {
    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.reader.close();
            tracing::debug!(
                bytes_received = self.received.load(Ordering::Relaxed),
                "backend connection closed"
            );
        }
    }
}

/// Forward body chunks until the body ends, fails or the reader goes away
async fn pump_body(mut body: BodyStream, tx: ByteBoundedSender<Chunk>, received: Arc<AtomicU64>) {
    loop {
        let next = match tokio::time::timeout(CHUNK_TIMEOUT, body.next()).await {
            Ok(Some(Ok(chunk))) => {
                received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Ok(chunk)
            }
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => break,
            Err(_) => Err(DownloadError::TimeoutError(format!(
                "no data received for {}s",
                CHUNK_TIMEOUT.as_secs()
            ))),
        };

        let failed = next.is_err();
        if tx.send(next).await.is_err() {
            tracing::debug!("data stream closed, stopping download");
            return;
        }
        if failed {
            return;
        }
    }
    tracing::debug!(
        bytes_received = received.load(Ordering::Relaxed),
        "download finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_reader_reassembles_chunks() {
        let (tx, rx) = byte_bounded_channel::<Chunk>(1024, 16);
        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        drop(tx);

        let out = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map(|_| out)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_download_source_counts_and_fails() {
        let body: BodyStream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
            Err(DownloadError::ConnectionError("connection reset".into())),
        ])
        .boxed();
        let mut source = DownloadSource::spawn(body, 1024);
        let received = source.received_counter();

        let (out, err) = tokio::task::spawn_blocking(move || {
            let mut out = [0u8; 7];
            source.read_exact(&mut out).unwrap();
            let err = source.read(&mut [0u8; 1]).unwrap_err();
            source.close();
            (out, err)
        })
        .await
        .unwrap();

        assert_eq!(&out, b"abcdefg");
        assert_eq!(received.load(Ordering::Relaxed), 7);
        let cause = crate::importer::error::download_cause(&err).cloned();
        assert!(matches!(cause, Some(DownloadError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_channel_reader_surfaces_download_error() {
        let (tx, rx) = byte_bounded_channel::<Chunk>(1024, 16);
        tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
        tx.send(Err(DownloadError::ConnectionError("connection reset".into())))
            .await
            .unwrap();

        let err = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            reader.read_to_end(&mut Vec::new()).unwrap_err()
        })
        .await
        .unwrap();

        let cause = crate::importer::error::download_cause(&err).cloned();
        assert!(matches!(cause, Some(DownloadError::ConnectionError(_))));
    }
}
