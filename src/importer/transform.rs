//! Transform chain construction
//!
//! A chain is a strictly nested set of decode stages: every stage owns the
//! stage beneath it, the bottom stage owns the backend connection. Each
//! level is sniffed through a bounded push-back buffer, and a new stage is
//! stacked whenever the sniffed bytes carry a known wrapper signature.
//!
//! Closing a stage releases its own decoder first and then closes what it
//! owns, so the backend connection is always released last.

use std::fmt;
use std::io::{self, Read};

use flate2::read::MultiGzDecoder;
use xz2::read::XzDecoder;

use crate::importer::error::ImportError;
use crate::importer::magic_bytes::{detect_wrapper, Wrapper};
use crate::importer::peek::PeekReader;
use crate::importer::tar_entry::TarEntryReader;
use crate::importer::validation::{sniff_format, strip_suffix_for, ImageFormat, SNIFF_LEN};

/// Default maximum number of decode stages in one chain
pub const MAX_CHAIN_DEPTH: usize = 4;

/// Bytes buffered at each level to recognise wrapper and image signatures
pub const HEADER_PEEK_LEN: usize = 64 * 1024;

const _: () = assert!(HEADER_PEEK_LEN >= SNIFF_LEN);

/// Raw byte source at the bottom of a chain (a backend connection)
pub trait SourceReader: Read + Send {
    /// Release the underlying connection. Called at most once.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Backend bytes passed through unchanged
    Identity,
    Gzip,
    Xz,
    Tar,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Identity => write!(f, "identity"),
            StageKind::Gzip => write!(f, "gzip"),
            StageKind::Xz => write!(f, "xz"),
            StageKind::Tar => write!(f, "tar"),
        }
    }
}

type Upstream = PeekReader<Stage>;

enum StageReader {
    Source(Box<dyn SourceReader>),
    Gzip(Box<MultiGzDecoder<Upstream>>),
    Xz(Box<XzDecoder<Upstream>>),
    Tar(Box<TarEntryReader<Upstream>>),
}

/// One decode layer, owning everything beneath it
pub struct Stage {
    kind: StageKind,
    reader: Option<StageReader>,
}

impl Stage {
    pub fn source(source: Box<dyn SourceReader>) -> Self {
        Self::with(StageKind::Identity, StageReader::Source(source))
    }

    fn gzip(upstream: Upstream) -> Self {
        Self::with(
            StageKind::Gzip,
            StageReader::Gzip(Box::new(MultiGzDecoder::new(upstream))),
        )
    }

    fn xz(upstream: Upstream) -> Self {
        Self::with(
            StageKind::Xz,
            StageReader::Xz(Box::new(XzDecoder::new(upstream))),
        )
    }

    fn tar(entry: TarEntryReader<Upstream>) -> Self {
        Self::with(StageKind::Tar, StageReader::Tar(Box::new(entry)))
    }

    fn with(kind: StageKind, reader: StageReader) -> Self {
        tracing::debug!(stage = %kind, "transform stage opened");
        Self {
            kind,
            reader: Some(reader),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Close this stage and every stage beneath it, outermost first.
    ///
    /// Idempotent: later calls do nothing.
    pub fn close(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        tracing::debug!(stage = %self.kind, "closing transform stage");

        // Dropping the decoder before touching its upstream keeps the
        // release order outermost-first.
        let mut upstream = match reader {
            StageReader::Source(mut source) => {
                source.close();
                return;
            }
            StageReader::Gzip(decoder) => (*decoder).into_inner(),
            StageReader::Xz(decoder) => (*decoder).into_inner(),
            StageReader::Tar(entry) => (*entry).into_inner(),
        };
        upstream.get_mut().close();
    }
}

impl Read for Stage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(StageReader::Source(source)) => source.read(buf),
            Some(StageReader::Gzip(decoder)) => decoder.read(buf),
            Some(StageReader::Xz(decoder)) => decoder.read(buf),
            Some(StageReader::Tar(entry)) => entry.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} stage is closed", self.kind),
            )),
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fully built chain: the outermost stage with its sniffed header still
/// buffered, plus what was learned while building it.
pub struct TransformChain {
    pub head: PeekReader<Stage>,
    /// Decode stages applied, outermost last
    pub stages: Vec<StageKind>,
    /// Declared name of the terminal payload
    pub name: String,
    /// Image signature found in the terminal header
    pub detected: Option<ImageFormat>,
}

/// Close a partially built chain and hand back the error
fn abandon(mut head: Upstream, error: ImportError) -> ImportError {
    head.get_mut().close();
    error
}

/// Build the decode chain over `source` with the default depth bound.
pub fn build_chain(
    source: Box<dyn SourceReader>,
    declared_name: &str,
) -> Result<TransformChain, ImportError> {
    build_chain_with_depth(source, declared_name, MAX_CHAIN_DEPTH)
}

/// Build the decode chain over `source`.
///
/// `declared_name` is a hint: stage selection follows the magic bytes, the
/// name is only rewritten as wrappers are peeled off. Fails with
/// `ChainTooDeep` once more than `max_depth` wrappers are found; everything
/// opened so far is closed before any error is returned.
pub fn build_chain_with_depth(
    source: Box<dyn SourceReader>,
    declared_name: &str,
    max_depth: usize,
) -> Result<TransformChain, ImportError> {
    let mut name = declared_name.to_string();
    let mut stages = Vec::new();
    let mut current = Stage::source(source);

    loop {
        let mut head = PeekReader::new(current);
        let wrapper = match head.peek(HEADER_PEEK_LEN) {
            Ok(header) => detect_wrapper(header),
            Err(e) => return Err(abandon(head, ImportError::from_read(e))),
        };

        let Some(wrapper) = wrapper else {
            let detected = sniff_format(head.buffered());
            tracing::debug!(
                stages = ?stages,
                name = %name,
                detected = ?detected,
                "transform chain complete"
            );
            return Ok(TransformChain {
                head,
                stages,
                name,
                detected,
            });
        };

        if stages.len() >= max_depth {
            return Err(abandon(head, ImportError::ChainTooDeep(max_depth)));
        }

        let (stage, kind) = match wrapper {
            Wrapper::Gzip => (Stage::gzip(head), StageKind::Gzip),
            Wrapper::Xz => (Stage::xz(head), StageKind::Xz),
            Wrapper::Zstd => {
                return Err(abandon(
                    head,
                    ImportError::Decode("zstd-compressed sources are not supported".to_string()),
                ));
            }
            Wrapper::Tar => {
                let mut entry = TarEntryReader::new(head);
                match entry.seek_disk_image() {
                    Ok(entry_name) => {
                        tracing::info!(entry = %entry_name, "found disk image in tar archive");
                        name = entry_name;
                        (Stage::tar(entry), StageKind::Tar)
                    }
                    Err(e) => {
                        return Err(abandon(entry.into_inner(), ImportError::from_read(e)));
                    }
                }
            }
        };

        if kind != StageKind::Tar {
            match strip_suffix_for(&name, wrapper) {
                Some(rest) => name = rest,
                None => tracing::warn!(
                    name = %name,
                    encoding = %wrapper,
                    "content is {}-encoded but the name does not say so",
                    wrapper
                ),
            }
        }

        stages.push(kind);
        current = stage;
    }
}
