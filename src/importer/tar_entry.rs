/// Streaming single-entry tar extraction
///
/// Walks tar headers over a forward-only reader and exposes the first disk
/// image entry as a plain reader. Nothing before the selected entry is
/// buffered; its payload is skipped block by block.
use std::io::{self, Read};
use std::path::Path;

use tar::{EntryType, Header, PaxExtensions};

use crate::importer::validation::is_valid_image_file;

const BLOCK_SIZE: u64 = 512;
const CHECKSUM_RANGE: std::ops::Range<usize> = 148..156;
/// Upper bound for GNU long-name and PAX metadata payloads
const MAX_METADATA_LEN: u64 = 64 * 1024;

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn padding(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

/// Header fields overridden by PAX extended records.
///
/// Writers that emit PAX (Python's `tarfile`, bsdtar) leave the ustar size
/// field at zero for entries of 8 GiB or more, so `size` must win over the
/// header whenever it is present.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct PaxOverrides {
    path: Option<String>,
    size: Option<u64>,
}

impl PaxOverrides {
    fn merge_records(&mut self, records: &[u8]) -> io::Result<()> {
        for extension in PaxExtensions::new(records) {
            let extension = extension?;
            let value = extension
                .value()
                .map_err(|_| invalid_data("PAX record value is not UTF-8"))?;
            match extension.key() {
                Ok("path") => self.path = Some(value.to_string()),
                Ok("size") => {
                    let size = value.trim().parse::<u64>().map_err(|_| {
                        invalid_data(format!("invalid PAX size record '{}'", value))
                    })?;
                    self.size = Some(size);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Local records first, global ones as fallback
    fn or(self, global: &PaxOverrides) -> PaxOverrides {
        PaxOverrides {
            path: self.path.or_else(|| global.path.clone()),
            size: self.size.or(global.size),
        }
    }
}

/// Reader over one tar entry's bytes
pub struct TarEntryReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> TarEntryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
        }
    }

    /// Advance to the first regular entry that names a disk image.
    ///
    /// Returns the entry's file name. Subsequent reads yield exactly that
    /// entry's contents.
    pub fn seek_disk_image(&mut self) -> io::Result<String> {
        let mut global = PaxOverrides::default();
        let mut local = PaxOverrides::default();
        let mut long_name: Option<String> = None;

        loop {
            let Some(header) = self.next_header()? else {
                return Err(invalid_data("no disk image found in tar archive"));
            };

            let entry_type = header.entry_type();
            let header_size = header.entry_size()?;

            if entry_type.is_gnu_longname() {
                long_name = Some(metadata_string(self.read_metadata(header_size)?));
                continue;
            }
            if entry_type.is_gnu_longlink() {
                self.read_metadata(header_size)?;
                continue;
            }
            if entry_type.is_pax_local_extensions() {
                local.merge_records(&self.read_metadata(header_size)?)?;
                continue;
            }
            if entry_type.is_pax_global_extensions() {
                global.merge_records(&self.read_metadata(header_size)?)?;
                continue;
            }

            // Overrides belong to this entry only
            let overrides = std::mem::take(&mut local).or(&global);
            let long_name = long_name.take();

            let size = overrides.size.unwrap_or(header_size);
            let path = match long_name.or(overrides.path) {
                Some(name) => name,
                None => header.path()?.to_string_lossy().into_owned(),
            };
            let file_name = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            tracing::debug!(entry = %path, size, ?entry_type, "tar entry");

            let candidate = matches!(entry_type, EntryType::Regular | EntryType::Continuous)
                && !file_name.starts_with('.')
                && is_valid_image_file(&file_name);

            if candidate {
                self.remaining = size;
                return Ok(file_name);
            }

            self.skip(size + padding(size))?;
        }
    }

    /// Read the next header block, `None` at the end-of-archive marker
    fn next_header(&mut self) -> io::Result<Option<Header>> {
        let mut header = Header::new_old();
        let block = header.as_mut_bytes();
        match self.inner.read_exact(block) {
            Ok(()) => {}
            // Archives truncated right after the last entry are tolerated
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        if block.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        verify_checksum(block)?;
        Ok(Some(header))
    }

    fn read_metadata(&mut self, size: u64) -> io::Result<Vec<u8>> {
        if size > MAX_METADATA_LEN {
            return Err(invalid_data(format!(
                "tar metadata entry too large ({} bytes)",
                size
            )));
        }
        let mut data = Vec::with_capacity(size as usize);
        (&mut self.inner).take(size).read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        self.skip(padding(size))?;
        Ok(data)
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let skipped = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())?;
        if skipped != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar archive ends inside an entry",
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for TarEntryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar archive ends inside the disk image entry",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// GNU long names are NUL-terminated
fn metadata_string(mut data: Vec<u8>) -> String {
    while data.last() == Some(&0) {
        data.pop();
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn verify_checksum(block: &[u8; 512]) -> io::Result<()> {
    let stored = std::str::from_utf8(&block[CHECKSUM_RANGE])
        .ok()
        .map(|s| s.trim_matches(|c: char| c == '\0' || c == ' '))
        .and_then(|s| u32::from_str_radix(s, 8).ok())
        .ok_or_else(|| invalid_data("corrupt tar header: unreadable checksum"))?;

    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if CHECKSUM_RANGE.contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(*b)
            }
        })
        .sum();

    if stored != computed {
        return Err(invalid_data(format!(
            "corrupt tar header: checksum {} does not match {}",
            stored, computed
        )));
    }
    Ok(())
}
