/// Magic byte detection for wrapper encodings
///
/// Identifies the outermost compression or archive layer of a stream from
/// its leading bytes (file signatures).
use std::fmt;

/// Encoding layered around the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    Xz,
    /// Zstandard compression (.zst), recognised but not decodable
    Zstd,
    /// POSIX ustar archive (.tar)
    Tar,
}

impl fmt::Display for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wrapper::Gzip => write!(f, "gzip"),
            Wrapper::Xz => write!(f, "xz"),
            Wrapper::Zstd => write!(f, "zstd"),
            Wrapper::Tar => write!(f, "tar"),
        }
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = *b"\xfd7zXZ\x00";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Tar archives have "ustar" magic at offset 257 (POSIX ustar and GNU tar)
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC_USTAR: &[u8] = b"ustar";

/// Check if data appears to be a tar archive
pub fn is_tar_archive(data: &[u8]) -> bool {
    data.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC_USTAR.len())
        .map(|magic| magic == TAR_MAGIC_USTAR)
        .unwrap_or(false)
}

/// Detect the outermost wrapper from magic bytes.
///
/// Returns `None` when no known signature matches, i.e. the data is the
/// terminal payload.
pub fn detect_wrapper(data: &[u8]) -> Option<Wrapper> {
    if data.starts_with(&GZIP_MAGIC) {
        Some(Wrapper::Gzip)
    } else if data.starts_with(&XZ_MAGIC) {
        Some(Wrapper::Xz)
    } else if data.starts_with(&ZSTD_MAGIC) {
        Some(Wrapper::Zstd)
    } else if is_tar_archive(data) {
        Some(Wrapper::Tar)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_gzip() {
        let gzip_magic = [0x1f, 0x8b, 0x08, 0x00];
        assert_eq!(detect_wrapper(&gzip_magic), Some(Wrapper::Gzip));
    }

    #[test]
    fn test_detect_xz() {
        assert_eq!(detect_wrapper(b"\xfd7zXZ\x00\x00\x04"), Some(Wrapper::Xz));
    }

    #[test]
    fn test_detect_zstd() {
        let zstd_magic = [0x28, 0xb5, 0x2f, 0xfd];
        assert_eq!(detect_wrapper(&zstd_magic), Some(Wrapper::Zstd));
    }

    #[test]
    fn test_detect_none() {
        assert_eq!(detect_wrapper(&[0x00, 0x01, 0x02, 0x03]), None);
        assert_eq!(detect_wrapper(b"QFI\xfb"), None);
        assert_eq!(detect_wrapper(&[]), None);
    }

    #[test]
    fn test_is_tar() {
        let mut tar_data = vec![0u8; 512];
        tar_data[257..263].copy_from_slice(b"ustar\0");
        assert!(is_tar_archive(&tar_data));
        assert_eq!(detect_wrapper(&tar_data), Some(Wrapper::Tar));

        // GNU tar writes "ustar  \0"
        tar_data[257..265].copy_from_slice(b"ustar  \0");
        assert!(is_tar_archive(&tar_data));
    }

    #[test]
    fn test_truncated_tar_header() {
        assert!(!is_tar_archive(&[0u8; 260]));
    }
}
