//! Disk-image format validation
//!
//! Names are validated by peeling wrapper suffixes (compression and archive
//! extensions, outermost first) and checking what is left against the set of
//! accepted terminal image formats. Decoded content is validated by sniffing
//! the leading bytes for a format signature and checking that it agrees with
//! the declared format.

use std::fmt;

use crate::importer::magic_bytes::Wrapper;

/// Accepted terminal disk-image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Iso,
    Vmdk,
    Vhd,
    Vhdx,
    Vdi,
}

impl ImageFormat {
    /// Format for a bare (wrapper-free) extension, without the dot
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "img" | "raw" => Some(ImageFormat::Raw),
            "qcow2" => Some(ImageFormat::Qcow2),
            "iso" => Some(ImageFormat::Iso),
            "vmdk" => Some(ImageFormat::Vmdk),
            "vhd" => Some(ImageFormat::Vhd),
            "vhdx" => Some(ImageFormat::Vhdx),
            "vdi" => Some(ImageFormat::Vdi),
            _ => None,
        }
    }

    /// Whether content sniffed as `detected` satisfies this declared format.
    ///
    /// `None` means no signature was found in the header.
    pub fn accepts(self, detected: Option<ImageFormat>) -> bool {
        match self {
            // ISO 9660 images are plain sector dumps
            ImageFormat::Raw => matches!(detected, None | Some(ImageFormat::Iso)),
            // fixed VHDs only carry their footer at the end of the file
            ImageFormat::Vhd => matches!(detected, None | Some(ImageFormat::Vhd)),
            declared => detected == Some(declared),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Iso => "iso",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vdi => "vdi",
        };
        write!(f, "{}", name)
    }
}

/// Wrapper suffixes in matching order. Combined forms come first so that
/// `.tgz` is not mistaken for an unknown extension.
const WRAPPER_SUFFIXES: &[(&str, Wrapper, &str)] = &[
    (".tgz", Wrapper::Gzip, ".tar"),
    (".txz", Wrapper::Xz, ".tar"),
    (".gz", Wrapper::Gzip, ""),
    (".xz", Wrapper::Xz, ""),
    (".tar", Wrapper::Tar, ""),
];

/// Remove the outermost wrapper suffix if `name` ends with one.
///
/// Returns the wrapper and the remaining name (`disk.img.tgz` becomes
/// `disk.img.tar`).
pub fn strip_outer_suffix(name: &str) -> Option<(Wrapper, String)> {
    let lower = name.to_ascii_lowercase();
    WRAPPER_SUFFIXES
        .iter()
        .find(|(suffix, _, _)| lower.ends_with(suffix) && lower.len() > suffix.len())
        .map(|(suffix, wrapper, replacement)| {
            let stem = &name[..name.len() - suffix.len()];
            (*wrapper, format!("{}{}", stem, replacement))
        })
}

/// Remove a specific wrapper's suffix, used after a stage has been decoded.
pub fn strip_suffix_for(name: &str, wrapper: Wrapper) -> Option<String> {
    strip_outer_suffix(name)
        .filter(|(found, _)| *found == wrapper)
        .map(|(_, rest)| rest)
}

/// Declared terminal format of a file name after stripping every wrapper
/// suffix.
pub fn declared_format(name: &str) -> Option<ImageFormat> {
    let mut current = name.to_string();
    while let Some((_, rest)) = strip_outer_suffix(&current) {
        current = rest;
    }

    if current.starts_with('.') {
        return None;
    }
    let (stem, ext) = current.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    ImageFormat::from_extension(ext)
}

/// Whether a base name denotes an accepted (possibly wrapped) disk image
pub fn is_valid_image_file(name: &str) -> bool {
    declared_format(name).is_some()
}

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";
const VMDK_SPARSE_MAGIC: &[u8] = b"KDMV";
const VMDK_DESCRIPTOR_MAGIC: &[u8] = b"# Disk DescriptorFile";
const VHDX_MAGIC: &[u8] = b"vhdxfile";
const VHD_MAGIC: &[u8] = b"conectix";
const VDI_MAGIC_OFFSET: usize = 64;
const VDI_MAGIC: [u8; 4] = 0xbeda_107f_u32.to_le_bytes();
const ISO_MAGIC_OFFSET: usize = 32769;
const ISO_MAGIC: &[u8] = b"CD001";

/// Minimum header length needed to recognise every supported signature
pub const SNIFF_LEN: usize = ISO_MAGIC_OFFSET + ISO_MAGIC.len();

fn has_magic_at(data: &[u8], offset: usize, magic: &[u8]) -> bool {
    data.get(offset..offset + magic.len())
        .map(|found| found == magic)
        .unwrap_or(false)
}

/// Identify the image format from its leading bytes
pub fn sniff_format(header: &[u8]) -> Option<ImageFormat> {
    if header.starts_with(QCOW2_MAGIC) {
        Some(ImageFormat::Qcow2)
    } else if header.starts_with(VMDK_SPARSE_MAGIC) || header.starts_with(VMDK_DESCRIPTOR_MAGIC) {
        Some(ImageFormat::Vmdk)
    } else if header.starts_with(VHDX_MAGIC) {
        Some(ImageFormat::Vhdx)
    } else if header.starts_with(VHD_MAGIC) {
        Some(ImageFormat::Vhd)
    } else if has_magic_at(header, VDI_MAGIC_OFFSET, &VDI_MAGIC) {
        Some(ImageFormat::Vdi)
    } else if has_magic_at(header, ISO_MAGIC_OFFSET, ISO_MAGIC) {
        Some(ImageFormat::Iso)
    } else {
        None
    }
}
