//! Archive detection and extraction for uploaded page bundles.
//!
//! Uploads may arrive as a single image or as an archive of images. This
//! crate wraps the archive libraries behind a unified [`Archive`] enum,
//! providing:
//!
//! - **Format detection** from declared MIME types ([`Archive::from_mime`])
//!   or from the content itself ([`Archive::from_magic_bytes`])
//! - **Extraction** into a flat directory ([`Archive::extract`]), with entry
//!   names sanitised and the output sorted by file name
//!
//! Zip is always available. XZ, 7z and RAR are behind feature flags, all
//! enabled by default. `rar` builds the bundled C++ unrar library; turn off
//! default features to build without a C++ toolchain.
//!
//! Extraction is blocking. Async callers should run it on a blocking thread.

mod construct;
pub mod error;
mod extract;

use std::fmt::{Display, Formatter, Result as FmtResult};

/// A supported archive format.
///
/// Variants gated behind feature flags (`xz`, `sevenz`, `rar`) are only
/// available when the corresponding feature is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Archive {
    /// Zip archive (.zip, .cbz)
    Zip,
    /// Single XZ-compressed file (.xz)
    #[cfg(feature = "xz")]
    Xz,
    /// 7-Zip archive (.7z, .cb7)
    #[cfg(feature = "sevenz")]
    SevenZip,
    /// RAR archive (.rar, .cbr)
    #[cfg(feature = "rar")]
    Rar,
}

impl Archive {
    /// Returns the short name for this format (for displaying to user).
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Archive::Zip => "zip",
            #[cfg(feature = "xz")]
            Archive::Xz => "xz",
            #[cfg(feature = "sevenz")]
            Archive::SevenZip => "7z",
            #[cfg(feature = "rar")]
            Archive::Rar => "rar",
        }
    }
}

impl Display for Archive {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use crate::Archive;

    #[test]
    fn archive_display() {
        assert_eq!(Archive::Zip.to_string(), "zip");
        assert_eq!(Archive::Zip.as_str().parse::<Archive>().unwrap(), Archive::Zip);
    }
}
