use crate::Archive;
use crate::error::{Error, ErrorKind, Result};
use std::str::FromStr;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
#[cfg(feature = "xz")]
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
#[cfg(feature = "sevenz")]
const SEVENZ_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];
#[cfg(feature = "rar")]
const RAR_MAGIC: [u8; 6] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07];

impl FromStr for Archive {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zip" | "cbz" => Ok(Archive::Zip),
            #[cfg(feature = "xz")]
            "xz" => Ok(Archive::Xz),
            #[cfg(not(feature = "xz"))]
            "xz" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            #[cfg(feature = "sevenz")]
            "7z" | "cb7" => Ok(Archive::SevenZip),
            #[cfg(not(feature = "sevenz"))]
            "7z" | "cb7" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            #[cfg(feature = "rar")]
            "rar" | "cbr" => Ok(Archive::Rar),
            #[cfg(not(feature = "rar"))]
            "rar" | "cbr" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}

impl Archive {
    /// Detect an archive format from a declared MIME type.
    ///
    /// Returns `Ok(None)` for MIME types that aren't archives at all (images,
    /// text, ...). A recognised archive whose feature is disabled is a
    /// [`DisabledFormat`](ErrorKind::DisabledFormat) error rather than `None`,
    /// so callers can tell users why their upload was refused.
    ///
    /// ```
    /// use quire_archive::Archive;
    /// assert_eq!(Archive::from_mime("application/zip").unwrap(), Some(Archive::Zip));
    /// assert_eq!(Archive::from_mime("image/png").unwrap(), None);
    /// ```
    pub fn from_mime(mime: &str) -> Result<Option<Self>> {
        let essence = mime.split(';').next().unwrap_or_default().trim().to_lowercase();
        let name = match essence.as_str() {
            "application/zip" | "application/x-zip-compressed" => "zip",
            "application/x-xz" => "xz",
            "application/x-7z-compressed" => "7z",
            "application/x-rar-compressed" | "application/vnd.rar" => "rar",
            _ => return Ok(None),
        };
        name.parse().map(Some)
    }

    /// Detect an archive format from magic bytes.
    ///
    /// Clients are not always right about what they upload, so the content
    /// takes precedence over the declared MIME type once a file is known to
    /// be an archive. Returns `None` if no enabled format matches or if the
    /// input is too short to detect any format.
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&ZIP_MAGIC) || bytes.starts_with(&ZIP_EMPTY_MAGIC) {
            return Some(Archive::Zip);
        }
        #[cfg(feature = "xz")]
        if bytes.starts_with(&XZ_MAGIC) {
            return Some(Archive::Xz);
        }
        #[cfg(feature = "sevenz")]
        if bytes.starts_with(&SEVENZ_MAGIC) {
            return Some(Archive::SevenZip);
        }
        #[cfg(feature = "rar")]
        if bytes.starts_with(&RAR_MAGIC) {
            return Some(Archive::Rar);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::Archive;
    use crate::error::ErrorKind;
    use rstest::rstest;

    #[rstest]
    #[case("zip", Archive::Zip)]
    #[case("ZIP", Archive::Zip)]
    #[case("cbz", Archive::Zip)]
    #[cfg_attr(feature = "xz", case("xz", Archive::Xz))]
    #[cfg_attr(feature = "sevenz", case("7z", Archive::SevenZip))]
    #[cfg_attr(feature = "rar", case("cbr", Archive::Rar))]
    fn test_from_str(#[case] test: &str, #[case] expected: Archive) {
        assert_eq!(test.parse::<Archive>().unwrap(), expected);
    }

    #[rstest]
    #[case("tar")]
    #[case("gzip")]
    #[case(" ")]
    fn test_from_str_unsupported(#[case] test: &str) {
        let err = test.parse::<Archive>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[rstest]
    #[case("application/zip", Some(Archive::Zip))]
    #[case("application/x-zip-compressed", Some(Archive::Zip))]
    #[case("Application/Zip; charset=binary", Some(Archive::Zip))]
    #[cfg_attr(feature = "xz", case("application/x-xz", Some(Archive::Xz)))]
    #[cfg_attr(feature = "sevenz", case("application/x-7z-compressed", Some(Archive::SevenZip)))]
    #[cfg_attr(feature = "rar", case("application/x-rar-compressed", Some(Archive::Rar)))]
    #[cfg_attr(feature = "rar", case("application/vnd.rar", Some(Archive::Rar)))]
    #[case("image/jpeg", None)]
    #[case("text/plain", None)]
    #[case("", None)]
    fn test_from_mime(#[case] mime: &str, #[case] expected: Option<Archive>) {
        assert_eq!(Archive::from_mime(mime).unwrap(), expected);
    }

    #[cfg(not(feature = "rar"))]
    #[test]
    fn test_from_mime_disabled() {
        let err = Archive::from_mime("application/vnd.rar").unwrap_err();
        assert_eq!(*err, ErrorKind::DisabledFormat("rar".to_string()));
    }

    #[rstest]
    #[case(b"PK\x03\x04rest", Some(Archive::Zip))]
    #[case(b"PK\x05\x06", Some(Archive::Zip))]
    #[case(b"\x89PNG\r\n\x1a\n", None)]
    #[case(b"", None)]
    #[cfg_attr(feature = "xz", case(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00], Some(Archive::Xz)))]
    #[cfg_attr(feature = "sevenz", case(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00], Some(Archive::SevenZip)))]
    #[cfg_attr(feature = "rar", case(b"Rar!\x1A\x07\x01\x00", Some(Archive::Rar)))]
    fn test_from_magic_bytes(#[case] bytes: &[u8], #[case] expected: Option<Archive>) {
        assert_eq!(Archive::from_magic_bytes(bytes), expected);
    }
}
