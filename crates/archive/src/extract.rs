use crate::Archive;
use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

/// An extracted entry: its flattened name inside the archive and where it
/// was written.
type Entry = (OsString, PathBuf);

impl Archive {
    /// Extract every regular file of `archive` into `out_dir`.
    ///
    /// Directory structure inside the archive is flattened: each entry is
    /// written under its final path component, so nothing can be written
    /// outside `out_dir`. The returned paths are sorted by entry file name,
    /// giving a stable page order regardless of how the archive was built.
    /// Entries sharing a file name are written with a numeric suffix
    /// (`1.jpg`, `1-1.jpg`, ...) and stay together in archive order.
    ///
    /// `xz` holds a single compressed stream rather than a file listing; it is
    /// decompressed to the archive's own name with the `.xz` extension
    /// stripped.
    #[tracing::instrument(skip_all, fields(format = %self, archive = %archive.as_ref().display()))]
    pub fn extract(&self, archive: impl AsRef<Path>, out_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let (archive, out_dir) = (archive.as_ref(), out_dir.as_ref());
        fs::create_dir_all(out_dir).or_raise(|| ErrorKind::Io)?;
        let mut extracted = match self {
            Archive::Zip => extract_zip(archive, out_dir)?,
            #[cfg(feature = "xz")]
            Archive::Xz => extract_xz(archive, out_dir)?,
            #[cfg(feature = "sevenz")]
            Archive::SevenZip => extract_sevenz(archive, out_dir)?,
            #[cfg(feature = "rar")]
            Archive::Rar => extract_rar(archive, out_dir)?,
        };
        // Stable, so duplicate names keep their archive order.
        extracted.sort_by(|(a, _), (b, _)| a.cmp(b));
        tracing::debug!(entries = extracted.len(), "Extracted archive");
        Ok(extracted.into_iter().map(|(_, path)| path).collect())
    }
}

/// Final normal component of an entry path, or `None` if there isn't one
/// (`..`, `/`, empty names).
fn flat_name(entry: &Path) -> Option<OsString> {
    entry
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) if !name.as_encoded_bytes().contains(&0) => Some(name.to_os_string()),
            _ => None,
        })
        .next_back()
}

/// Pick a path in `out_dir` for `name` that isn't taken yet.
fn unique_destination(out_dir: &Path, name: &OsString) -> PathBuf {
    let candidate = out_dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let original = Path::new(name);
    let stem = original.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = original.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    (1..)
        .map(|n| out_dir.join(format!("{stem}-{n}{extension}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn write_entry(reader: &mut dyn Read, entry: &Path, out_dir: &Path) -> Result<Option<Entry>> {
    let Some(name) = flat_name(entry) else {
        tracing::warn!(entry = %entry.display(), "Skipping archive entry without a usable name");
        return Ok(None);
    };
    let destination = unique_destination(out_dir, &name);
    let mut file = File::create(&destination).or_raise(|| ErrorKind::Io)?;
    io::copy(reader, &mut file).or_raise(|| ErrorKind::InvalidData)?;
    Ok(Some((name, destination)))
}

fn extract_zip(archive: &Path, out_dir: &Path) -> Result<Vec<Entry>> {
    let file = File::open(archive).or_raise(|| ErrorKind::Io)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).or_raise(|| ErrorKind::InvalidData)?;
    let mut extracted = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).or_raise(|| ErrorKind::InvalidData)?;
        if !entry.is_file() {
            continue;
        }
        let name = PathBuf::from(entry.name());
        extracted.extend(write_entry(&mut entry, &name, out_dir)?);
    }
    Ok(extracted)
}

#[cfg(feature = "xz")]
fn extract_xz(archive: &Path, out_dir: &Path) -> Result<Vec<Entry>> {
    let file = File::open(archive).or_raise(|| ErrorKind::Io)?;
    let name = archive.file_stem().ok_or_raise(|| ErrorKind::InvalidData)?;
    let mut decoder = xz2::read::XzDecoder::new(BufReader::new(file));
    Ok(write_entry(&mut decoder, Path::new(name), out_dir)?.into_iter().collect())
}

#[cfg(feature = "sevenz")]
fn extract_sevenz(archive: &Path, out_dir: &Path) -> Result<Vec<Entry>> {
    let mut extracted = Vec::new();
    let mut failure = None;
    sevenz_rust::decompress_file_with_extract_fn(archive, out_dir, |entry, reader, _dest| {
        if entry.is_directory() || failure.is_some() {
            return Ok(true);
        }
        match write_entry(reader, Path::new(entry.name()), out_dir) {
            Ok(entry) => extracted.extend(entry),
            Err(e) => failure = Some(e),
        }
        Ok(true)
    })
    .or_raise(|| ErrorKind::InvalidData)?;
    match failure {
        Some(e) => Err(e),
        None => Ok(extracted),
    }
}

#[cfg(feature = "rar")]
fn extract_rar(archive: &Path, out_dir: &Path) -> Result<Vec<Entry>> {
    let mut extracted = Vec::new();
    let mut cursor = unrar::Archive::new(archive)
        .open_for_processing()
        .or_raise(|| ErrorKind::InvalidData)?;
    while let Some(header) = cursor.read_header().or_raise(|| ErrorKind::InvalidData)? {
        let entry = header.entry();
        cursor = match (entry.is_file(), flat_name(&entry.filename)) {
            (true, Some(name)) => {
                let destination = unique_destination(out_dir, &name);
                let next = header.extract_to(&destination).or_raise(|| ErrorKind::InvalidData)?;
                extracted.push((name, destination));
                next
            },
            _ => header.skip().or_raise(|| ErrorKind::InvalidData)?,
        };
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn build_zip(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("chapter.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(data.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
        path
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect()
    }

    #[rstest]
    #[case("1.jpg", Some("1.jpg"))]
    #[case("nested/dir/2.png", Some("2.png"))]
    #[case("../../etc/passwd", Some("passwd"))]
    #[case("/absolute/3.webp", Some("3.webp"))]
    #[case("..", None)]
    #[case("", None)]
    fn test_flat_name(#[case] entry: &str, #[case] expected: Option<&str>) {
        assert_eq!(flat_name(Path::new(entry)), expected.map(OsString::from));
    }

    #[test]
    fn test_extract_zip_sorted_and_flattened() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let archive = build_zip(src.path(), &[
            ("pages/", ""),
            ("pages/3.jpg", "three"),
            ("1.jpg", "one"),
            ("pages/2.jpg", "two"),
        ]);
        let extracted = Archive::Zip.extract(&archive, out.path()).unwrap();
        assert_eq!(names(&extracted), vec!["1.jpg", "2.jpg", "3.jpg"]);
        assert!(extracted.iter().all(|p| p.parent() == Some(out.path())));
        assert_eq!(fs::read(&extracted[2]).unwrap(), b"three");
    }

    #[test]
    fn test_extract_zip_name_collisions() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let archive = build_zip(src.path(), &[("b/2.jpg", "2"), ("a/1.jpg", "a"), ("b/1.jpg", "b"), ("c/1.jpg", "c")]);
        let extracted = Archive::Zip.extract(&archive, out.path()).unwrap();
        assert_eq!(names(&extracted), vec!["1.jpg", "1-1.jpg", "1-2.jpg", "2.jpg"]);
        let contents = extracted.iter().map(|path| fs::read(path).unwrap()).collect::<Vec<_>>();
        assert_eq!(contents, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_extract_zip_traversal_stays_inside() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let archive = build_zip(src.path(), &[("../../escape.jpg", "nope")]);
        let extracted = Archive::Zip.extract(&archive, out.path()).unwrap();
        assert_eq!(extracted, vec![out.path().join("escape.jpg")]);
    }

    #[test]
    fn test_extract_corrupt_zip() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("broken.zip");
        fs::write(&path, b"PK\x03\x04 definitely not a zip").unwrap();
        let err = Archive::Zip.extract(&path, src.path().join("out")).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData);
    }

    #[cfg(feature = "xz")]
    #[test]
    fn test_extract_xz_strips_extension() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = src.path().join("page.png.xz");
        let mut encoder = xz2::write::XzEncoder::new(File::create(&path).unwrap(), 6);
        encoder.write_all(b"pixels").unwrap();
        encoder.finish().unwrap();
        let extracted = Archive::Xz.extract(&path, out.path()).unwrap();
        assert_eq!(extracted, vec![out.path().join("page.png")]);
        assert_eq!(fs::read(&extracted[0]).unwrap(), b"pixels");
    }

    /// Both fixtures hold `pages/3.jpg`, `1.jpg` and `pages/2.jpg`, in that
    /// order. The rar one also has an entry for the `pages` directory.
    #[cfg(any(feature = "sevenz", feature = "rar"))]
    fn assert_fixture_pages(extracted: &[PathBuf], out_dir: &Path) {
        assert_eq!(names(extracted), vec!["1.jpg", "2.jpg", "3.jpg"]);
        assert!(extracted.iter().all(|p| p.parent() == Some(out_dir)));
        let contents = extracted.iter().map(|path| fs::read(path).unwrap()).collect::<Vec<_>>();
        assert_eq!(contents, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[cfg(feature = "sevenz")]
    #[test]
    fn test_extract_sevenz_sorted_and_flattened() {
        let out = TempDir::new().unwrap();
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/pages.7z");
        let extracted = Archive::SevenZip.extract(&fixture, out.path()).unwrap();
        assert_fixture_pages(&extracted, out.path());
    }

    #[cfg(feature = "sevenz")]
    #[test]
    fn test_extract_corrupt_sevenz() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("broken.7z");
        fs::write(&path, [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04, 0xFF]).unwrap();
        let err = Archive::SevenZip.extract(&path, src.path().join("out")).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData);
    }

    #[cfg(feature = "rar")]
    #[test]
    fn test_extract_rar_sorted_and_flattened() {
        let out = TempDir::new().unwrap();
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/pages.rar");
        let extracted = Archive::Rar.extract(&fixture, out.path()).unwrap();
        assert_fixture_pages(&extracted, out.path());
    }

    #[cfg(feature = "rar")]
    #[test]
    fn test_extract_corrupt_rar() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("broken.rar");
        fs::write(&path, b"Rar!\x1a\x07\x00 definitely not a rar").unwrap();
        let err = Archive::Rar.extract(&path, src.path().join("out")).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData);
    }
}
