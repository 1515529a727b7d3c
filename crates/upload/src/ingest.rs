//! Turning uploaded files into normalised pages.
//!
//! A batch is fully prepared before anything is persisted: every file is
//! classified up front, then archives are extracted and every image is
//! decoded and re-encoded into a scratch directory. Only a batch that made it
//! all the way through is handed back for persisting, so a bad file anywhere
//! in it leaves no trace in the content store or the records.

use crate::codec;
use crate::error::{ErrorKind, Rejection, Result};
use crate::models::Upload;
use crate::pool::BlockingPool;
use crate::staging::Workspace;
use exn::ResultExt;
use quire_archive::Archive;
use quire_archive::error::ErrorKind as ArchiveErrorKind;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// File extensions kept when extracting archives. Anything else inside an
/// archive (text files, thumbnails databases, ...) is skipped.
const IMAGE_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "bmp", "webp"];
const FALLBACK_NAME: &str = "upload";

/// How an upload is ingested, based on its declared MIME type.
///
/// Once an upload is accepted as an archive, the format actually used for
/// extraction is sniffed from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Archive(Archive),
    Image,
}
impl UploadKind {
    pub fn classify(upload: &Upload) -> Result<Self> {
        let unsupported = || ErrorKind::from(Rejection::UnsupportedFileType(upload.filename.clone()));
        match Archive::from_mime(&upload.mime) {
            Ok(Some(archive)) => Ok(Self::Archive(archive)),
            Ok(None) if upload.mime.trim().to_ascii_lowercase().starts_with("image/") => Ok(Self::Image),
            Ok(None) => exn::bail!(unsupported()),
            // A known archive format that this build can't open.
            Err(e) => Err(e).or_raise(unsupported),
        }
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| IMAGE_EXTENSIONS.iter().any(|known| extension.eq_ignore_ascii_case(known)))
}

/// Final component of a client-supplied file name, whichever separator the
/// client used.
pub fn file_name(raw: &str) -> String {
    match raw.rsplit(['/', '\\']).next().map(str::trim) {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_string(),
        _ => FALLBACK_NAME.to_string(),
    }
}

/// A normalised JPEG waiting in scratch to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPage {
    /// Display name, taken from the uploaded (or extracted) file.
    pub name: String,
    pub path: PathBuf,
}

/// A fully prepared batch. The scratch directory holding the pages is
/// removed when the batch is dropped.
#[derive(Debug)]
pub struct Batch {
    pages: Vec<PreparedPage>,
    _ready: TempDir,
}
impl Batch {
    pub fn pages(&self) -> &[PreparedPage] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Scratch directories shared by the jobs of one batch.
#[derive(Debug, Clone)]
struct Scratch {
    archives: PathBuf,
    raw: PathBuf,
    ready: PathBuf,
}

/// Classify, unpack and normalise `uploads`, in order.
///
/// Pages come back in upload order; pages from an archive keep the archive's
/// sorted order at the archive's position in the batch.
#[tracing::instrument(skip_all, fields(session = %workspace.session_id(), uploads = uploads.len()))]
pub async fn prepare(pool: &BlockingPool, workspace: &Workspace, uploads: Vec<Upload>, quality: u8) -> Result<Batch> {
    let kinds = uploads.iter().map(UploadKind::classify).collect::<Result<Vec<_>>>()?;

    let archives = workspace.scratch_archive()?;
    let raw = workspace.scratch_files()?;
    let ready = workspace.scratch_files()?;
    let scratch = Scratch {
        archives: archives.path().to_path_buf(),
        raw: raw.path().to_path_buf(),
        ready: ready.path().to_path_buf(),
    };

    let jobs = uploads.into_iter().zip(kinds).enumerate().map(|(index, (upload, kind))| {
        let scratch = scratch.clone();
        pool.run(move || prepare_one(index, upload, kind, &scratch, quality))
    });
    // Wait for every job, even after a failure, so none is still writing
    // into the scratch directories when they are removed.
    let results = futures::future::join_all(jobs).await;
    let pages = results.into_iter().collect::<Result<Vec<_>>>()?.into_iter().flatten().collect::<Vec<_>>();
    tracing::debug!(pages = pages.len(), "Prepared upload batch");
    Ok(Batch { pages, _ready: ready })
}

fn prepare_one(
    index: usize,
    upload: Upload,
    kind: UploadKind,
    scratch: &Scratch,
    quality: u8,
) -> Result<Vec<PreparedPage>> {
    let name = file_name(&upload.filename);
    let raw_dir = scratch.raw.join(index.to_string());
    fs::create_dir(&raw_dir).or_raise(|| ErrorKind::Staging)?;

    let sources = match kind {
        UploadKind::Image => {
            let path = raw_dir.join(&name);
            fs::write(&path, &upload.data).or_raise(|| ErrorKind::Staging)?;
            vec![(name, path)]
        },
        UploadKind::Archive(declared) => {
            let format = Archive::from_magic_bytes(&upload.data).unwrap_or(declared);
            if format != declared {
                tracing::debug!(
                    file = %name,
                    %declared,
                    detected = %format,
                    "Archive content differs from its MIME type"
                );
            }
            let archive = scratch.archives.join(format!("{index}-{name}"));
            fs::write(&archive, &upload.data).or_raise(|| ErrorKind::Staging)?;
            let extracted = match format.extract(&archive, &raw_dir) {
                Ok(extracted) => extracted,
                Err(e) if matches!(&*e, ArchiveErrorKind::InvalidData) => {
                    Err(e).or_raise(|| ErrorKind::from(Rejection::UnreadableArchive(name.clone())))?
                },
                Err(e) => Err(e).or_raise(|| ErrorKind::Archive)?,
            };
            _ = fs::remove_file(&archive);
            extracted
                .into_iter()
                .filter(|path| has_image_extension(path))
                .map(|path| (path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(), path))
                .collect()
        },
    };

    let mut pages = Vec::with_capacity(sources.len());
    for (position, (name, source)) in sources.into_iter().enumerate() {
        let data = fs::read(&source).or_raise(|| ErrorKind::Staging)?;
        let jpeg = codec::normalize(&data, &name, quality)?;
        let path = scratch.ready.join(format!("{index:05}-{position:05}.jpg"));
        fs::write(&path, jpeg).or_raise(|| ErrorKind::Staging)?;
        _ = fs::remove_file(&source);
        pages.push(PreparedPage { name, path });
    }
    Ok(pages)
}
