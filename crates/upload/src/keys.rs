//! Content store key layout.
//!
//! - `blobs/{blob_id}.jpg`: staged page content, owned by an upload session
//! - `{manga_id}/{chapter_id}/{n}.jpg`: published page `n` (1-indexed)

use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const BLOB_PREFIX: &str = "blobs";
const EXTENSION: &str = "jpg";

pub fn blob_key(id: Uuid) -> PathBuf {
    Path::new(BLOB_PREFIX).join(format!("{id}.{EXTENSION}"))
}

pub fn chapter_prefix(manga_id: Uuid, chapter_id: Uuid) -> PathBuf {
    Path::new(&manga_id.to_string()).join(chapter_id.to_string())
}

/// Key of page `number` (1-indexed) of a chapter.
pub fn page_key(manga_id: Uuid, chapter_id: Uuid, number: usize) -> PathBuf {
    chapter_prefix(manga_id, chapter_id).join(format!("{number}.{EXTENSION}"))
}

/// Recover the blob id from a staged content key. Anything that isn't
/// exactly `blobs/{uuid}.jpg` yields `None`.
pub fn blob_id_from_key(key: &Path) -> Option<Uuid> {
    let mut components = key.components();
    if components.next()?.as_os_str() != BLOB_PREFIX {
        return None;
    }
    let name = Path::new(components.next()?.as_os_str());
    if components.next().is_some() || name.extension()? != EXTENSION {
        return None;
    }
    Uuid::parse_str(name.file_stem()?.to_str()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_layout() {
        let (manga, chapter, blob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(blob_key(blob), PathBuf::from(format!("blobs/{blob}.jpg")));
        assert_eq!(page_key(manga, chapter, 3), PathBuf::from(format!("{manga}/{chapter}/3.jpg")));
        assert_eq!(blob_id_from_key(&blob_key(blob)), Some(blob));
    }

    #[rstest]
    #[case("blobs/not-a-uuid.jpg")]
    #[case("blobs/2f1e5a8c-6a8e-4c7e-9a51-0c9d0f6f4f10.png")]
    #[case("blobs/nested/2f1e5a8c-6a8e-4c7e-9a51-0c9d0f6f4f10.jpg")]
    #[case("pages/2f1e5a8c-6a8e-4c7e-9a51-0c9d0f6f4f10.jpg")]
    #[case("blobs")]
    fn test_foreign_keys_are_ignored(#[case] key: &str) {
        assert_eq!(blob_id_from_key(Path::new(key)), None);
    }
}
