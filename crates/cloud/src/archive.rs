use std::io::{Cursor, Read};

use bytes::Bytes;
use save_cloud_sync_core::paths;
use zip::ZipArchive;

use crate::CloudError;

/// One regular file from a downloaded archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// `/`-separated path inside the archive.
    pub name: String,
    pub data: Vec<u8>,
}

/// Unpacks every file of a zip archive in memory. Directory entries are
/// skipped.
pub async fn read_archive(bytes: Bytes) -> Result<Vec<ArchiveEntry>, CloudError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<ArchiveEntry>, CloudError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            entries.push(ArchiveEntry {
                name: file.name().replace('\\', "/"),
                data,
            });
        }
        Ok(entries)
    })
    .await?
}

/// Strips the leading `folder/` that archives of a folder put in front of
/// every entry. Names without that prefix are returned unchanged.
pub fn strip_root_folder<'a>(name: &'a str, folder: &str) -> &'a str {
    let trimmed = name.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((first, rest)) if first.eq_ignore_ascii_case(folder) => rest,
        _ => trimmed,
    }
}

/// Resolves a remote relative path below `destination`. Entries that would
/// land on or outside `destination` after `..` resolution are rejected.
pub fn contained_target(destination: &str, relative: &str) -> Result<String, CloudError> {
    let target = paths::combine(destination, &[relative]);
    match paths::relative_to(destination, &target) {
        Some(rest) if !rest.is_empty() => Ok(target),
        _ => Err(CloudError::UnsafePath(relative.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    /// Builds an archive the way providers return folder downloads.
    pub(crate) fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_read_archive() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.add_directory("Farm_1/", FileOptions::default()).unwrap();
        writer.start_file("Farm_1/SaveGameInfo", FileOptions::default()).unwrap();
        writer.write_all(b"<Farmer/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let entries = read_archive(Bytes::from(bytes)).await.unwrap();
        assert_eq!(
            entries,
            vec![ArchiveEntry { name: "Farm_1/SaveGameInfo".into(), data: b"<Farmer/>".to_vec() }]
        );
    }

    #[tokio::test]
    async fn test_garbage_is_a_zip_error() {
        let err = read_archive(Bytes::from_static(b"not a zip")).await.unwrap_err();
        assert!(matches!(err, CloudError::Zip(_)));
    }

    #[test]
    fn test_strip_root_folder() {
        assert_eq!(strip_root_folder("Farm_1/data/x", "Farm_1"), "data/x");
        assert_eq!(strip_root_folder("farm_1/x", "Farm_1"), "x");
        assert_eq!(strip_root_folder("Other/x", "Farm_1"), "Other/x");
        assert_eq!(strip_root_folder("/Info/a.json", "info"), "a.json");
    }

    #[test]
    fn test_contained_target() {
        assert_eq!(
            contained_target("/saves/cstemp/Farm_1", "data/x").unwrap(),
            "/saves/cstemp/Farm_1/data/x"
        );
        assert_eq!(
            contained_target("/saves/cstemp/Farm_1", "a/../b").unwrap(),
            "/saves/cstemp/Farm_1/b"
        );
        for hostile in ["../../escaped", "..", "a/../../Farm_2/x", ""] {
            let err = contained_target("/saves/cstemp/Farm_1", hostile).unwrap_err();
            assert!(matches!(err, CloudError::UnsafePath(_)), "{hostile:?} was accepted");
        }
    }
}
