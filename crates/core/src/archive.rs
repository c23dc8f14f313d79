//! ZIP handling for the analysis pipeline: the staging archive that carries
//! bulk intake files to the worker, and the streaming results archive the
//! worker builds.
//!
//! Results are grouped under `results/Поврежденные/` (defective) and
//! `results/Неповрежденные/` (normal); both folder entries exist even when
//! empty. The `zip` crate flags non-ASCII entry names as UTF-8 in the local
//! headers, which keeps the Cyrillic folder names intact for downstream
//! consumers.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Folder for images with detected defects
pub const DAMAGED_DIR: &str = "Поврежденные";
/// Folder for images without defects
pub const NORMAL_DIR: &str = "Неповрежденные";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// One file extracted from a staging archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

fn deflated() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// `{stem}_annotated.jpg` for an original file name
pub fn annotated_file_name(original_name: &str) -> String {
    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(original_name);
    format!("{stem}_annotated.jpg")
}

/// Archive path for one annotated image
pub fn annotated_entry_path(has_defects: bool, annotated_name: &str) -> String {
    let folder = if has_defects { DAMAGED_DIR } else { NORMAL_DIR };
    format!("results/{folder}/{annotated_name}")
}

/// Streaming writer for the results archive.
///
/// Entries are written straight to a temp file, so the archive never lives
/// in memory as a whole; only [`ResultsArchive::finish`] reads it back for
/// the upload.
pub struct ResultsArchive {
    writer: ZipWriter<std::fs::File>,
    path: tempfile::TempPath,
}

impl ResultsArchive {
    /// Open the archive with both result folders predeclared
    pub fn create() -> Result<Self, ArchiveError> {
        let (file, path) = NamedTempFile::new()?.into_parts();
        let mut writer = ZipWriter::new(file);
        writer.add_directory(format!("results/{DAMAGED_DIR}/"), deflated())?;
        writer.add_directory(format!("results/{NORMAL_DIR}/"), deflated())?;
        Ok(Self { writer, path })
    }

    /// Add one annotated JPEG under the folder matching its defect flag
    pub fn add_annotated(
        &mut self,
        has_defects: bool,
        annotated_name: &str,
        bytes: &[u8],
    ) -> Result<(), ArchiveError> {
        self.writer
            .start_file(annotated_entry_path(has_defects, annotated_name), deflated())?;
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Finalize the archive and return its bytes; the temp file is removed
    pub fn finish(self) -> Result<Vec<u8>, ArchiveError> {
        let mut file = self.writer.finish()?;
        let mut bytes = Vec::new();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;
        drop(file);
        self.path.close()?;
        Ok(bytes)
    }
}

/// Build the staging archive shipped from intake to the worker
pub fn pack_staging_archive(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in files {
        writer.start_file(name.as_str(), deflated())?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Unpack a staging archive into an ordered list of entries, skipping
/// directory records
pub fn unpack_staging_archive(archive_bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        entries.push(ArchiveEntry {
            name: file.name().to_string(),
            size: file.size(),
            bytes,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotated_file_name_strips_extension() {
        assert_eq!(annotated_file_name("tower_041.JPG"), "tower_041_annotated.jpg");
        assert_eq!(annotated_file_name("опора.jpeg"), "опора_annotated.jpg");
        assert_eq!(annotated_file_name("noext"), "noext_annotated.jpg");
    }

    #[test]
    fn test_entry_path_selects_folder_by_defects() {
        assert_eq!(
            annotated_entry_path(true, "a_annotated.jpg"),
            "results/Поврежденные/a_annotated.jpg"
        );
        assert_eq!(
            annotated_entry_path(false, "a_annotated.jpg"),
            "results/Неповрежденные/a_annotated.jpg"
        );
    }

    #[test]
    fn test_results_archive_layout() {
        let mut archive = ResultsArchive::create().unwrap();
        archive
            .add_annotated(true, "broken_annotated.jpg", b"jpeg-a")
            .unwrap();
        archive
            .add_annotated(false, "fine_annotated.jpg", b"jpeg-b")
            .unwrap();
        let bytes = archive.finish().unwrap();

        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();

        assert!(names.contains(&format!("results/{DAMAGED_DIR}/")));
        assert!(names.contains(&format!("results/{NORMAL_DIR}/")));
        assert!(names.contains(&format!("results/{DAMAGED_DIR}/broken_annotated.jpg")));
        assert!(names.contains(&format!("results/{NORMAL_DIR}/fine_annotated.jpg")));
    }

    #[test]
    fn test_empty_results_archive_still_has_both_folders() {
        let bytes = ResultsArchive::create().unwrap().finish().unwrap();
        let zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 2);
    }

    #[test]
    fn test_staging_round_trip_preserves_order_and_bytes() {
        let files = vec![
            ("first.jpg".to_string(), vec![1u8, 2, 3]),
            ("вторая.png".to_string(), vec![4u8, 5]),
        ];
        let packed = pack_staging_archive(&files).unwrap();
        let entries = unpack_staging_archive(&packed).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "first.jpg");
        assert_eq!(entries[0].bytes, vec![1, 2, 3]);
        assert_eq!(entries[1].name, "вторая.png");
        assert_eq!(entries[1].size, 2);
    }
}
