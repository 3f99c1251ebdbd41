use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use thiserror::Error;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MANIFEST_ENTRY: &str = "manifest.csv";

/// Deflate level used for every entry. Fixed so archives are reproducible.
const COMPRESSION_LEVEL: i64 = 6;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Nothing to package: every capture failed")]
    NothingToPackage,
    #[error("Duplicate archive entry: {0}")]
    DuplicateEntry(String),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub filename: String,
    pub bytes: Bytes,
}

impl ArchiveEntry {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// One line of the human-readable summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestRow {
    pub order: usize,
    pub filename: String,
    pub url: String,
    pub title: String,
    pub success: bool,
    pub error: String,
}

/// Builds the downloadable ZIP for a finished job.
#[derive(Debug, Default)]
pub struct ArchivePackager;

impl ArchivePackager {
    pub fn new() -> Self {
        Self
    }

    /// Writes `entries` in the given order, followed by `metadata.json` and
    /// `manifest.csv`. Empty entries are left out; if none remain the
    /// result is [`ExportError::NothingToPackage`].
    pub fn pack(
        &self,
        entries: &[ArchiveEntry],
        metadata: &serde_json::Value,
        manifest: &[ManifestRow],
    ) -> Result<Vec<u8>, ExportError> {
        let images: Vec<&ArchiveEntry> = entries.iter().filter(|e| !e.bytes.is_empty()).collect();
        if images.is_empty() {
            return Err(ExportError::NothingToPackage);
        }

        let mut names: HashSet<&str> = HashSet::from([METADATA_ENTRY, MANIFEST_ENTRY]);
        for entry in &images {
            if !names.insert(entry.filename.as_str()) {
                return Err(ExportError::DuplicateEntry(entry.filename.clone()));
            }
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(COMPRESSION_LEVEL))
            .last_modified_time(zip::DateTime::default());
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        for entry in &images {
            zip.start_file(entry.filename.as_str(), options)?;
            zip.write_all(&entry.bytes)?;
            debug!(filename = %entry.filename, size = entry.bytes.len(), "Archived entry");
        }

        zip.start_file(METADATA_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec_pretty(metadata)?)?;

        zip.start_file(MANIFEST_ENTRY, options)?;
        zip.write_all(&render_manifest(manifest)?)?;

        let archive = zip.finish()?.into_inner();
        info!(
            entries = images.len(),
            skipped = entries.len() - images.len(),
            size = archive.len(),
            "Archive packed"
        );
        Ok(archive)
    }
}

fn render_manifest(rows: &[ManifestRow]) -> Result<Vec<u8>, ExportError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    if rows.is_empty() {
        wtr.write_record(["order", "filename", "url", "title", "success", "error"])?;
    }
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.into_inner().map_err(|e| ExportError::IoError(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    fn entries() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::new("page_001.png", Bytes::from_static(b"first image")),
            ArchiveEntry::new("page_002.png", Bytes::new()),
            ArchiveEntry::new("page_003.png", Bytes::from_static(b"third image")),
        ]
    }

    fn manifest() -> Vec<ManifestRow> {
        vec![
            ManifestRow {
                order: 1,
                filename: "page_001.png".to_string(),
                url: "https://example.com/".to_string(),
                title: "Home".to_string(),
                success: true,
                error: String::new(),
            },
            ManifestRow {
                order: 2,
                filename: "page_002.png".to_string(),
                url: "https://example.com/slow".to_string(),
                title: String::new(),
                success: false,
                error: "timeout: navigation exceeded 30000 ms".to_string(),
            },
        ]
    }

    fn read_entry(archive: &[u8], name: &str) -> Vec<u8> {
        let mut zip = ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut file = zip.by_name(name).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    fn names(archive: &[u8]) -> Vec<String> {
        let zip = ZipArchive::new(Cursor::new(archive)).unwrap();
        zip.file_names().map(str::to_string).collect()
    }

    #[test]
    fn test_pack_skips_empty_entries() {
        let metadata = serde_json::json!({"sessionId": "s-1"});
        let archive = ArchivePackager::new().pack(&entries(), &metadata, &manifest()).unwrap();

        let mut listed = names(&archive);
        listed.sort();
        assert_eq!(
            listed,
            vec!["manifest.csv", "metadata.json", "page_001.png", "page_003.png"]
        );
        assert_eq!(read_entry(&archive, "page_003.png"), b"third image");
    }

    #[test]
    fn test_pack_is_deterministic() {
        let metadata = serde_json::json!({"sessionId": "s-1", "successCount": 2});
        let packager = ArchivePackager::new();
        let first = packager.pack(&entries(), &metadata, &manifest()).unwrap();
        let second = packager.pack(&entries(), &metadata, &manifest()).unwrap();
        assert_eq!(first, second);
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_entries_use_fixed_compression_and_time() {
        let archive = ArchivePackager::new()
            .pack(&entries(), &serde_json::json!({}), &[])
            .unwrap();
        let mut zip = ZipArchive::new(Cursor::new(&archive[..])).unwrap();
        for i in 0..zip.len() {
            let file = zip.by_index(i).unwrap();
            assert_eq!(file.compression(), CompressionMethod::Deflated);
            let modified = file.last_modified().unwrap();
            assert_eq!(modified.year(), 1980);
        }
    }

    #[test]
    fn test_metadata_and_manifest_written() {
        let metadata = serde_json::json!({"sessionId": "s-1", "failureCount": 1});
        let archive = ArchivePackager::new().pack(&entries(), &metadata, &manifest()).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_slice(&read_entry(&archive, METADATA_ENTRY)).unwrap();
        assert_eq!(parsed, metadata);

        let csv_text = String::from_utf8(read_entry(&archive, MANIFEST_ENTRY)).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(lines.next(), Some("order,filename,url,title,success,error"));
        assert_eq!(lines.next(), Some("1,page_001.png,https://example.com/,Home,true,"));
        assert!(lines.next().unwrap().ends_with("false,timeout: navigation exceeded 30000 ms"));
    }

    #[test]
    fn test_empty_manifest_still_has_header() {
        let archive = ArchivePackager::new()
            .pack(&entries(), &serde_json::json!({}), &[])
            .unwrap();
        let csv_text = String::from_utf8(read_entry(&archive, MANIFEST_ENTRY)).unwrap();
        assert_eq!(csv_text.trim_end(), "order,filename,url,title,success,error");
    }

    #[test]
    fn test_nothing_to_package() {
        let failed = vec![ArchiveEntry::new("page_001.png", Bytes::new())];
        let result = ArchivePackager::new().pack(&failed, &serde_json::json!({}), &[]);
        assert!(matches!(result, Err(ExportError::NothingToPackage)));

        let result = ArchivePackager::new().pack(&[], &serde_json::json!({}), &[]);
        assert!(matches!(result, Err(ExportError::NothingToPackage)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dupes = vec![
            ArchiveEntry::new("page_001.png", Bytes::from_static(b"a")),
            ArchiveEntry::new("page_001.png", Bytes::from_static(b"b")),
        ];
        let result = ArchivePackager::new().pack(&dupes, &serde_json::json!({}), &[]);
        assert!(matches!(result, Err(ExportError::DuplicateEntry(name)) if name == "page_001.png"));

        let reserved = vec![ArchiveEntry::new(METADATA_ENTRY, Bytes::from_static(b"{}"))];
        let result = ArchivePackager::new().pack(&reserved, &serde_json::json!({}), &[]);
        assert!(matches!(result, Err(ExportError::DuplicateEntry(_))));
    }
}
