use exporter::{ArchiveEntry, ArchivePackager, ExportError, ManifestRow};
use session::CrawlJob;

/// Machine-readable description of a job, written as `metadata.json`.
pub fn archive_metadata(job: &CrawlJob) -> serde_json::Value {
    serde_json::json!({
        "sessionId": job.session_id,
        "baseUrl": job.base_url,
        "status": job.status,
        "createdAt": job.created_at,
        "completedAt": job.completed_at,
        "successCount": job.success_count(),
        "failureCount": job.failure_count(),
        "pages": job.pages,
    })
}

/// Packs every successful screenshot of `job` into a ZIP.
pub fn archive_job(job: &CrawlJob) -> Result<Vec<u8>, ExportError> {
    let entries: Vec<ArchiveEntry> = job
        .pages
        .iter()
        .filter(|page| page.has_image())
        .map(|page| ArchiveEntry::new(page.filename.clone(), page.image_bytes.clone()))
        .collect();

    let manifest: Vec<ManifestRow> = job
        .pages
        .iter()
        .map(|page| ManifestRow {
            order: page.order,
            filename: page.filename.clone(),
            url: page.url.clone(),
            title: page.title.clone(),
            success: page.success,
            error: page.error.clone().unwrap_or_default(),
        })
        .collect();

    ArchivePackager::new().pack(&entries, &archive_metadata(job), &manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use session::{CapturedPage, JobUpdate, Progress};
    use url::Url;

    fn page(order: usize, success: bool) -> CapturedPage {
        CapturedPage {
            url: format!("https://example.com/{}", order),
            title: format!("Page {}", order),
            filename: format!("page_{:03}.png", order),
            success,
            error: (!success).then(|| "connection: net::ERR_NAME_NOT_RESOLVED".to_string()),
            order,
            depth: 1,
            flow_step: None,
            width: 1280,
            height: 2400,
            duration_ms: 12,
            image_bytes: if success {
                Bytes::from(format!("png-{}", order))
            } else {
                Bytes::new()
            },
        }
    }

    fn job(pages: Vec<CapturedPage>) -> CrawlJob {
        let mut job = CrawlJob::new("s-1", &Url::parse("https://example.com").unwrap());
        let total = pages.len();
        for (i, page) in pages.into_iter().enumerate() {
            job.apply(JobUpdate::page(page, Progress { current: i + 1, total }));
        }
        job.apply(JobUpdate::completed(Progress { current: total, total }));
        job
    }

    #[test]
    fn test_metadata_describes_job() {
        let job = job(vec![page(1, true), page(2, false)]);
        let metadata = archive_metadata(&job);
        assert_eq!(metadata["sessionId"], "s-1");
        assert_eq!(metadata["baseUrl"], "https://example.com/");
        assert_eq!(metadata["status"], "completed");
        assert_eq!(metadata["successCount"], 1);
        assert_eq!(metadata["failureCount"], 1);
        assert_eq!(metadata["pages"].as_array().unwrap().len(), 2);
        assert!(metadata["completedAt"].is_string());
    }

    #[test]
    fn test_archive_contains_successful_pages_only() {
        let archive = archive_job(&job(vec![page(1, true), page(2, false), page(3, true)])).unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["manifest.csv", "metadata.json", "page_001.png", "page_003.png"]
        );
    }

    #[test]
    fn test_archive_of_all_failed_job_is_an_error() {
        let result = archive_job(&job(vec![page(1, false)]));
        assert!(matches!(result, Err(ExportError::NothingToPackage)));
    }
}
