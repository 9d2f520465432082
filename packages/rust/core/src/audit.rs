//! Audit trail of raw research and extracted summaries.
//!
//! Layout under the data directory:
//! - `raw/{identity digest}.json`: the research result for an item
//! - `output/prerequisites.txt`: every extracted summary, appended

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use compliance_shared::{
    ComplianceError, ComplianceItem, ItemIdentity, PrerequisiteSummary, ResearchResult, Result,
};

#[derive(Serialize)]
struct RawResearchFile<'a> {
    identity: &'a str,
    title: &'a str,
    query: &'a str,
    captured_at: String,
    research: &'a ResearchResult,
}

/// Writes audit files for manual verification of pipeline output.
pub struct AuditTrail {
    raw_dir: PathBuf,
    summary_file: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditTrail {
    pub fn new(root: &Path) -> Self {
        Self {
            raw_dir: root.join("raw"),
            summary_file: root.join("output").join("prerequisites.txt"),
            append_lock: Mutex::new(()),
        }
    }

    /// Write the research result for an item, replacing any earlier file.
    pub async fn record_research(
        &self,
        identity: &ItemIdentity,
        item: &ComplianceItem,
        query: &str,
        research: &ResearchResult,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.raw_dir)
            .await
            .map_err(|e| ComplianceError::io(&self.raw_dir, e))?;

        let file = RawResearchFile {
            identity: identity.as_str(),
            title: &item.title,
            query,
            captured_at: Utc::now().to_rfc3339(),
            research,
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| ComplianceError::parse(format!("failed to serialize research: {e}")))?;

        let path = self.raw_dir.join(format!("{}.json", identity.digest()));
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| ComplianceError::io(&path, e))?;
        Ok(path)
    }

    /// Append a summary block to `output/prerequisites.txt`.
    pub async fn record_summary(
        &self,
        item: &ComplianceItem,
        summary: &PrerequisiteSummary,
    ) -> Result<()> {
        let dir = self
            .summary_file
            .parent()
            .ok_or_else(|| ComplianceError::config("audit summary file has no parent directory"))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ComplianceError::io(dir, e))?;

        let mut block = format!(
            "{rule}\nTitle: {}\nResponsible: {}\nDue Date: {}\nRecorded: {}\n{rule}\n",
            item.title,
            item.responsible_email,
            item.due_date.format("%Y-%m-%d"),
            Utc::now().to_rfc3339(),
            rule = "=".repeat(72),
        );
        block.push_str(&summary.to_text());
        if !summary.sources.is_empty() {
            block.push_str("\nSources:\n");
            for source in &summary.sources {
                block.push_str(&format!("- {source}\n"));
            }
        }
        block.push('\n');

        // One writer at a time keeps blocks from interleaving.
        let _guard = self.append_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.summary_file)
            .await
            .map_err(|e| ComplianceError::io(&self.summary_file, e))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| ComplianceError::io(&self.summary_file, e))?;
        file.flush()
            .await
            .map_err(|e| ComplianceError::io(&self.summary_file, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use compliance_shared::{ItemCategory, ResearchEntry};
    use uuid::Uuid;

    fn item() -> ComplianceItem {
        ComplianceItem {
            title: "BIS Registration".into(),
            description: "CRS registration for adapters".into(),
            responsible_email: "reg@co.in".into(),
            due_date: NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
            application_date: None,
            submitted_at: Utc::now(),
            category: ItemCategory::default(),
        }
    }

    #[tokio::test]
    async fn writes_raw_research_and_appends_summaries() {
        let root = std::env::temp_dir().join(format!("ca_audit_{}", Uuid::now_v7()));
        let audit = AuditTrail::new(&root);
        let identity = ItemIdentity::from_stored("bis registration|reg@co.in|2025-11-01");

        let research = ResearchResult {
            entries: vec![ResearchEntry {
                source: "https://www.bis.gov.in/crs".into(),
                title: "CRS".into(),
                snippet: "Compulsory Registration Scheme".into(),
                content: None,
            }],
        };
        let path = audit
            .record_research(&identity, &item(), "BIS Registration requirements", &research)
            .await
            .unwrap();
        assert_eq!(path, root.join("raw").join(format!("{}.json", identity.digest())));
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["research"]["entries"][0]["source"], "https://www.bis.gov.in/crs");

        let summary = PrerequisiteSummary {
            prerequisites: vec!["Get product tested at a BIS lab".into()],
            sources: vec!["https://www.bis.gov.in/crs".into()],
            ..Default::default()
        };
        audit.record_summary(&item(), &summary).await.unwrap();
        audit
            .record_summary(&item(), &PrerequisiteSummary::none(""))
            .await
            .unwrap();

        let text = std::fs::read_to_string(root.join("output").join("prerequisites.txt")).unwrap();
        assert_eq!(text.matches("Title: BIS Registration").count(), 2);
        assert!(text.contains("1. Get product tested at a BIS lab"));
        assert!(text.contains("- https://www.bis.gov.in/crs"));
        assert!(text.contains("No prerequisites found."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_blocks_whole() {
        let root = std::env::temp_dir().join(format!("ca_audit_{}", Uuid::now_v7()));
        let audit = std::sync::Arc::new(AuditTrail::new(&root));

        let mut handles = Vec::new();
        for i in 0..8 {
            let audit = audit.clone();
            handles.push(tokio::spawn(async move {
                let summary = PrerequisiteSummary {
                    prerequisites: vec![format!("Step for item {i}")],
                    ..Default::default()
                };
                audit.record_summary(&item(), &summary).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let text = std::fs::read_to_string(root.join("output").join("prerequisites.txt")).unwrap();
        assert_eq!(text.matches("Title: BIS Registration").count(), 8);
        for block in text.split(&"=".repeat(72)).filter(|b| b.contains("Step for item")) {
            assert_eq!(block.matches("Step for item").count(), 1);
        }
    }
}
