//! Content fetcher boundary: where module chunks and the course catalog come from.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::pipeline::Chunk;
use crate::resilience::{RetryClass, Retryable};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("course not found: {0}")]
    CourseNotFound(String),

    #[error("content source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid content: {0}")]
    Invalid(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl Retryable for FetchError {
    fn retry_class(&self) -> RetryClass {
        match self {
            FetchError::Unavailable(_) => RetryClass::Transient,
            FetchError::CourseNotFound(_) | FetchError::Invalid(_) | FetchError::Cancelled => {
                RetryClass::Fatal
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub course_id: String,
    pub module_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Chunks of one module plus its display title, if known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleContent {
    #[serde(default)]
    pub title: Option<String>,
    pub chunks: Vec<Chunk>,
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Ordered chunks for a module. A module with no content yields an empty list.
    async fn fetch_module(&self, course_id: &str, module_id: &str)
    -> Result<ModuleContent, FetchError>;

    async fn list_modules(&self, course_id: &str) -> Result<Vec<ModuleRef>, FetchError>;

    async fn list_courses(&self) -> Result<Vec<String>, FetchError>;
}

/// Catalog held in memory; used for tests, demos and embedding.
#[derive(Default)]
pub struct InMemoryFetcher {
    courses: RwLock<BTreeMap<String, BTreeMap<String, ModuleContent>>>,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(
        self,
        course_id: &str,
        module_id: &str,
        title: Option<&str>,
        chunks: Vec<Chunk>,
    ) -> Self {
        self.insert_module(course_id, module_id, title, chunks);
        self
    }

    pub fn insert_module(
        &self,
        course_id: &str,
        module_id: &str,
        title: Option<&str>,
        chunks: Vec<Chunk>,
    ) {
        self.courses
            .write()
            .entry(course_id.to_string())
            .or_default()
            .insert(
                module_id.to_string(),
                ModuleContent {
                    title: title.map(str::to_string),
                    chunks,
                },
            );
    }
}

#[async_trait]
impl ContentFetcher for InMemoryFetcher {
    async fn fetch_module(
        &self,
        course_id: &str,
        module_id: &str,
    ) -> Result<ModuleContent, FetchError> {
        Ok(self
            .courses
            .read()
            .get(course_id)
            .and_then(|modules| modules.get(module_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_modules(&self, course_id: &str) -> Result<Vec<ModuleRef>, FetchError> {
        let courses = self.courses.read();
        let modules = courses
            .get(course_id)
            .ok_or_else(|| FetchError::CourseNotFound(course_id.to_string()))?;
        Ok(modules
            .iter()
            .map(|(module_id, content)| ModuleRef {
                course_id: course_id.to_string(),
                module_id: module_id.clone(),
                title: content.title.clone(),
            })
            .collect())
    }

    async fn list_courses(&self) -> Result<Vec<String>, FetchError> {
        Ok(self.courses.read().keys().cloned().collect())
    }
}

/// Small HR course used by `cardforge demo`.
pub fn demo_catalog() -> InMemoryFetcher {
    InMemoryFetcher::new()
        .with_module(
            "hr-101",
            "onboarding",
            Some("Employee Onboarding"),
            vec![
                Chunk::new(
                    "onb-1",
                    "Onboarding is the process of integrating new employees into the \
                     organization. A structured onboarding program lasts 90 days.",
                )
                .with_heading("What onboarding is"),
                Chunk::new(
                    "onb-2",
                    "Every new hire is assigned a mentor during the first week. The mentor \
                     meets the new hire weekly and answers questions about team practices.",
                )
                .with_heading("Mentoring"),
                Chunk::new(
                    "onb-3",
                    "Equipment requests must be submitted 10 working days before the start \
                     date so that laptops and accounts are ready on day one.",
                )
                .with_heading("Equipment"),
            ],
        )
        .with_module(
            "hr-101",
            "time-off",
            Some("Leave and Reviews"),
            vec![
                Chunk::new(
                    "off-1",
                    "Employees accrue 25 days of annual leave. Leave requests must be \
                     approved by the line manager at least 14 days in advance.",
                )
                .with_heading("Annual leave"),
                Chunk::new(
                    "off-2",
                    "Performance reviews happen twice a year. Managers rate each employee \
                     against agreed objectives and record feedback in the review form.",
                )
                .with_heading("Performance reviews"),
            ],
        )
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModuleFile {
    Titled(ModuleContent),
    Bare(Vec<Chunk>),
}

impl From<ModuleFile> for ModuleContent {
    fn from(file: ModuleFile) -> Self {
        match file {
            ModuleFile::Titled(content) => content,
            ModuleFile::Bare(chunks) => ModuleContent { title: None, chunks },
        }
    }
}

/// Reads `<root>/<course_id>/<module_id>.json`. Each file is either a JSON array of
/// chunks or an object `{"title": ..., "chunks": [...]}`.
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn course_dir(&self, course_id: &str) -> Result<PathBuf, FetchError> {
        Ok(self.root.join(safe_segment(course_id)?))
    }

    async fn read_module(&self, path: &Path) -> Result<ModuleContent, FetchError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "module file missing, treating as empty");
                return Ok(ModuleContent::default());
            }
            Err(e) => return Err(FetchError::Unavailable(format!("{}: {e}", path.display()))),
        };
        let file: ModuleFile = serde_json::from_str(&raw)
            .map_err(|e| FetchError::Invalid(format!("{}: {e}", path.display())))?;
        Ok(file.into())
    }
}

/// Rejects ids that would escape the content root.
fn safe_segment(id: &str) -> Result<&str, FetchError> {
    let trimmed = id.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
    {
        return Err(FetchError::Invalid(format!("unsafe identifier {id:?}")));
    }
    Ok(trimmed)
}

#[async_trait]
impl ContentFetcher for DirectoryFetcher {
    async fn fetch_module(
        &self,
        course_id: &str,
        module_id: &str,
    ) -> Result<ModuleContent, FetchError> {
        let path = self
            .course_dir(course_id)?
            .join(format!("{}.json", safe_segment(module_id)?));
        self.read_module(&path).await
    }

    async fn list_modules(&self, course_id: &str) -> Result<Vec<ModuleRef>, FetchError> {
        let dir = self.course_dir(course_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FetchError::CourseNotFound(course_id.to_string()));
            }
            Err(e) => return Err(FetchError::Unavailable(format!("{}: {e}", dir.display()))),
        };

        let mut modules = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(module_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let title = self.read_module(&path).await?.title;
            modules.push(ModuleRef {
                course_id: course_id.to_string(),
                module_id: module_id.to_string(),
                title,
            });
        }
        modules.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        Ok(modules)
    }

    async fn list_courses(&self) -> Result<Vec<String>, FetchError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| FetchError::Unavailable(format!("{}: {e}", self.root.display())))?;
        let mut courses = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    courses.push(name.to_string());
                }
            }
        }
        courses.sort();
        Ok(courses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::hr_chunks;

    #[tokio::test]
    async fn in_memory_catalog() {
        let fetcher = InMemoryFetcher::new()
            .with_module("hr", "onboarding", Some("Onboarding"), hr_chunks())
            .with_module("hr", "leave", None, vec![])
            .with_module("it", "security", None, vec![]);

        assert_eq!(fetcher.list_courses().await.unwrap(), vec!["hr", "it"]);
        let modules = fetcher.list_modules("hr").await.unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.module_id.as_str()).collect();
        assert_eq!(ids, vec!["leave", "onboarding"]);

        let content = fetcher.fetch_module("hr", "onboarding").await.unwrap();
        assert_eq!(content.chunks.len(), 3);
        assert_eq!(content.title.as_deref(), Some("Onboarding"));
    }

    #[tokio::test]
    async fn unknown_module_is_empty_but_unknown_course_errors() {
        let fetcher = InMemoryFetcher::new();
        assert!(fetcher.fetch_module("x", "y").await.unwrap().chunks.is_empty());
        assert!(matches!(
            fetcher.list_modules("x").await,
            Err(FetchError::CourseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn directory_fetcher_reads_both_file_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let course = dir.path().join("hr");
        std::fs::create_dir(&course).unwrap();
        std::fs::write(
            course.join("onboarding.json"),
            serde_json::to_string(&hr_chunks()).unwrap(),
        )
        .unwrap();
        std::fs::write(
            course.join("leave.json"),
            r#"{"title": "Leave Policy", "chunks": [{"chunk_id": "l1", "text": "Leave is 25 days."}]}"#,
        )
        .unwrap();
        std::fs::write(course.join("notes.txt"), "ignored").unwrap();

        let fetcher = DirectoryFetcher::new(dir.path());
        assert_eq!(fetcher.list_courses().await.unwrap(), vec!["hr"]);

        let modules = fetcher.list_modules("hr").await.unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].module_id, "leave");
        assert_eq!(modules[0].title.as_deref(), Some("Leave Policy"));

        let onboarding = fetcher.fetch_module("hr", "onboarding").await.unwrap();
        assert_eq!(onboarding.chunks.len(), 3);
        assert!(onboarding.title.is_none());
    }

    #[tokio::test]
    async fn directory_fetcher_edge_cases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("hr")).unwrap();
        std::fs::write(dir.path().join("hr").join("broken.json"), "{not json").unwrap();
        let fetcher = DirectoryFetcher::new(dir.path());

        assert!(fetcher.fetch_module("hr", "missing").await.unwrap().chunks.is_empty());
        assert!(matches!(
            fetcher.fetch_module("hr", "broken").await,
            Err(FetchError::Invalid(_))
        ));
        assert!(matches!(
            fetcher.fetch_module("..", "passwd").await,
            Err(FetchError::Invalid(_))
        ));
        assert!(matches!(
            fetcher.list_modules("nope").await,
            Err(FetchError::CourseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn demo_catalog_has_two_modules() {
        let catalog = demo_catalog();
        assert_eq!(catalog.list_courses().await.unwrap(), vec!["hr-101"]);
        assert_eq!(catalog.list_modules("hr-101").await.unwrap().len(), 2);
    }

    #[test]
    fn only_unavailability_is_retried() {
        assert_eq!(FetchError::Unavailable("x".into()).retry_class(), RetryClass::Transient);
        assert_eq!(FetchError::Invalid("x".into()).retry_class(), RetryClass::Fatal);
        assert_eq!(FetchError::CourseNotFound("x".into()).retry_class(), RetryClass::Fatal);
    }
}
