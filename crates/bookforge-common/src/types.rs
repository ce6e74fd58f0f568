//! Domain enums and keys shared by every crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// The conversion a job performs on its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionKind {
    /// Decrypt the whole container into a single M4B.
    FullConvert,
    /// Split into one MP3 per chapter, delivered as a zip archive.
    ChapteredConvert,
}

impl ConversionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionKind::FullConvert => "full-convert",
            ConversionKind::ChapteredConvert => "chaptered-convert",
        }
    }

    /// Download reference for a completed artifact of this kind.
    pub fn download_path(&self, file_name: &str) -> String {
        match self {
            ConversionKind::FullConvert => format!("/download/{file_name}"),
            ConversionKind::ChapteredConvert => format!("/download/mp3/{file_name}"),
        }
    }
}

impl fmt::Display for ConversionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full-convert" => Ok(ConversionKind::FullConvert),
            "chaptered-convert" => Ok(ConversionKind::ChapteredConvert),
            other => Err(Error::Validation(format!("unknown conversion kind: {other}"))),
        }
    }
}

/// Lifecycle state of a job record.
///
/// `NotStarted -> Starting -> Converting -> {Completed | Failed}`; the two
/// active states may also go straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Starting,
    Converting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Starting => "starting",
            JobStatus::Converting => "converting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `Starting` or `Converting`: some process owns this key.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Starting | JobStatus::Converting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(JobStatus::NotStarted),
            "starting" => Ok(JobStatus::Starting),
            "converting" => Ok(JobStatus::Converting),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Unique key of a job record: one subject converted one way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub subject_id: String,
    pub kind: ConversionKind,
}

impl JobKey {
    pub fn new(subject_id: impl Into<String>, kind: ConversionKind) -> Self {
        Self {
            subject_id: subject_id.into(),
            kind,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.kind)
    }
}

/// Terminal result written back to a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success { result_path: String },
    Failure { error_message: String },
}

impl Completion {
    pub fn success(result_path: impl Into<String>) -> Self {
        Completion::Success {
            result_path: result_path.into(),
        }
    }

    pub fn failure(reason: impl fmt::Display) -> Self {
        Completion::Failure {
            error_message: reason.to_string(),
        }
    }

    /// The status this completion moves a record into.
    pub fn status(&self) -> JobStatus {
        match self {
            Completion::Success { .. } => JobStatus::Completed,
            Completion::Failure { .. } => JobStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobFailure;

    #[test]
    fn kind_roundtrips_through_str() {
        for kind in [ConversionKind::FullConvert, ConversionKind::ChapteredConvert] {
            assert_eq!(kind.as_str().parse::<ConversionKind>().unwrap(), kind);
        }
        assert!("mp3".parse::<ConversionKind>().is_err());
    }

    #[test]
    fn kind_serde_matches_as_str() {
        let json = serde_json::to_string(&ConversionKind::ChapteredConvert).unwrap();
        assert_eq!(json, "\"chaptered-convert\"");
    }

    #[test]
    fn download_paths() {
        assert_eq!(
            ConversionKind::FullConvert.download_path("book.m4b"),
            "/download/book.m4b"
        );
        assert_eq!(
            ConversionKind::ChapteredConvert.download_path("book_chapters.zip"),
            "/download/mp3/book_chapters.zip"
        );
    }

    #[test]
    fn status_classification() {
        assert!(JobStatus::Starting.is_active());
        assert!(JobStatus::Converting.is_active());
        assert!(!JobStatus::NotStarted.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Converting.is_terminal());
        assert!(!JobStatus::NotStarted.is_terminal());
    }

    #[test]
    fn status_parse() {
        assert_eq!("converting".parse::<JobStatus>().unwrap(), JobStatus::Converting);
        assert!("error".parse::<JobStatus>().is_err());
    }

    #[test]
    fn key_display() {
        let key = JobKey::new("book.aax", ConversionKind::FullConvert);
        assert_eq!(key.to_string(), "book.aax/full-convert");
    }

    #[test]
    fn completion_from_failure_reason() {
        let c = Completion::failure(JobFailure::Cancelled);
        assert_eq!(c.status(), JobStatus::Failed);
        assert_eq!(
            c,
            Completion::Failure {
                error_message: "Server interrupted".into()
            }
        );
        assert_eq!(Completion::success("/out/a.m4b").status(), JobStatus::Completed);
    }
}
