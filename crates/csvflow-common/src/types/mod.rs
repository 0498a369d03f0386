//! Common types used across csvflow

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

/// Reference to an object in durable object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Bucket (or container) holding the object. May be empty when the
    /// notification omits it.
    pub bucket: String,
    /// Object name within the bucket, e.g. `2024/01/18/09/3f2a9c1e_sales.csv`
    pub name: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    /// Parse a `bucket/name` storage path.
    ///
    /// The first path segment is the bucket; the remainder is the object name.
    pub fn parse(storage_path: &str) -> Result<Self, CommonError> {
        let trimmed = storage_path.trim_start_matches('/');
        match trimmed.split_once('/') {
            Some((bucket, name)) if !bucket.is_empty() && !name.is_empty() => {
                Ok(Self::new(bucket, name))
            },
            _ => Err(CommonError::InvalidPath(storage_path.to_string())),
        }
    }

    /// Identity of the object used for fingerprinting: `{bucket}/{name}`.
    pub fn storage_path(&self) -> String {
        format!("{}/{}", self.bucket, self.name)
    }

    /// Whether the object name carries a `.csv` extension (case-insensitive).
    pub fn is_csv(&self) -> bool {
        self.name.to_ascii_lowercase().ends_with(".csv")
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Terminal status recorded in a file's summary record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Completed => "COMPLETED",
            ProcessingStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMPLETED" => Ok(ProcessingStatus::Completed),
            "FAILED" => Ok(ProcessingStatus::Failed),
            _ => Err(CommonError::UnknownStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_parse() {
        let object = ObjectRef::parse("uploads/2024/01/18/09/ab12cd34_sales.csv").unwrap();
        assert_eq!(object.bucket, "uploads");
        assert_eq!(object.name, "2024/01/18/09/ab12cd34_sales.csv");
        assert_eq!(object.storage_path(), "uploads/2024/01/18/09/ab12cd34_sales.csv");

        assert!(ObjectRef::parse("no-slash").is_err());
        assert!(ObjectRef::parse("bucket/").is_err());
    }

    #[test]
    fn test_object_ref_is_csv() {
        assert!(ObjectRef::new("b", "data/Report.CSV").is_csv());
        assert!(!ObjectRef::new("b", "data/report.txt").is_csv());
        assert!(!ObjectRef::new("b", "").is_csv());
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            "completed".parse::<ProcessingStatus>().unwrap(),
            ProcessingStatus::Completed
        );
        assert_eq!("FAILED".parse::<ProcessingStatus>().unwrap(), ProcessingStatus::Failed);
        assert!("pending".parse::<ProcessingStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&ProcessingStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
