//! Object storage read capability

use async_trait::async_trait;
use csvflow_common::types::ObjectRef;
use std::collections::HashMap;
use std::io::Cursor;
use tokio::sync::Mutex;

use crate::engine::SourceFile;
use crate::error::FetchError;

pub mod config;
pub mod s3;

pub use config::StorageConfig;
pub use s3::S3ObjectSource;

/// Opens stored objects as byte streams.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn open(&self, object: &ObjectRef) -> Result<SourceFile, FetchError>;
}

#[derive(Debug, Default)]
struct Objects {
    contents: HashMap<String, Vec<u8>>,
    failures: HashMap<String, u32>,
    opens: u64,
}

/// In-process object source for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryObjectSource {
    objects: Mutex<Objects>,
}

impl MemoryObjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, object: &ObjectRef, contents: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .await
            .contents
            .insert(object.storage_path(), contents.into());
    }

    /// Fail the next `times` opens of `object`.
    pub async fn fail_open(&self, object: &ObjectRef, times: u32) {
        self.objects
            .lock()
            .await
            .failures
            .insert(object.storage_path(), times);
    }

    /// Number of successful and failed opens so far.
    pub async fn opens(&self) -> u64 {
        self.objects.lock().await.opens
    }
}

#[async_trait]
impl ObjectSource for MemoryObjectSource {
    async fn open(&self, object: &ObjectRef) -> Result<SourceFile, FetchError> {
        let path = object.storage_path();
        let mut objects = self.objects.lock().await;
        objects.opens += 1;

        if let Some(remaining) = objects.failures.get_mut(&path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::new(path, "injected read failure"));
            }
        }

        let contents = objects
            .contents
            .get(&path)
            .cloned()
            .ok_or_else(|| FetchError::new(path.clone(), "object not found"))?;

        Ok(SourceFile {
            object: object.clone(),
            size_bytes: Some(contents.len() as u64),
            body: Box::new(Cursor::new(contents)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_memory_source_streams_contents() {
        let source = MemoryObjectSource::new();
        let object = ObjectRef::new("uploads", "a.csv");
        source.put(&object, "a,b\n1,2\n").await;

        let mut file = source.open(&object).await.unwrap();
        assert_eq!(file.size_bytes, Some(8));
        let mut contents = String::new();
        file.body.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_injected_and_missing_failures() {
        let source = MemoryObjectSource::new();
        let object = ObjectRef::new("uploads", "a.csv");
        source.put(&object, "a,b\n").await;
        source.fail_open(&object, 1).await;

        assert!(source.open(&object).await.is_err());
        assert!(source.open(&object).await.is_ok());
        let missing = source.open(&ObjectRef::new("uploads", "b.csv")).await.unwrap_err();
        assert_eq!(missing.path, "uploads/b.csv");
        assert_eq!(source.opens().await, 3);
    }
}
