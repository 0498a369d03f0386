//! Streaming reads of a source object
//!
//! The head of the body is sampled for delimiter detection and then chained back
//! in front of the rest of the stream, so every byte is read from the object store
//! exactly once and the file is never held in memory whole.

use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use std::collections::BTreeMap;
use std::io::Cursor;
use tokio::io::AsyncReadExt;

use super::types::{Delimiter, ObjectBody, Row, Schema};
use crate::error::{FetchError, FormatError, ProcessingError, SchemaError};

/// Default number of bytes sampled for detection.
pub const DEFAULT_SAMPLE_BYTES: usize = 64 * 1024;

/// Head of a source object.
#[derive(Debug, Clone)]
pub struct Sample {
    bytes: Vec<u8>,
    limit: usize,
}

impl Sample {
    /// Sampled bytes, at most the configured limit.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes.len().min(self.limit)]
    }

    /// True when the sample holds the entire object.
    pub fn is_complete(&self) -> bool {
        self.bytes.len() <= self.limit
    }

    /// First line of the sample without its terminator, decoded lossily.
    pub fn header_line(&self) -> String {
        let bytes = self.bytes();
        let end = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end])
            .trim_end_matches('\r')
            .to_string()
    }
}

/// Read up to `max_bytes` from the head of `body`.
///
/// Returns the sample and a body that replays the sampled bytes before the rest.
/// One byte past the limit is read so a sample that ends exactly at the end of
/// the object is still known to be complete.
pub async fn read_sample(
    mut body: ObjectBody,
    max_bytes: usize,
) -> std::io::Result<(Sample, ObjectBody)> {
    let mut bytes = Vec::with_capacity(max_bytes.min(DEFAULT_SAMPLE_BYTES) + 1);
    (&mut body)
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut bytes)
        .await?;

    let replay: ObjectBody = Box::new(Cursor::new(bytes.clone()).chain(body));
    Ok((
        Sample {
            bytes,
            limit: max_bytes,
        },
        replay,
    ))
}

/// Record-by-record reader over a delimited body.
pub struct RowStream {
    reader: AsyncReader<ObjectBody>,
    record: ByteRecord,
    source: String,
    rows_read: u64,
}

impl RowStream {
    pub fn new(body: ObjectBody, delimiter: Delimiter, source: impl Into<String>) -> Self {
        let reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter.as_byte())
            .create_reader(body);

        Self {
            reader,
            record: ByteRecord::new(),
            source: source.into(),
            rows_read: 0,
        }
    }

    /// Data rows returned so far.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Read the header record. Must be called before [`RowStream::next_row`].
    pub async fn read_header(&mut self) -> Result<Vec<String>, ProcessingError> {
        if !self.advance(0).await? {
            return Err(SchemaError::EmptyHeader.into());
        }
        Ok(self
            .record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect())
    }

    /// Read the next data row, mapping fields through `schema`.
    pub async fn next_row(&mut self, schema: &Schema) -> Result<Option<Row>, ProcessingError> {
        let number = self.rows_read + 1;
        if !self.advance(number).await? {
            return Ok(None);
        }
        self.rows_read = number;

        let values: BTreeMap<String, String> = self
            .record
            .iter()
            .enumerate()
            .map(|(index, field)| {
                (
                    schema.column_name(index),
                    String::from_utf8_lossy(field).into_owned(),
                )
            })
            .collect();

        Ok(Some(Row { number, values }))
    }

    async fn advance(&mut self, row: u64) -> Result<bool, ProcessingError> {
        match self.reader.read_byte_record(&mut self.record).await {
            Ok(more) => Ok(more),
            Err(err) => match err.kind() {
                csv_async::ErrorKind::Io(io) => {
                    Err(FetchError::new(self.source.clone(), io).into())
                },
                _ => Err(FormatError::MalformedRecord {
                    row,
                    message: err.to_string(),
                }
                .into()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::schema::schema_from_fields;

    fn body(data: &'static [u8]) -> ObjectBody {
        Box::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn test_sample_is_replayed_in_front_of_the_stream() {
        let (sample, mut replay) = read_sample(body(b"a,b\n1,2\n3,4\n"), 5).await.unwrap();
        assert_eq!(sample.bytes(), b"a,b\n1");
        assert!(!sample.is_complete());
        assert_eq!(sample.header_line(), "a,b");

        let mut all = Vec::new();
        replay.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"a,b\n1,2\n3,4\n");
    }

    #[tokio::test]
    async fn test_small_file_sample_is_complete() {
        let (sample, _) = read_sample(body(b"x;y\r\n1;2"), 64).await.unwrap();
        assert!(sample.is_complete());
        assert_eq!(sample.header_line(), "x;y");

        let (exact, _) = read_sample(body(b"abcd"), 4).await.unwrap();
        assert!(exact.is_complete());
    }

    #[tokio::test]
    async fn test_rows_map_to_schema_columns() {
        let mut stream = RowStream::new(
            body(b"id|name\n1|apple\n2\n3|cherry|extra\n"),
            Delimiter::Pipe,
            "b/f.csv",
        );
        let header = stream.read_header().await.unwrap();
        let schema = schema_from_fields(&header).unwrap();

        let first = stream.next_row(&schema).await.unwrap().unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(first.values["name"], "apple");

        let short = stream.next_row(&schema).await.unwrap().unwrap();
        assert_eq!(short.values.len(), 1);
        assert!(!short.values.contains_key("name"));

        let long = stream.next_row(&schema).await.unwrap().unwrap();
        assert_eq!(long.values["_2"], "extra");

        assert!(stream.next_row(&schema).await.unwrap().is_none());
        assert_eq!(stream.rows_read(), 3);
    }

    #[tokio::test]
    async fn test_quoted_newlines_stay_in_one_row() {
        let mut stream = RowStream::new(
            body(b"id,note\n1,\"two\nlines\"\n2,plain\n"),
            Delimiter::Comma,
            "b/f.csv",
        );
        let schema = schema_from_fields(stream.read_header().await.unwrap()).unwrap();
        let row = stream.next_row(&schema).await.unwrap().unwrap();
        assert_eq!(row.values["note"], "two\nlines");
        let row = stream.next_row(&schema).await.unwrap().unwrap();
        assert_eq!(row.number, 2);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let mut stream = RowStream::new(body(b"a,b\n\xff,ok\n"), Delimiter::Comma, "b/f.csv");
        let schema = schema_from_fields(stream.read_header().await.unwrap()).unwrap();
        let row = stream.next_row(&schema).await.unwrap().unwrap();
        assert_eq!(row.values["a"], "\u{fffd}");
        assert_eq!(row.values["b"], "ok");
    }

    #[tokio::test]
    async fn test_stream_failure_is_a_fetch_error() {
        let mock = tokio_test::io::Builder::new()
            .read(b"a,b\n1,2\n")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            ))
            .build();
        let mut stream = RowStream::new(Box::new(mock), Delimiter::Comma, "b/f.csv");
        let schema = schema_from_fields(stream.read_header().await.unwrap()).unwrap();

        let err = loop {
            match stream.next_row(&schema).await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream ended without error"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, ProcessingError::Fetch(ref fetch) if fetch.path == "b/f.csv"));
    }

    #[tokio::test]
    async fn test_empty_body_has_no_header() {
        let mut stream = RowStream::new(body(b""), Delimiter::Comma, "b/f.csv");
        assert_eq!(
            stream.read_header().await.unwrap_err(),
            ProcessingError::Schema(SchemaError::EmptyHeader)
        );
    }
}
