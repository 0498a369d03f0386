//! Delimiter detection over a sample of the raw file

use super::types::Delimiter;
use crate::error::FormatError;

/// Data lines compared against the header when judging consistency.
pub const DEFAULT_SAMPLE_LINES: usize = 5;

/// Infers the field delimiter from the head of a file.
///
/// Each candidate splits the sampled records; a candidate qualifies when the
/// header splits into more than one field. Qualified candidates are ranked by
/// how many sampled data lines have the header's field count, then by the
/// header's field count, then by priority order (comma first).
#[derive(Debug, Clone, Copy)]
pub struct FormatDetector {
    sample_lines: usize,
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_LINES)
    }
}

impl FormatDetector {
    pub fn new(sample_lines: usize) -> Self {
        Self {
            sample_lines: sample_lines.max(1),
        }
    }

    /// Detect the delimiter of `sample`.
    ///
    /// `complete` is true when the sample holds the whole file; otherwise the
    /// last sampled record may be cut short and is ignored.
    pub fn detect(&self, sample: &[u8], complete: bool) -> Result<Delimiter, FormatError> {
        if sample.iter().all(u8::is_ascii_whitespace) {
            return Err(FormatError::EmptySample);
        }

        let mut best: Option<(Delimiter, (usize, usize))> = None;
        let mut data_lines = 0;

        for candidate in Delimiter::CANDIDATES {
            let counts = self.field_counts(sample, candidate, complete);
            let Some((&header_fields, data)) = counts.split_first() else {
                continue;
            };
            if header_fields < 2 {
                continue;
            }

            data_lines = data_lines.max(data.len());
            let consistent = data.iter().filter(|&&n| n == header_fields).count();
            let score = (consistent, header_fields);

            // Most consistent lines, then the wider header; strict comparison
            // keeps the earlier candidate on a full tie.
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((candidate, score));
            }
        }

        match best {
            None => Err(FormatError::NoDelimiter),
            Some((_, (0, _))) if data_lines > 0 => {
                Err(FormatError::Inconsistent { lines: data_lines })
            },
            Some((delimiter, _)) => Ok(delimiter),
        }
    }

    /// Field counts of the header and up to `sample_lines` data records.
    fn field_counts(&self, sample: &[u8], delimiter: Delimiter, complete: bool) -> Vec<usize> {
        let wanted = self.sample_lines + 1;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter.as_byte())
            .from_reader(sample);

        let mut counts = Vec::with_capacity(wanted + 1);
        let mut record = csv::ByteRecord::new();
        let mut reached_end = false;

        while counts.len() <= wanted {
            match reader.read_byte_record(&mut record) {
                Ok(true) => counts.push(record.len()),
                Ok(false) | Err(_) => {
                    reached_end = true;
                    break;
                },
            }
        }

        if reached_end && !complete {
            counts.pop();
        }
        counts.truncate(wanted);
        counts
    }
}

/// Detect the delimiter of a complete file sample with default settings.
pub fn detect_delimiter(sample: &[u8]) -> Result<Delimiter, FormatError> {
    FormatDetector::default().detect(sample, true)
}
