//! Header-to-schema mapping
//!
//! Column names become qualifiers in the `data` family, so the rules here are an
//! observable contract for anyone reading the store:
//!
//! 1. Trim surrounding whitespace (and a leading UTF-8 BOM on the first field).
//! 2. Replace every character outside `[A-Za-z0-9_.-]` with `_`. Case is preserved.
//! 3. Truncate to [`MAX_COLUMN_NAME_LEN`] characters.
//! 4. An empty result becomes `_{index}` (0-based field position).
//! 5. A name already taken gets `_{n}` appended, where `n` counts occurrences
//!    starting at 2, skipping any candidate that is itself taken.
//!
//! `id,name,name,  ,price` therefore maps to `id,name,name_2,_3,price`.

use std::collections::{HashMap, HashSet};

use super::types::{Delimiter, Schema};
use crate::error::SchemaError;

/// Longest column name kept after sanitizing.
pub const MAX_COLUMN_NAME_LEN: usize = 64;

const BOM: char = '\u{feff}';

/// Sanitize a single raw header field. May return an empty string.
pub fn sanitize_column(raw: &str) -> String {
    raw.trim_start_matches(BOM)
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_COLUMN_NAME_LEN)
        .collect()
}

/// Build a schema from already-split header fields.
pub fn schema_from_fields<I, S>(fields: I) -> Result<Schema, SchemaError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut taken: HashSet<String> = HashSet::new();
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut columns = Vec::new();

    for (index, field) in fields.into_iter().enumerate() {
        let mut base = sanitize_column(field.as_ref());
        if base.is_empty() {
            base = format!("_{}", index);
        }

        let name = if taken.contains(&base) {
            let counter = occurrences.entry(base.clone()).or_insert(1);
            loop {
                *counter += 1;
                let candidate = format!("{}_{}", base, counter);
                if !taken.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            base
        };

        taken.insert(name.clone());
        columns.push(name);
    }

    if columns.is_empty() {
        return Err(SchemaError::NoColumns);
    }

    Ok(Schema::from_unique(columns))
}

/// Map a raw header line to a schema using the detected delimiter.
///
/// Quoted fields are honoured, so `"last, first";age` with `;` yields two columns.
pub fn map_header_line(line: &str, delimiter: Delimiter) -> Result<Schema, SchemaError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_start_matches(BOM).trim().is_empty() {
        return Err(SchemaError::EmptyHeader);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter.as_byte())
        .from_reader(line.as_bytes());

    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => schema_from_fields(record.iter()),
        Ok(false) => Err(SchemaError::NoColumns),
        // A lone broken quote: fall back to a plain split
        Err(_) => schema_from_fields(line.split(delimiter.as_char())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_and_blank_columns() {
        let schema = map_header_line("id,name,name,  ,price", Delimiter::Comma).unwrap();
        assert_eq!(schema.columns(), ["id", "name", "name_2", "_3", "price"]);
    }

    #[test]
    fn test_sanitize_preserves_case_and_replaces_invalid_chars() {
        assert_eq!(sanitize_column("  First Name "), "First_Name");
        assert_eq!(sanitize_column("price($)"), "price___");
        assert_eq!(sanitize_column("\u{feff}Id"), "Id");
        assert_eq!(sanitize_column("año"), "a_o");
        assert_eq!(sanitize_column("x".repeat(100).as_str()).len(), MAX_COLUMN_NAME_LEN);
    }

    #[test]
    fn test_generated_names_do_not_collide_with_real_ones() {
        let schema = schema_from_fields(["a", "a_2", "a", "a"]).unwrap();
        assert_eq!(schema.columns(), ["a", "a_2", "a_3", "a_4"]);

        let schema = schema_from_fields(["_1", ""]).unwrap();
        assert_eq!(schema.columns(), ["_1", "_1_2"]);
    }

    #[test]
    fn test_sanitized_collisions_are_disambiguated() {
        let schema = schema_from_fields(["first name", "first_name", "first-name"]).unwrap();
        assert_eq!(schema.columns(), ["first_name", "first_name_2", "first-name"]);
    }

    #[test]
    fn test_empty_header_is_rejected() {
        assert_eq!(
            map_header_line("", Delimiter::Comma).unwrap_err(),
            SchemaError::EmptyHeader
        );
        assert_eq!(
            map_header_line("   \r\n", Delimiter::Tab).unwrap_err(),
            SchemaError::EmptyHeader
        );
        assert_eq!(
            schema_from_fields(Vec::<String>::new()).unwrap_err(),
            SchemaError::NoColumns
        );
    }

    #[test]
    fn test_quoted_header_fields() {
        let schema = map_header_line("\"last; first\";age", Delimiter::Semicolon).unwrap();
        assert_eq!(schema.columns(), ["last__first", "age"]);
    }

    #[test]
    fn test_column_count_matches_header() {
        let schema = map_header_line("a|b||c|", Delimiter::Pipe).unwrap();
        assert_eq!(schema.len(), 5);
        assert_eq!(schema.columns(), ["a", "b", "_2", "c", "_4"]);
    }
}
