//! Comparison key construction.
//!
//! A comparison key pairs an incoming record with an existing row. Each
//! match field contributes its stringified value; values are escaped
//! (`~` becomes `~~`, `|` becomes `~|`) and joined with `|`.
//!
//! A null contribution yields no key at all, following SQL where `NULL`
//! never equals `NULL`: such a record is never matched.

use crate::import::fields::MatchField;
use crate::record::Record;
use crate::value::Value;

const SEPARATOR: char = '|';
const ESCAPE: char = '~';

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if c == ESCAPE || c == SEPARATOR {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Build the key for one record.
///
/// # Arguments
/// * `match_by` - Match fields in configured order
/// * `attributes` - The record's attributes, handed to transforms
/// * `read` - Reads a field's value (cast or raw, depending on the mode)
///
/// # Returns
/// `None` when any contributing value is null.
pub(crate) fn comparison_key_with<F>(
    match_by: &[MatchField],
    attributes: &Record,
    read: F,
) -> Option<String>
where
    F: Fn(&str) -> Value,
{
    let mut key = String::new();

    for (i, field) in match_by.iter().enumerate() {
        let raw = read(field.name());
        let value = match field {
            MatchField::Column(_) => raw,
            MatchField::Transformed { transform, .. } => transform(&raw, attributes),
        };

        if value.is_null() {
            return None;
        }

        if i > 0 {
            key.push(SEPARATOR);
        }
        escape_into(&mut key, &value.to_key_string());
    }

    Some(key)
}

/// Comparison key of a plain record.
pub fn comparison_key(match_by: &[MatchField], record: &Record) -> Option<String> {
    comparison_key_with(match_by, record, |field| record.value(field))
}
