//! Generation of collision-resistant instance and database identifiers.
//!
//! Both follow `<base><sep><yyyyMMdd><sep><HHmmss><sep><suffix>` where the base
//! is the sanitized test id, the timestamp is UTC and the suffix is six random
//! lowercase alphanumeric characters. Instances use `-` as separator and
//! databases use `_`, matching the naming rules of the respective resource.

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

/// Maximum length of an instance or database id.
pub const MAX_ID_LENGTH: usize = 30;

const SUFFIX_LENGTH: usize = 6;
const INSTANCE_SEPARATOR: char = '-';
const DATABASE_SEPARATOR: char = '_';

fn illegal_instance_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("[^a-z0-9-]").expect("valid regex"))
}

fn illegal_database_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("[^a-z0-9_]").expect("valid regex"))
}

/// Instance id for `test_id`, e.g. `test-20240131-235959-a1b2c3`.
pub fn generate_instance_id(test_id: &str) -> String {
    generate_at(
        test_id,
        illegal_instance_chars(),
        INSTANCE_SEPARATOR,
        Utc::now(),
    )
}

/// Database id for `test_id`, e.g. `test_20240131_235959_a1b2c3`.
pub fn generate_database_id(test_id: &str) -> String {
    generate_at(
        test_id,
        illegal_database_chars(),
        DATABASE_SEPARATOR,
        Utc::now(),
    )
}

fn generate_at(
    test_id: &str,
    illegal_chars: &Regex,
    separator: char,
    now: DateTime<Utc>,
) -> String {
    let timestamp = now
        .format(&format!("%Y%m%d{separator}%H%M%S"))
        .to_string();
    let suffix = random_suffix();
    let add_on = format!("{timestamp}{separator}{suffix}");

    let sanitized = illegal_chars
        .replace_all(&test_id.to_lowercase(), separator.to_string())
        .into_owned();
    let max_base = MAX_ID_LENGTH - add_on.len() - 1;
    let base: String = sanitized.chars().take(max_base).collect();
    let base = base.trim_end_matches(separator);

    let id = if base.is_empty() {
        add_on
    } else {
        format!("{base}{separator}{add_on}")
    };
    ensure_leading_letter(id)
}

fn random_suffix() -> String {
    Alphanumeric
        .sample_string(&mut rand::thread_rng(), SUFFIX_LENGTH)
        .to_lowercase()
}

/// Both resource kinds must start with a letter.
fn ensure_leading_letter(id: String) -> String {
    match id.chars().next() {
        Some(c) if c.is_ascii_lowercase() => id,
        _ => {
            let padding = rand::thread_rng().gen_range(b'a'..=b'z') as char;
            let rest: String = id.chars().skip(1).collect();
            format!("{padding}{rest}")
        }
    }
}
