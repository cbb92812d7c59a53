//! Opaque identifiers: a UTC timestamp plus a short random suffix.

use chrono::{DateTime, Utc};
use rand::Rng;

const SUFFIX_LEN: usize = 6;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate an id like `soul-20261018T101500123-k3x9qa`.
pub fn generate_id(prefix: &str) -> String {
    generate_id_at(prefix, Utc::now())
}

pub fn generate_id_at(prefix: &str, now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{prefix}-{}-{suffix}", now.format("%Y%m%dT%H%M%S%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn id_embeds_prefix_and_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 10, 15, 0).unwrap();
        let id = generate_id_at("soul", now);
        assert!(id.starts_with("soul-20261018T101500000-"), "got {id}");
        assert_eq!(id.len(), "soul-20261018T101500000-".len() + SUFFIX_LEN);
    }

    #[test]
    fn ids_generated_at_the_same_instant_differ() {
        let now = Utc::now();
        let a = generate_id_at("agent", now);
        let b = generate_id_at("agent", now);
        assert_ne!(a, b);
    }
}
