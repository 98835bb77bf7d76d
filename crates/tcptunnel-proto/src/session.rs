//! Session id and random token helpers

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Current wall clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random alphanumeric string of `len` characters
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a time-ordered, collision-resistant session id
///
/// Format: `<epoch millis>.<16 random alphanumerics>`
pub fn generate_session_id() -> String {
    format!("{}.{}", now_millis(), random_string(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_string_length_and_charset() {
        let s = random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_session_id_starts_with_timestamp() {
        let before = now_millis();
        let id = generate_session_id();
        let (ts, rand_part) = id.split_once('.').unwrap();
        let ts: i64 = ts.parse().unwrap();
        assert!(ts >= before);
        assert_eq!(rand_part.len(), 16);
    }
}
