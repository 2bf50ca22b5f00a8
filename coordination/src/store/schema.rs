//! Column family definitions for the RocksDB state store
//!
//! Time-ordered keys embed a zero-padded nanosecond timestamp so a forward
//! iterator walks records oldest first.

/// Column family for strike records
pub const CF_STRIKES: &str = "strikes";

/// Column family for coordination results
pub const CF_RESULTS: &str = "results";

/// Column family for escalation tasks
pub const CF_ESCALATIONS: &str = "escalations";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_STRIKES, CF_RESULTS, CF_ESCALATIONS];

/// Key builders for compound keys
pub mod keys {
    use crate::strikes::StrikeCategory;

    /// Prefix shared by every strike of one subject and category
    pub fn strike_prefix(subject_id: &str, category: StrikeCategory) -> String {
        format!("strike:{}:{}:", category.as_str(), subject_id)
    }

    /// Strike key, ordered by timestamp within its prefix
    pub fn strike(
        subject_id: &str,
        category: StrikeCategory,
        timestamp_nanos: i64,
        strike_id: &str,
    ) -> String {
        format!(
            "{}{:020}:{}",
            strike_prefix(subject_id, category),
            timestamp_nanos.max(0),
            strike_id
        )
    }

    /// Result key (completion-time ordered)
    pub fn result(timestamp_nanos: i64, event_id: &str) -> String {
        format!("res:{:020}:{}", timestamp_nanos.max(0), event_id)
    }

    /// Escalation task key
    pub fn escalation(escalation_id: &str) -> String {
        format!("esc:{}", escalation_id)
    }

    /// Parse the timestamp out of a result key
    pub fn parse_result_timestamp(key: &str) -> Option<i64> {
        let parts: Vec<&str> = key.splitn(3, ':').collect();
        if parts.len() >= 2 && parts[0] == "res" {
            parts[1].parse().ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strikes::StrikeCategory;

    #[test]
    fn test_key_generation() {
        assert_eq!(keys::escalation("abc"), "esc:abc");
        assert_eq!(
            keys::strike_prefix("tech-1", StrikeCategory::Quality),
            "strike:quality:tech-1:"
        );
        assert!(keys::strike("tech-1", StrikeCategory::Quality, 5, "s1")
            .starts_with("strike:quality:tech-1:"));
    }

    #[test]
    fn test_time_keys_sort_chronologically() {
        let a = keys::strike("u", StrikeCategory::Punctuality, 1_000, "z");
        let b = keys::strike("u", StrikeCategory::Punctuality, 20_000, "a");
        assert!(a < b);
        assert!(keys::result(1, "e") < keys::result(2, "a"));
    }

    #[test]
    fn test_parse_result_timestamp() {
        let key = keys::result(12345, "evt-1");
        assert_eq!(keys::parse_result_timestamp(&key), Some(12345));
        assert_eq!(keys::parse_result_timestamp("esc:1"), None);
    }
}
