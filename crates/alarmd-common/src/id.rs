use snowflake::SnowflakeIdBucket;
use std::sync::Mutex;

static ID_GENERATOR: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

/// Initialise the snowflake generator.
///
/// `machine_id` and `node_id` must each be in `0..=31`.
pub fn init(machine_id: i32, node_id: i32) {
    let mut gen = ID_GENERATOR.lock().unwrap_or_else(|p| p.into_inner());
    *gen = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Next snowflake id as a decimal string.
pub fn next_id() -> String {
    let mut gen = ID_GENERATOR.lock().unwrap_or_else(|p| p.into_inner());
    let bucket = gen.get_or_insert_with(|| SnowflakeIdBucket::new(1, 1));
    bucket.get_id().to_string()
}

/// Id for a newly created alert (`ALERT-<snowflake>`).
pub fn next_alert_id() -> String {
    format!("ALERT-{}", next_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_next_id_returns_unique_ids() {
        init(1, 1);
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = next_id();
            assert!(!id.is_empty());
            assert!(ids.insert(id), "Duplicate ID generated");
        }
    }

    #[test]
    fn test_alert_id_prefix() {
        init(1, 1);
        let id = next_alert_id();
        assert!(id.starts_with("ALERT-"));
        assert!(id["ALERT-".len()..].parse::<i64>().is_ok(), "{id}");
    }
}
