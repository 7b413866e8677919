/// Sends alerts at or above `min_level` to one channel, optionally only for
/// some strategies.
#[derive(Debug, Clone)]
pub struct ChannelRoute {
    pub min_level: i64,
    /// Empty means every strategy.
    pub strategy_ids: Vec<i64>,
    pub channel_index: usize,
}

impl ChannelRoute {
    pub fn should_send(&self, level: i64, strategy_id: i64) -> bool {
        level >= self.min_level
            && (self.strategy_ids.is_empty() || self.strategy_ids.contains(&strategy_id))
    }
}
