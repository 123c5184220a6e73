use serde::{Deserialize, Serialize};

/// Running totals across all closed trades.
///
/// Mutated only by the lifecycle engine on trade close and persisted after
/// every mutation. `consecutive_wins` and `consecutive_losses` are never
/// both nonzero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalStats {
    pub trade_count: u64,
    pub max_loss: f64,
    pub losses_count: u64,
    pub wins_count: u64,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub max_consecutive_wins: u32,
}

impl GlobalStats {
    pub fn record_win(&mut self) {
        self.consecutive_losses = 0;
        self.consecutive_wins += 1;
        self.max_consecutive_wins = self.max_consecutive_wins.max(self.consecutive_wins);
        self.wins_count += 1;
    }

    pub fn record_loss(&mut self) {
        self.consecutive_wins = 0;
        self.consecutive_losses += 1;
        self.max_consecutive_losses = self.max_consecutive_losses.max(self.consecutive_losses);
        self.losses_count += 1;
    }

    /// Called once per close after the win/loss streak update.
    /// `worst_unrealized` is the trade's max adverse excursion (<= 0).
    pub fn record_close(&mut self, worst_unrealized: f64) {
        self.trade_count += 1;
        self.max_loss = self.max_loss.min(worst_unrealized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaks_never_both_nonzero() {
        let mut stats = GlobalStats::default();

        stats.record_win();
        stats.record_win();
        assert_eq!(stats.consecutive_wins, 2);
        assert_eq!(stats.consecutive_losses, 0);

        stats.record_loss();
        assert_eq!(stats.consecutive_wins, 0);
        assert_eq!(stats.consecutive_losses, 1);

        stats.record_win();
        assert_eq!(stats.consecutive_wins, 1);
        assert_eq!(stats.consecutive_losses, 0);
    }

    #[test]
    fn test_streak_maxima_non_decreasing() {
        let mut stats = GlobalStats::default();

        stats.record_win();
        stats.record_win();
        stats.record_win();
        assert_eq!(stats.max_consecutive_wins, 3);

        stats.record_loss();
        stats.record_win();
        assert_eq!(stats.max_consecutive_wins, 3);
        assert_eq!(stats.max_consecutive_losses, 1);

        stats.record_loss();
        stats.record_loss();
        assert_eq!(stats.max_consecutive_losses, 2);
    }

    #[test]
    fn test_record_close_tracks_worst_loss() {
        let mut stats = GlobalStats::default();

        stats.record_loss();
        stats.record_close(-12.5);
        assert_eq!(stats.trade_count, 1);
        assert_eq!(stats.max_loss, -12.5);

        stats.record_win();
        stats.record_close(-3.0);
        assert_eq!(stats.trade_count, 2);
        assert_eq!(stats.max_loss, -12.5);

        stats.record_loss();
        stats.record_close(-20.0);
        assert_eq!(stats.max_loss, -20.0);
    }

    #[test]
    fn test_counts_accumulate() {
        let mut stats = GlobalStats::default();
        stats.record_win();
        stats.record_loss();
        stats.record_loss();

        assert_eq!(stats.wins_count, 1);
        assert_eq!(stats.losses_count, 2);
    }
}
