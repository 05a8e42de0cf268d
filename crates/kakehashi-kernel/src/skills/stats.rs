use std::time::Duration;

use kakehashi_types::StatsSnapshot;

/// Rolling counters over every skill invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    total: u64,
    succeeded: u64,
    failed: u64,
    total_time: Duration,
}

impl ExecutionStats {
    pub fn record(&mut self, success: bool, elapsed: Duration) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_time += elapsed;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_time = self.total_time.as_secs_f64();
        let (average_time, success_rate) = if self.total == 0 {
            (0.0, 0.0)
        } else {
            (
                total_time / self.total as f64,
                self.succeeded as f64 / self.total as f64,
            )
        };
        StatsSnapshot {
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            total_time,
            average_time,
            success_rate,
        }
    }
}
