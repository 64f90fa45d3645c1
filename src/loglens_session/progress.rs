use std::time::Duration;

use tokio::time::Instant;

/// Gates progress updates on elapsed time and on how far the percentage moved. The first
/// update and the one that reaches the total always pass.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    min_percent: f64,
    last: Option<(Instant, u64)>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, min_percent: f64) -> Self {
        Self { interval, min_percent, last: None }
    }

    pub fn should_emit(&mut self, done: u64, total: Option<u64>, now: Instant) -> bool {
        let Some((at, last_done)) = self.last else {
            self.last = Some((now, done));
            return true;
        };

        let reached_total = total.is_some_and(|total| done >= total && last_done < total);
        let emit = reached_total
            || (now.saturating_duration_since(at) >= self.interval
                && match total {
                    Some(total) if total > 0 => {
                        let moved = done.saturating_sub(last_done) as f64 * 100.0 / total as f64;
                        moved >= self.min_percent
                    }
                    _ => done != last_done,
                });

        if emit {
            self.last = Some((now, done));
        }
        emit
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_on_time_and_percent() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200), 1.0);
        let start = Instant::now();

        assert!(throttle.should_emit(0, Some(1_000), start));
        // Too soon.
        assert!(!throttle.should_emit(500, Some(1_000), start + Duration::from_millis(50)));
        // Late enough but under one percent.
        assert!(!throttle.should_emit(5, Some(1_000), start + Duration::from_millis(300)));
        assert!(throttle.should_emit(20, Some(1_000), start + Duration::from_millis(300)));
        // Completion always passes.
        assert!(throttle.should_emit(1_000, Some(1_000), start + Duration::from_millis(301)));
        assert!(!throttle.should_emit(1_000, Some(1_000), start + Duration::from_millis(302)));
    }

    #[test]
    fn unknown_total_falls_back_to_time_only() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100), 1.0);
        let start = Instant::now();
        assert!(throttle.should_emit(1, None, start));
        assert!(!throttle.should_emit(2, None, start + Duration::from_millis(10)));
        assert!(throttle.should_emit(3, None, start + Duration::from_millis(150)));

        throttle.reset();
        assert!(throttle.should_emit(3, None, start + Duration::from_millis(151)));
    }
}
