/// Fold a finished share of a sub-step into the running total:
/// `parent + local/100 * weight`, clamped to `0..=100`.
pub fn compose(parent: f64, weight: f64, local: f64) -> f64 {
    let local = local.clamp(0.0, 100.0);
    (parent + local / 100.0 * weight).clamp(0.0, 100.0)
}

/// Running progress of one task. The published value is an integer that
/// never goes down.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    total: f64,
    published: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&self) -> u8 {
        self.published
    }

    /// Adds a weighted share. Returns the new percentage when it moved.
    pub fn add(&mut self, weight: f64, local: f64) -> Option<u8> {
        let next = compose(self.total, weight, local);
        self.set(next)
    }

    /// Moves to `value` unless that would go backwards.
    pub fn set(&mut self, value: f64) -> Option<u8> {
        let value = value.clamp(0.0, 100.0);
        if value > self.total {
            self.total = value;
        }
        let percent = self.total.floor() as u8;
        if percent > self.published {
            self.published = percent;
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_is_weighted_sum() {
        assert_eq!(compose(0.0, 10.0, 100.0), 10.0);
        assert_eq!(compose(10.0, 90.0, 50.0), 55.0);
        assert_eq!(compose(95.0, 20.0, 100.0), 100.0);
        assert_eq!(compose(40.0, 10.0, -30.0), 40.0);
    }

    #[test]
    fn tracker_reports_only_integer_moves() {
        let mut p = ProgressTracker::new();
        assert_eq!(p.add(0.4, 100.0), None);
        assert_eq!(p.add(0.4, 100.0), None);
        assert_eq!(p.add(0.4, 100.0), Some(1));
        assert_eq!(p.percent(), 1);
    }

    #[test]
    fn tracker_never_decreases() {
        let mut p = ProgressTracker::new();
        assert_eq!(p.set(60.0), Some(60));
        assert_eq!(p.set(30.0), None);
        assert_eq!(p.percent(), 60);
        assert_eq!(p.set(250.0), Some(100));
    }
}
