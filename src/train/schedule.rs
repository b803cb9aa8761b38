//! Learning-rate schedules.

/// Linear warmup from 0 to `peak`, then linear decay to 0 at `total_steps`.
///
/// ```text
/// lr(s) = peak · s / warmup                          s < warmup
///       = peak · (total - s) / (total - warmup)      otherwise
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    peak: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(peak: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            peak,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak * step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.peak;
        }
        let remaining = self.total_steps.saturating_sub(step);
        self.peak * remaining as f64 / decay_steps as f64
    }
}
