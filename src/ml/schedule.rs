/// Linear warmup from 0 to `peak` over `warmup_steps`, then linear
/// decay to 0 at `total_steps`. `step` is the number of optimizer
/// steps already taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupLinearSchedule {
    pub peak:         f64,
    pub warmup_steps: usize,
    pub total_steps:  usize,
}

impl WarmupLinearSchedule {
    pub fn new(peak: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { peak, warmup_steps, total_steps }
    }

    pub fn lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = self.total_steps.saturating_sub(step);
        self.peak * remaining as f64 / decay_steps as f64
    }
}
