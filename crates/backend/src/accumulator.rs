//! Fixed-timestep accumulator with catch-up clamping.
//!
//! Elapsed wall time accumulates into `carry_time`; whole fixed steps are
//! emitted and the remainder is retained, so simulation advances at a
//! constant rate no matter how irregular the caller's frame times are. A
//! stalled or suspended host must not trigger unbounded catch-up, so the
//! accumulated total is clamped to `max_skipped_steps` worth of time and
//! the excess is discarded.

/// Fixed-step time accumulator.
#[derive(Debug, Clone)]
pub struct StepAccumulator {
    carry_time: f32,
    fixed_step: f32,
    max_skipped_steps: u32,
}

impl StepAccumulator {
    pub fn new(fixed_step: f32, max_skipped_steps: u32) -> Self {
        Self {
            carry_time: 0.0,
            fixed_step,
            max_skipped_steps: max_skipped_steps.max(1),
        }
    }

    /// Feeds `dt` seconds of wall time and returns how many fixed steps
    /// to advance now. Negative or non-finite input is ignored.
    pub fn advance(&mut self, dt: f32) -> u32 {
        if dt.is_finite() && dt > 0.0 {
            self.carry_time += dt;
        }
        let cap = self.max_skipped_steps as f32 * self.fixed_step;
        if self.carry_time > cap {
            self.carry_time = cap;
        }
        let mut steps = 0;
        while self.carry_time >= self.fixed_step {
            self.carry_time -= self.fixed_step;
            steps += 1;
        }
        steps
    }

    /// Interpolation blend factor for the time left in the accumulator.
    pub fn alpha(&self) -> f32 {
        (self.carry_time / self.fixed_step).clamp(0.0, 1.0)
    }

    pub fn carry_time(&self) -> f32 {
        self.carry_time
    }

    pub fn fixed_step(&self) -> f32 {
        self.fixed_step
    }
}
