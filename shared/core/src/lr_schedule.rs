use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScheduleKind {
    Constant,
    Linear,
    #[default]
    Cosine,
}

/// A multiplicative learning-rate schedule with linear warmup.
///
/// `factor(step)` scales every parameter group's base learning rate, so groups with
/// different base rates keep their ratio throughout training.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LearningRateSchedule {
    pub kind: ScheduleKind,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl LearningRateSchedule {
    pub fn new(kind: ScheduleKind, warmup_steps: u64, total_steps: u64) -> Self {
        Self {
            kind,
            warmup_steps,
            total_steps,
        }
    }

    pub fn factor(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        match self.kind {
            ScheduleKind::Constant => 1.0,
            ScheduleKind::Linear => 1.0 - progress,
            ScheduleKind::Cosine => 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn warmup_is_linear() {
        let schedule = LearningRateSchedule::new(ScheduleKind::Cosine, 10, 110);
        assert_relative_eq!(schedule.factor(0), 0.0);
        assert_relative_eq!(schedule.factor(5), 0.5);
        assert_relative_eq!(schedule.factor(10), 1.0);
    }

    #[test]
    fn cosine_reaches_zero() {
        let schedule = LearningRateSchedule::new(ScheduleKind::Cosine, 0, 100);
        assert_relative_eq!(schedule.factor(0), 1.0);
        assert_relative_eq!(schedule.factor(50), 0.5, epsilon = 1e-12);
        assert_relative_eq!(schedule.factor(100), 0.0, epsilon = 1e-12);
        assert_relative_eq!(schedule.factor(500), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn linear_and_constant() {
        let linear = LearningRateSchedule::new(ScheduleKind::Linear, 0, 4);
        assert_relative_eq!(linear.factor(1), 0.75);
        let constant = LearningRateSchedule::new(ScheduleKind::Constant, 2, 4);
        assert_relative_eq!(constant.factor(1), 0.5);
        assert_relative_eq!(constant.factor(3), 1.0);
    }
}
