use std::collections::VecDeque;

/// The most recent `CAPACITY` loss values, oldest evicted first.
#[derive(Debug, Default, Clone)]
pub struct LossWindow<const CAPACITY: usize> {
    values: VecDeque<f64>,
}

impl<const CAPACITY: usize> LossWindow<CAPACITY> {
    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        if self.values.len() > CAPACITY {
            self.values.pop_front();
        }
    }

    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Arithmetic mean of the window, `NaN` when empty or when any entry is non-finite.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_window() {
        let window = LossWindow::<10>::default();
        assert!(window.is_empty());
        assert!(window.mean().is_nan());
        assert_eq!(window.last(), None);
    }

    #[test]
    fn test_mean_within_capacity() {
        let mut window = LossWindow::<4>::default();
        window.push(1.0);
        window.push(2.0);
        window.push(3.0);
        assert_relative_eq!(window.mean(), 2.0);
        assert_eq!(window.last(), Some(3.0));
    }

    #[test]
    fn test_evicts_oldest() {
        let mut window = LossWindow::<3>::default();
        for v in [10.0, 1.0, 2.0, 3.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_relative_eq!(window.mean(), 2.0);
    }

    #[test]
    fn test_non_finite_poisons_mean() {
        let mut window = LossWindow::<3>::default();
        window.push(1.0);
        window.push(f64::NAN);
        assert!(window.mean().is_nan());
        window.push(1.0);
        window.push(1.0);
        window.push(1.0);
        assert_relative_eq!(window.mean(), 1.0);
    }
}
