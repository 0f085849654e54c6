use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// The value every real metric beats.
    pub fn initial(self) -> f64 {
        match self {
            ObjectiveDirection::Maximize => f64::NEG_INFINITY,
            ObjectiveDirection::Minimize => f64::INFINITY,
        }
    }

    /// Strict comparison; ties and `NaN` never improve.
    pub fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > best,
            ObjectiveDirection::Minimize => candidate < best,
        }
    }
}

/// Best metric value seen so far under a fixed direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Objective {
    direction: ObjectiveDirection,
    best: f64,
}

impl Objective {
    pub fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            best: direction.initial(),
        }
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn is_improvement(&self, value: f64) -> bool {
        self.direction.improves(value, self.best)
    }

    pub fn record(&mut self, value: f64) {
        self.best = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ObjectiveDirection::Maximize, 0.5, 0.4, true)]
    #[case(ObjectiveDirection::Maximize, 0.5, 0.5, false)]
    #[case(ObjectiveDirection::Maximize, 0.3, 0.4, false)]
    #[case(ObjectiveDirection::Minimize, 0.3, 0.4, true)]
    #[case(ObjectiveDirection::Minimize, 0.4, 0.4, false)]
    #[case(ObjectiveDirection::Minimize, 0.5, 0.4, false)]
    #[case(ObjectiveDirection::Maximize, f64::NAN, 0.4, false)]
    #[case(ObjectiveDirection::Minimize, f64::NAN, 0.4, false)]
    fn strict_comparison(
        #[case] direction: ObjectiveDirection,
        #[case] candidate: f64,
        #[case] best: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(direction.improves(candidate, best), expected);
    }

    #[test]
    fn first_finite_value_always_improves() {
        for direction in [ObjectiveDirection::Maximize, ObjectiveDirection::Minimize] {
            let objective = Objective::new(direction);
            assert!(objective.is_improvement(0.0));
            assert!(objective.is_improvement(-1e30));
            assert!(objective.is_improvement(1e30));
        }
    }

    #[test]
    fn record_moves_the_bar() {
        let mut objective = Objective::new(ObjectiveDirection::Maximize);
        objective.record(0.7);
        assert!(!objective.is_improvement(0.7));
        assert!(objective.is_improvement(0.71));
        assert_eq!(objective.best(), 0.7);
    }
}
