use candle_core::{backprop::GradStore, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use finetune_core::{LearningRateSchedule, TrainingConfig};
use tracing::debug;

/// Which learning rate a parameter group follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Base,
    Differential,
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    /// Parameters whose name contains any of these follow `differential_learning_rate`.
    pub differential_layers: Vec<String>,
    pub differential_learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl OptimizerSettings {
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            differential_layers: training.differential_learning_rate_layers.clone(),
            differential_learning_rate: training.differential_learning_rate,
            weight_decay: training.weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct ParamGroup {
    role: GroupRole,
    decay: bool,
    base_lr: f64,
    params: usize,
    optimizer: AdamW,
}

impl std::fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroup")
            .field("role", &self.role)
            .field("decay", &self.decay)
            .field("base_lr", &self.base_lr)
            .field("lr", &self.optimizer.learning_rate())
            .field("params", &self.params)
            .finish()
    }
}

/// AdamW over parameter groups that differ in base learning rate and weight decay.
///
/// Groups are laid out as base/decay, base/no-decay, differential/decay,
/// differential/no-decay; empty groups are skipped. Biases and norm weights get no
/// weight decay.
#[derive(Debug)]
pub struct GroupedAdamW {
    groups: Vec<ParamGroup>,
}

impl GroupedAdamW {
    pub fn new(
        named_vars: Vec<(String, Var)>,
        settings: &OptimizerSettings,
    ) -> candle_core::Result<Self> {
        let mut buckets: [Vec<Var>; 4] = Default::default();
        for (name, var) in named_vars {
            let differential = settings
                .differential_layers
                .iter()
                .any(|layer| name.contains(layer.as_str()));
            let no_decay = name.ends_with("bias") || name.contains("norm");
            let index = usize::from(differential) * 2 + usize::from(no_decay);
            buckets[index].push(var);
        }

        let mut groups = Vec::new();
        for (index, vars) in buckets.into_iter().enumerate() {
            if vars.is_empty() {
                continue;
            }
            let role = if index >= 2 {
                GroupRole::Differential
            } else {
                GroupRole::Base
            };
            let decay = index % 2 == 0;
            let base_lr = match role {
                GroupRole::Base => settings.learning_rate,
                GroupRole::Differential => settings.differential_learning_rate,
            };
            let params = vars.len();
            let optimizer = AdamW::new(
                vars,
                ParamsAdamW {
                    lr: base_lr,
                    beta1: settings.beta1,
                    beta2: settings.beta2,
                    eps: settings.eps,
                    weight_decay: if decay { settings.weight_decay } else { 0.0 },
                },
            )?;
            groups.push(ParamGroup {
                role,
                decay,
                base_lr,
                params,
                optimizer,
            });
        }
        debug!(groups = groups.len(), "Built optimizer parameter groups");
        Ok(Self { groups })
    }

    /// Current learning rate of the first group with `role`.
    pub fn learning_rate(&self, role: GroupRole) -> Option<f64> {
        self.groups
            .iter()
            .find(|g| g.role == role)
            .map(|g| g.optimizer.learning_rate())
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Sets every group to `factor` times its base learning rate.
    pub fn set_lr_factor(&mut self, factor: f64) {
        for group in &mut self.groups {
            group.optimizer.set_learning_rate(group.base_lr * factor);
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for group in &mut self.groups {
            group.optimizer.step(grads)?;
        }
        Ok(())
    }
}

/// Drives a [`LearningRateSchedule`] over a [`GroupedAdamW`].
#[derive(Debug, Clone)]
pub struct LrScheduler {
    schedule: LearningRateSchedule,
    step: u64,
}

impl LrScheduler {
    /// Applies the step-0 learning rate immediately.
    pub fn new(schedule: LearningRateSchedule, optimizer: &mut GroupedAdamW) -> Self {
        optimizer.set_lr_factor(schedule.factor(0));
        Self { schedule, step: 0 }
    }

    pub fn step(&mut self, optimizer: &mut GroupedAdamW) {
        self.step += 1;
        optimizer.set_lr_factor(self.schedule.factor(self.step));
    }

    pub fn current_step(&self) -> u64 {
        self.step
    }
}
