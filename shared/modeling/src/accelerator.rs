use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use finetune_core::MixedPrecision;
use tracing::trace;

use crate::{Autocast, DistributedError, GroupedAdamW, ProcessGroup};

/// One worker's view of the run: its rank, its device, and the gradient
/// accumulation window it is in.
///
/// Gradients from [`Accelerator::backward`] are summed locally and averaged across
/// the group only on synchronizing micro-steps. Optimizer steps and gradient
/// resets are no-ops between synchronizations.
#[derive(Debug)]
pub struct Accelerator {
    group: ProcessGroup,
    rank: usize,
    device: Device,
    mixed_precision: MixedPrecision,
    grad_accumulation: usize,
    micro_step: usize,
    sync_gradients: bool,
    grads: Option<GradStore>,
}

impl Accelerator {
    pub fn new(
        group: ProcessGroup,
        rank: usize,
        device: Device,
        mixed_precision: MixedPrecision,
        grad_accumulation: usize,
    ) -> Self {
        Self {
            group,
            rank,
            device,
            mixed_precision,
            grad_accumulation: grad_accumulation.max(1),
            micro_step: 0,
            sync_gradients: true,
            grads: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Rank 0 owns logging, metrics, checkpoints and status files.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn grad_accumulation(&self) -> usize {
        self.grad_accumulation
    }

    pub fn wait_for_everyone(&self) -> Result<(), DistributedError> {
        self.group.barrier()
    }

    pub fn gather<T>(&self, value: T) -> Result<Vec<T>, DistributedError>
    where
        T: Clone + Send + 'static,
    {
        self.group.all_gather(self.rank, value)
    }

    /// Concatenates `tensor` from every rank along the leading dimension, in rank order.
    pub fn gather_concat(&self, tensor: &Tensor) -> Result<Tensor, DistributedError> {
        if !self.is_distributed() {
            return Ok(tensor.clone());
        }
        let parts = self.gather(tensor.to_device(&Device::Cpu)?)?;
        Ok(Tensor::cat(&parts, 0)?.to_device(&self.device)?)
    }

    /// Runs `f` inside the configured mixed-precision scope.
    pub fn autocast<R>(&self, f: impl FnOnce(Autocast) -> R) -> R {
        f(Autocast::for_precision(self.mixed_precision))
    }

    /// Runs one micro-step of the accumulation window.
    ///
    /// Gradients synchronize on the last micro-step of the window, or immediately
    /// when `force_sync` is set (the last batch of an epoch).
    pub fn accumulate<R>(&mut self, force_sync: bool, f: impl FnOnce(&mut Self) -> R) -> R {
        self.micro_step += 1;
        self.sync_gradients = force_sync || self.micro_step % self.grad_accumulation == 0;
        if self.sync_gradients {
            self.micro_step = 0;
        }
        f(self)
    }

    pub fn sync_gradients(&self) -> bool {
        self.sync_gradients
    }

    /// Accumulates the gradients of `loss` for `vars`, averaging them over the
    /// group when this micro-step synchronizes.
    ///
    /// Every rank must call this the same number of times per window.
    pub fn backward(&mut self, loss: &Tensor, vars: &[Var]) -> Result<(), DistributedError> {
        let mut new_grads = loss.backward()?;
        match self.grads.as_mut() {
            None => self.grads = Some(new_grads),
            Some(accum) => {
                for var in vars {
                    if let Some(grad) = new_grads.remove(var.as_tensor()) {
                        let combined = match accum.remove(var.as_tensor()) {
                            Some(existing) => (existing + grad)?,
                            None => grad,
                        };
                        accum.insert(var.as_tensor(), combined);
                    }
                }
            }
        }
        if self.sync_gradients && self.is_distributed() {
            self.all_reduce_mean(vars)?;
        }
        Ok(())
    }

    fn all_reduce_mean(&mut self, vars: &[Var]) -> Result<(), DistributedError> {
        let scale = 1.0 / self.world_size() as f64;
        let Some(grads) = self.grads.as_mut() else {
            return Ok(());
        };
        let local = vars
            .iter()
            .map(|var| {
                grads
                    .get(var.as_tensor())
                    .map(|g| g.to_device(&Device::Cpu))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let world = self.group.all_gather(self.rank, local)?;
        for (index, var) in vars.iter().enumerate() {
            let mut sum: Option<Tensor> = None;
            for rank_grads in &world {
                if let Some(grad) = &rank_grads[index] {
                    sum = Some(match sum {
                        Some(acc) => (acc + grad)?,
                        None => grad.clone(),
                    });
                }
            }
            if let Some(sum) = sum {
                grads.insert(var.as_tensor(), sum.affine(scale, 0.0)?.to_device(&self.device)?);
            }
        }
        trace!(rank = self.rank, vars = vars.len(), "All-reduced gradients");
        Ok(())
    }

    /// Scales accumulated gradients so their global L2 norm is at most `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64, vars: &[Var]) -> Result<f64, DistributedError> {
        let Some(grads) = self.grads.as_mut() else {
            return Ok(0.0);
        };
        let mut sum_squares = 0.0f64;
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sum_squares += grad
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f32>()? as f64;
            }
        }
        let total_norm = sum_squares.sqrt();
        if total_norm > max_norm {
            let clip_coef = max_norm / (total_norm + 1e-6);
            for var in vars {
                if let Some(grad) = grads.remove(var.as_tensor()) {
                    grads.insert(var.as_tensor(), grad.affine(clip_coef, 0.0)?);
                }
            }
        }
        Ok(total_norm)
    }

    /// Applies the accumulated gradients. Returns whether a step was taken.
    pub fn step(&mut self, optimizer: &mut GroupedAdamW) -> Result<bool, DistributedError> {
        if !self.sync_gradients {
            return Ok(false);
        }
        match &self.grads {
            Some(grads) => {
                optimizer.step(grads)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn zero_grad(&mut self) {
        if self.sync_gradients {
            self.grads = None;
        }
    }

    pub fn grads(&self) -> Option<&GradStore> {
        self.grads.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::{thread, time::Duration};

    fn single() -> Accelerator {
        Accelerator::new(
            ProcessGroup::new(1, Duration::from_secs(1)),
            0,
            Device::Cpu,
            MixedPrecision::No,
            2,
        )
    }

    #[test]
    fn accumulation_window_syncs_on_last_micro_step() {
        let mut accelerator = single();
        let flags: Vec<bool> = (0..5)
            .map(|i| accelerator.accumulate(i == 4, |a| a.sync_gradients()))
            .collect();
        assert_eq!(flags, vec![false, true, false, true, true]);
    }

    #[test]
    fn gradients_sum_within_window() {
        let mut accelerator = single();
        let var = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let vars = [var.clone()];
        for _ in 0..2 {
            accelerator.accumulate(false, |a| {
                let loss = var.as_tensor().sum_all().unwrap();
                a.backward(&loss, &vars).unwrap();
            });
        }
        let grad = accelerator.grads().unwrap().get(var.as_tensor()).unwrap();
        assert_eq!(grad.to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
        accelerator.zero_grad();
        assert!(accelerator.grads().is_none());
    }

    #[test]
    fn clip_bounds_global_norm() {
        let mut accelerator = single();
        let var = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
        let vars = [var.clone()];
        let weights = Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        accelerator.accumulate(true, |a| {
            let loss = (var.as_tensor() * &weights).unwrap().sum_all().unwrap();
            a.backward(&loss, &vars).unwrap();
            let norm = a.clip_grad_norm(1.0, &vars).unwrap();
            assert_relative_eq!(norm, 5.0, epsilon = 1e-6);
        });
        let grad = accelerator.grads().unwrap().get(var.as_tensor()).unwrap();
        let clipped = grad.to_vec1::<f32>().unwrap();
        assert_relative_eq!(clipped[0], 0.6, epsilon = 1e-4);
        assert_relative_eq!(clipped[1], 0.8, epsilon = 1e-4);
    }

    #[test]
    fn gradients_are_averaged_across_ranks() {
        let group = ProcessGroup::new(2, Duration::from_secs(5));
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let group = group.clone();
                thread::spawn(move || {
                    let mut accelerator =
                        Accelerator::new(group, rank, Device::Cpu, MixedPrecision::No, 1);
                    let var = Var::new(&[0.0f32], &Device::Cpu).unwrap();
                    let vars = [var.clone()];
                    let scale = (rank + 1) as f64;
                    accelerator.accumulate(false, |a| {
                        let loss = var.as_tensor().affine(scale, 0.0).unwrap().sum_all().unwrap();
                        a.backward(&loss, &vars).unwrap();
                    });
                    let grad = accelerator.grads().unwrap().get(var.as_tensor()).unwrap();
                    grad.to_vec1::<f32>().unwrap()[0]
                })
            })
            .collect();
        for handle in handles {
            assert_relative_eq!(handle.join().unwrap(), 1.5);
        }
    }

    #[test]
    fn gather_concat_preserves_rank_order() {
        let group = ProcessGroup::new(3, Duration::from_secs(5));
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let group = group.clone();
                thread::spawn(move || {
                    let accelerator =
                        Accelerator::new(group, rank, Device::Cpu, MixedPrecision::No, 1);
                    let local = Tensor::new(&[rank as u32, rank as u32], &Device::Cpu).unwrap();
                    accelerator
                        .gather_concat(&local)
                        .unwrap()
                        .to_vec1::<u32>()
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![0, 0, 1, 1, 2, 2]);
        }
    }
}
