/// Warmup / inverse-square-root learning-rate schedule around an optimizer
use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::Optimizer;

use crate::{CaptionError, Result};

/// Schedule parameters
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Global multiplier on the schedule
    pub lr_mul: f64,
    /// Model width; the rate scales with `d_model^-0.5`
    pub d_model: usize,
    /// Step at which the rate peaks
    pub n_warmup_steps: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            lr_mul: 2.0,
            d_model: 512,
            n_warmup_steps: 4000,
        }
    }
}

impl ScheduleConfig {
    /// Learning rate at a given step (steps start at 1)
    ///
    /// `lr_mul * d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)`
    ///
    /// The two terms meet at `step == n_warmup_steps`: linear growth before,
    /// inverse-square-root decay after.
    pub fn lr_at_step(&self, step: u64) -> f64 {
        let step = step as f64;
        let warmup = self.n_warmup_steps as f64;
        let d_model = self.d_model as f64;

        self.lr_mul * d_model.powf(-0.5) * step.powf(-0.5).min(step * warmup.powf(-1.5))
    }
}

/// Optimizer wrapper that sets the scheduled rate before every update
///
/// Owns the step counter and the gradients of the last backward pass.
pub struct ScheduledOptimizer<O: Optimizer> {
    optimizer: O,
    schedule: ScheduleConfig,
    n_steps: u64,
    grads: Option<GradStore>,
}

impl<O: Optimizer> ScheduledOptimizer<O> {
    /// Wrap an optimizer and set it to the rate of the first step
    ///
    /// # Arguments
    /// * `optimizer` - Base optimizer, its own rate is overwritten every step
    /// * `lr_mul` - Global multiplier
    /// * `d_model` - Model width
    /// * `n_warmup_steps` - Warmup length in optimizer steps
    pub fn new(optimizer: O, lr_mul: f64, d_model: usize, n_warmup_steps: u64) -> Self {
        let mut scheduled = Self {
            optimizer,
            schedule: ScheduleConfig {
                lr_mul,
                d_model,
                n_warmup_steps,
            },
            n_steps: 0,
            grads: None,
        };
        scheduled.sync_learning_rate();
        scheduled
    }

    /// Continue counting from a restored step
    pub fn with_n_steps(mut self, n_steps: u64) -> Self {
        self.n_steps = n_steps;
        self.sync_learning_rate();
        self
    }

    /// Rate of the last step taken, or of step 1 before any update
    fn sync_learning_rate(&mut self) {
        let lr = self.schedule.lr_at_step(self.n_steps.max(1));
        self.optimizer.set_learning_rate(lr);
    }

    /// Back-propagate `loss` and keep the gradients for the next step
    pub fn backward(&mut self, loss: &Tensor) -> Result<()> {
        self.grads = Some(loss.backward()?);
        Ok(())
    }

    /// Drop gradients from the previous backward pass
    pub fn zero_grad(&mut self) {
        self.grads = None;
    }

    /// Advance the schedule, apply the new rate, then update parameters
    ///
    /// # Returns
    /// The learning rate used for this update
    pub fn step_and_update_lr(&mut self) -> Result<f64> {
        if self.grads.is_none() {
            return Err(CaptionError::Training(
                "step_and_update_lr called before backward".to_string(),
            ));
        }

        let lr = self.update_learning_rate();

        if let Some(grads) = self.grads.as_ref() {
            self.optimizer.step(grads)?;
        }

        Ok(lr)
    }

    fn update_learning_rate(&mut self) -> f64 {
        self.n_steps += 1;
        let lr = self.schedule.lr_at_step(self.n_steps);
        self.optimizer.set_learning_rate(lr);
        lr
    }

    /// Rate currently set on the wrapped optimizer
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Number of updates performed so far
    pub fn n_steps(&self) -> u64 {
        self.n_steps
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::SGD;

    #[test]
    fn test_reference_peak_value() {
        let schedule = ScheduleConfig {
            lr_mul: 2.0,
            d_model: 512,
            n_warmup_steps: 4000,
        };

        let expected = 2.0 * 512f64.powf(-0.5) * 4000f64.powf(-0.5);
        let lr = schedule.lr_at_step(4000);

        assert!((lr - expected).abs() < 1e-12);
        assert!((lr - 0.001397).abs() < 1e-6, "lr at warmup was {}", lr);
    }

    #[test]
    fn test_peak_at_warmup() {
        for (lr_mul, d_model, warmup) in [(2.0, 512, 4000), (0.5, 64, 10), (1.0, 1024, 1)] {
            let schedule = ScheduleConfig {
                lr_mul,
                d_model,
                n_warmup_steps: warmup,
            };
            let peak = schedule.lr_at_step(warmup);

            // Strictly increasing up to the peak
            for step in 1..warmup {
                assert!(schedule.lr_at_step(step) < schedule.lr_at_step(step + 1));
            }

            // Strictly decreasing after it
            for step in warmup..warmup * 3 {
                assert!(schedule.lr_at_step(step + 1) < schedule.lr_at_step(step));
            }

            for step in 1..warmup * 3 {
                assert!(schedule.lr_at_step(step) <= peak + 1e-15);
            }
        }
    }

    #[test]
    fn test_linear_warmup() {
        let schedule = ScheduleConfig {
            lr_mul: 1.0,
            d_model: 16,
            n_warmup_steps: 100,
        };

        let lr1 = schedule.lr_at_step(1);
        let lr50 = schedule.lr_at_step(50);
        assert!((lr50 - 50.0 * lr1).abs() < 1e-12);
    }

    #[test]
    fn test_step_requires_gradients() {
        let var = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let sgd = SGD::new(vec![var], 0.1).unwrap();
        let mut optimizer = ScheduledOptimizer::new(sgd, 1.0, 16, 10);

        assert!(matches!(
            optimizer.step_and_update_lr(),
            Err(CaptionError::Training(_))
        ));
        assert_eq!(optimizer.n_steps(), 0);
    }

    #[test]
    fn test_step_updates_rate_and_parameters() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[1.0f32, -2.0], &device)?;
        let sgd = SGD::new(vec![var.clone()], 123.0)?;
        let mut optimizer = ScheduledOptimizer::new(sgd, 1.0, 16, 10);

        // loss = sum(w^2), grad = 2w
        optimizer.zero_grad();
        let loss = var.as_tensor().sqr()?.sum_all()?;
        optimizer.backward(&loss)?;
        let lr = optimizer.step_and_update_lr()?;

        let expected_lr = optimizer.schedule().lr_at_step(1);
        assert_eq!(optimizer.n_steps(), 1);
        assert!((lr - expected_lr).abs() < 1e-12);
        assert!((optimizer.learning_rate() - expected_lr).abs() < 1e-12);

        let updated = var.as_tensor().to_vec1::<f32>()?;
        let step = (2.0 * expected_lr) as f32;
        assert!((updated[0] - (1.0 - step)).abs() < 1e-6);
        assert!((updated[1] - (-2.0 + 2.0 * step)).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_zero_grad_clears_gradients() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[0.5f32], &device)?;
        let sgd = SGD::new(vec![var.clone()], 0.1)?;
        let mut optimizer = ScheduledOptimizer::new(sgd, 1.0, 16, 10);

        let loss = var.as_tensor().sqr()?.sum_all()?;
        optimizer.backward(&loss)?;
        optimizer.zero_grad();

        assert!(optimizer.step_and_update_lr().is_err());

        Ok(())
    }

    #[test]
    fn test_resumed_counter() {
        let var = Var::new(&[0.0f32], &Device::Cpu).unwrap();
        let sgd = SGD::new(vec![var], 0.1).unwrap();
        let optimizer = ScheduledOptimizer::new(sgd, 1.0, 16, 10).with_n_steps(250);

        assert_eq!(optimizer.n_steps(), 250);
        let expected = optimizer.schedule().lr_at_step(250);
        assert!((optimizer.learning_rate() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rate_before_first_step_follows_schedule() {
        let var = Var::new(&[0.0f32], &Device::Cpu).unwrap();
        let sgd = SGD::new(vec![var], 123.0).unwrap();
        let optimizer = ScheduledOptimizer::new(sgd, 2.0, 512, 4000);

        let expected = optimizer.schedule().lr_at_step(1);
        assert_eq!(optimizer.n_steps(), 0);
        assert!((optimizer.learning_rate() - expected).abs() < 1e-15);
    }
}
