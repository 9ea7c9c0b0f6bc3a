use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::{debug, info};

use crate::config::{ModelConfig, OptimizerConfig, TrainingConfig};
use crate::data::DataLoader;
use crate::model::{LinearAttention, cross_entropy_loss};
use crate::optim::{ModelOptimizer, clip_grad_norm, grads};

/// Outcome of a single optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    /// Mean loss over the step's micro-batches
    pub loss: f64,
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    pub learning_rate: f64,
}

pub struct Trainer {
    model: LinearAttention,
    optimizer: ModelOptimizer,
    var_map: VarMap,
    model_config: ModelConfig,
    optimizer_config: OptimizerConfig,
    training_config: TrainingConfig,
    device: Device,
    global_step: usize,
}

impl Trainer {
    pub fn new(
        model_config: ModelConfig,
        optimizer_config: OptimizerConfig,
        training_config: TrainingConfig,
        device: Device,
    ) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = LinearAttention::new(&model_config, vb)?;
        let optimizer = ModelOptimizer::new(var_map.all_vars(), &optimizer_config)?;

        info!(
            "Initialized model with {} parameters ({} optimizer)",
            model.num_parameters(),
            optimizer.name()
        );

        let mut trainer = Self {
            model,
            optimizer,
            var_map,
            model_config,
            optimizer_config,
            training_config,
            device,
            global_step: 0,
        };

        if let Some(path) = trainer.training_config.resume_from.clone() {
            trainer.load_checkpoint(&path)?;
            info!("Resumed weights from {}", path.display());
        }

        Ok(trainer)
    }

    /// Mean loss and averaged gradients over `batches`.
    fn compute_grads(&self, batches: &[(Tensor, Tensor)], vars: &[Var]) -> Result<(f64, GradStore)> {
        let mut total_loss = 0.0;
        let mut store: Option<GradStore> = None;

        for (input, target) in batches {
            let (loss, local) = self.model.backward(input, target)?;
            total_loss += loss as f64;
            match store.as_mut() {
                None => store = Some(local),
                Some(acc) => {
                    let params: Vec<&Tensor> = vars.iter().map(|v| v.as_tensor()).collect();
                    grads::accumulate(acc, &local, &params)?;
                }
            }
        }

        let mut store = store.context("train step needs at least one micro-batch")?;
        let n = batches.len() as f64;
        if batches.len() > 1 {
            grads::scale(&mut store, vars, 1.0 / n)?;
        }
        Ok((total_loss / n, store))
    }

    /// One optimizer step over `batches`, each a micro-batch of the step.
    pub fn train_step(&mut self, batches: &[(Tensor, Tensor)]) -> Result<StepStats> {
        let vars = self.var_map.all_vars();
        let clip = self.training_config.grad_clip;

        let (loss, mut grads) = self.compute_grads(batches, &vars)?;
        let grad_norm = clip_grad_norm(&mut grads, &vars, clip)?;

        if self.optimizer_config.extragradient {
            let snapshot = vars
                .iter()
                .map(|v| v.as_tensor().copy())
                .collect::<candle_core::Result<Vec<_>>>()?;
            self.optimizer.step(&grads)?;

            let (lookahead_loss, mut lookahead) = self.compute_grads(batches, &vars)?;
            clip_grad_norm(&mut lookahead, &vars, clip)?;
            debug!("extragradient lookahead loss {:.4}", lookahead_loss);

            for (var, saved) in vars.iter().zip(&snapshot) {
                var.set(saved)?;
            }
            self.optimizer.step(&lookahead)?;
        } else {
            self.optimizer.step(&grads)?;
        }

        self.global_step += 1;
        Ok(StepStats {
            loss,
            grad_norm,
            learning_rate: self.optimizer.learning_rate(),
        })
    }

    fn progress_bar(len: usize) -> ProgressBar {
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }

    fn train_epoch(
        &mut self,
        train_loader: &mut DataLoader,
        mut eval_loader: Option<&mut DataLoader>,
        checkpoint_dir: Option<&Path>,
        total_steps: usize,
    ) -> Result<f64> {
        let accumulation = self.training_config.gradient_accumulation_steps.max(1);
        let pb = Self::progress_bar(train_loader.num_batches() / accumulation);

        let mut total_loss = 0.0;
        let mut num_steps = 0;
        let mut pending = Vec::with_capacity(accumulation);

        train_loader.reset();

        while let Some(batch) = train_loader.next_batch(&self.device)? {
            pending.push(batch);
            if pending.len() < accumulation {
                continue;
            }

            let lr = lr_schedule(
                self.global_step,
                self.training_config.warmup_steps,
                self.optimizer_config.learning_rate,
                self.training_config.min_learning_rate,
                total_steps,
            );
            self.optimizer.set_learning_rate(lr);

            let stats = self.train_step(&pending)?;
            pending.clear();

            if !stats.loss.is_finite() {
                anyhow::bail!("loss diverged at step {}", self.global_step);
            }
            total_loss += stats.loss;
            num_steps += 1;

            if self
                .global_step
                .is_multiple_of(self.training_config.log_every)
            {
                pb.set_message(format!("{:.4}", stats.loss));
                info!(
                    "step {} loss {:.4} grad_norm {:.4} lr {:.3e}",
                    self.global_step, stats.loss, stats.grad_norm, stats.learning_rate
                );
            }

            let eval_every = self.training_config.eval_every;
            if eval_every > 0
                && self.global_step.is_multiple_of(eval_every)
                && let Some(eval) = eval_loader.as_deref_mut()
            {
                let eval_loss = self.evaluate(eval)?;
                info!("step {} eval loss {:.4}", self.global_step, eval_loss);
            }

            let save_every = self.training_config.save_every;
            if save_every > 0
                && self.global_step.is_multiple_of(save_every)
                && let Some(dir) = checkpoint_dir
            {
                let path = dir.join(format!("step_{}.safetensors", self.global_step));
                self.save_checkpoint(&path)?;
                info!("Saved checkpoint to {}", path.display());
            }

            pb.inc(1);

            if self.global_step >= total_steps {
                break;
            }
        }

        pb.finish_with_message("done");

        if num_steps > 0 {
            Ok(total_loss / num_steps as f64)
        } else {
            Ok(0.0)
        }
    }

    /// Optimizer steps `train` will run for this loader.
    pub fn planned_steps(&self, train_loader: &DataLoader) -> usize {
        let accumulation = self.training_config.gradient_accumulation_steps.max(1);
        let per_epoch = train_loader.num_batches() / accumulation;
        let planned = self.global_step + per_epoch * self.training_config.epochs;
        match self.training_config.max_steps {
            Some(max) => planned.min(max),
            None => planned,
        }
    }

    pub fn evaluate(&self, eval_loader: &mut DataLoader) -> Result<f64> {
        let mut total_loss = 0.0;
        let mut num_batches = 0;

        eval_loader.reset();

        while let Some((input, target)) = eval_loader.next_batch(&self.device)? {
            let logits = self.model.predict(&input)?;
            let loss = cross_entropy_loss(&logits, &target)?;

            total_loss += loss.to_scalar::<f32>()? as f64;
            num_batches += 1;
        }

        if num_batches > 0 {
            Ok(total_loss / num_batches as f64)
        } else {
            Ok(0.0)
        }
    }

    pub fn train(
        &mut self,
        train_loader: &mut DataLoader,
        mut eval_loader: Option<&mut DataLoader>,
        checkpoint_dir: Option<&Path>,
    ) -> Result<()> {
        let total_steps = self.planned_steps(train_loader);
        if total_steps <= self.global_step {
            anyhow::bail!(
                "nothing to train: {} batches of {} sequences with {} accumulation steps",
                train_loader.num_batches(),
                self.training_config.batch_size,
                self.training_config.gradient_accumulation_steps
            );
        }

        if let Some(dir) = checkpoint_dir {
            std::fs::create_dir_all(dir)?;
        }

        info!(
            "Starting training for {} epochs ({} steps)",
            self.training_config.epochs, total_steps
        );

        for epoch in 0..self.training_config.epochs {
            info!("Epoch {}/{}", epoch + 1, self.training_config.epochs);

            let train_loss = self.train_epoch(
                train_loader,
                eval_loader.as_deref_mut(),
                checkpoint_dir,
                total_steps,
            )?;
            info!("Epoch {} train loss: {:.4}", epoch + 1, train_loss);

            if let Some(eval) = eval_loader.as_deref_mut() {
                let eval_loss = self.evaluate(eval)?;
                info!("Epoch {} eval loss: {:.4}", epoch + 1, eval_loss);
            }

            if let Some(dir) = checkpoint_dir {
                let path = dir.join(format!("checkpoint_epoch_{}.safetensors", epoch + 1));
                self.save_checkpoint(&path)?;
                self.save_checkpoint(dir.join("latest.safetensors"))?;
                info!("Saved checkpoint to {}", path.display());
            }

            if self.global_step >= total_steps {
                info!("Reached {} steps", self.global_step);
                break;
            }
        }

        Ok(())
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    pub fn model(&self) -> &LinearAttention {
        &self.model
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn optimizer(&self) -> &ModelOptimizer {
        &self.optimizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

/// Linear warmup followed by cosine decay from `max_lr` to `min_lr`.
pub fn lr_schedule(
    step: usize,
    warmup_steps: usize,
    max_lr: f64,
    min_lr: f64,
    total_steps: usize,
) -> f64 {
    if step < warmup_steps {
        return max_lr * (step + 1) as f64 / warmup_steps as f64;
    }
    if total_steps <= warmup_steps || step >= total_steps {
        return min_lr;
    }
    let decay_ratio = (step - warmup_steps) as f64 / (total_steps - warmup_steps) as f64;
    let coeff = 0.5 * (1.0 + (std::f64::consts::PI * decay_ratio).cos());
    min_lr + coeff * (max_lr - min_lr)
}
