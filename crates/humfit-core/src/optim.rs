use log::{debug, info};
use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig, VarStore};

use humfit_utils::var_store::ListTensors;

use crate::error::Result;

/// Settings of a [`PlateauScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate on a plateau.
    pub factor: f64,
    /// Bad epochs tolerated before reducing.
    pub patience: usize,
    /// Relative improvement an epoch needs to count as better.
    pub threshold: f64,
    /// Epochs to wait after a reduction before counting bad epochs again.
    pub cooldown: usize,
    pub min_lr: f64,
    /// Reductions smaller than this are skipped.
    pub eps: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self { factor: 0.1, patience: 5, threshold: 0.1, cooldown: 0, min_lr: 0.0, eps: 1e-8 }
    }
}

/// Reduces a learning rate when a minimised metric stops improving.
///
/// Follows the `min` mode with relative threshold: a metric `a` improves on
/// the best seen so far when `a < best * (1 - threshold)`.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    initial_lr: f64,
    lr: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl PlateauScheduler {
    pub fn new(config: PlateauConfig, lr: f64) -> Self {
        Self { config, initial_lr: lr, lr, best: f64::INFINITY, num_bad_epochs: 0, cooldown_counter: 0 }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn initial_lr(&self) -> f64 {
        self.initial_lr
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Records one epoch's metric. Returns the new learning rate if it was
    /// reduced.
    pub fn step(&mut self, metric: f64) -> Option<f64> {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.config.patience {
            self.cooldown_counter = self.config.cooldown;
            self.num_bad_epochs = 0;
            return self.reduce();
        }
        None
    }

    /// `true` once the rate fell below `ratio` times its initial value.
    pub fn is_decayed(&self, ratio: f64) -> bool {
        self.lr < ratio * self.initial_lr
    }

    fn is_better(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.config.threshold)
    }

    fn reduce(&mut self) -> Option<f64> {
        let new_lr = (self.lr * self.config.factor).max(self.config.min_lr);
        if self.lr - new_lr > self.config.eps {
            self.lr = new_lr;
            Some(new_lr)
        } else {
            None
        }
    }
}

/// A set of trainable tensors with its own Adam optimizer and scheduler.
pub struct ParamGroup {
    name: String,
    vs: VarStore,
    optimizer: nn::Optimizer,
    scheduler: PlateauScheduler,
}

impl std::fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroup")
            .field("name", &self.name)
            .field("variables", &self.vs.len())
            .field("lr", &self.scheduler.lr())
            .finish()
    }
}

impl ParamGroup {
    /// Builds an Adam optimizer over every trainable variable of `vs`.
    ///
    /// # Arguments
    /// * `name` - Used in log lines.
    /// * `vs` - Variable store already holding the group's tensors.
    /// * `lr` - Initial learning rate.
    /// * `config` - Plateau scheduling of the learning rate.
    pub fn new(name: &str, vs: VarStore, lr: f64, config: &PlateauConfig) -> Result<Self> {
        let optimizer = nn::Adam::default().build(&vs, lr)?;
        vs.list_tensors(name);
        Ok(Self {
            name: name.to_string(),
            vs,
            optimizer,
            scheduler: PlateauScheduler::new(config.clone(), lr),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }

    pub fn step(&mut self) {
        self.optimizer.step();
    }

    pub fn lr(&self) -> f64 {
        self.scheduler.lr()
    }

    pub fn scheduler(&self) -> &PlateauScheduler {
        &self.scheduler
    }

    /// Feeds the epoch total to the scheduler and applies a reduced rate.
    pub fn scheduler_step(&mut self, metric: f64) {
        match self.scheduler.step(metric) {
            Some(lr) => {
                info!("reducing learning rate of group {} to {:.4e}", self.name, lr);
                self.optimizer.set_lr(lr);
            }
            None => debug!("group {}: lr {:.4e}, best {:.6}", self.name, self.scheduler.lr(), self.scheduler.best()),
        }
    }
}

/// Stop once both the geometry and texture rates have decayed below `ratio`
/// of their initial values.
pub fn should_stop_early(geometry: &PlateauScheduler, texture: &PlateauScheduler, ratio: f64) -> bool {
    geometry.is_decayed(ratio) && texture.is_decayed(ratio)
}
