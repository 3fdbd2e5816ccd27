//! Configuration of single layers and of whole stacks.
//!
//! Every knob of a layer lives in [`LayerConfig`]; variants that would otherwise be separate
//! layer types (pooling, visible unit type, decay kind, sparsity method, CD flavour) are small
//! enums selected here. All configurations are validated before anything gets allocated.
use serde_derive::{Deserialize, Serialize};

use crate::errors::{ConfigError, ConfigResult};

/// Type of the visible units of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisibleUnit {
    /// Bernoulli units, the input is expected in [0, 1].
    Binary,
    /// Linear units with unit variance gaussian noise.
    Gaussian,
}

/// Pooling applied on top of the hidden maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pooling {
    None,
    /// Probabilistic max pooling over non-overlapping `ratio x ratio` blocks
    /// (Lee et al., 2009, <https://doi.org/10.1145/1553374.1553453>).
    ProbabilisticMax { ratio: usize },
}

/// Flavour of contrastive divergence used to estimate the negative statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdKind {
    /// CD-k, the chain restarts from the data for every batch.
    Contrastive { steps: usize },
    /// PCD-k, the chain state is carried over from batch to batch.
    Persistent { steps: usize },
}

impl CdKind {
    pub fn steps(&self) -> usize {
        match *self {
            CdKind::Contrastive { steps } | CdKind::Persistent { steps } => steps,
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, CdKind::Persistent { .. })
    }
}

/// Momentum schedule: `initial` is used until `final_epoch`, `final_value` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    pub initial: f64,
    pub final_value: f64,
    pub final_epoch: usize,
}

impl Momentum {
    /// Constant momentum.
    pub fn constant(value: f64) -> Self {
        Self {
            initial: value,
            final_value: value,
            final_epoch: 0,
        }
    }

    /// Momentum coefficient for the given (zero based) epoch.
    pub fn at_epoch(&self, epoch: usize) -> f64 {
        if epoch >= self.final_epoch {
            self.final_value
        } else {
            self.initial
        }
    }
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            initial: 0.5,
            final_value: 0.9,
            final_epoch: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecayKind {
    /// `cost * sign(w)` on the filter weights
    L1,
    /// `cost * w` on the filter weights
    L2,
    /// L1 on the filter weights and the hidden biases
    L1Full,
    /// L2 on the filter weights and the hidden biases
    L2Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightDecay {
    pub kind: DecayKind,
    pub cost: f64,
}

impl WeightDecay {
    pub const DEFAULT_COST: f64 = 0.0002;

    pub fn l1(cost: f64) -> Self {
        Self {
            kind: DecayKind::L1,
            cost,
        }
    }

    pub fn l2(cost: f64) -> Self {
        Self {
            kind: DecayKind::L2,
            cost,
        }
    }

    pub fn includes_biases(&self) -> bool {
        matches!(self.kind, DecayKind::L1Full | DecayKind::L2Full)
    }
}

/// Sparsity regularization. Both methods only touch the hidden biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sparsity {
    /// Pushes the mean activation of the current batch towards `target`
    /// (the "pbias" / "pbias_lambda" scheme of Lee et al.).
    Lee { target: f64, penalty: f64 },
    /// Pushes an exponentially decaying running average of the activations towards `target`.
    GlobalTarget { target: f64, penalty: f64, decay: f64 },
}

impl Sparsity {
    /// Decay of the running activation average when the method doesn't define its own.
    pub const DEFAULT_DECAY: f64 = 0.9;

    pub fn lee(target: f64, penalty: f64) -> Self {
        Sparsity::Lee { target, penalty }
    }

    pub fn target(&self) -> f64 {
        match *self {
            Sparsity::Lee { target, .. } | Sparsity::GlobalTarget { target, .. } => target,
        }
    }

    pub fn penalty(&self) -> f64 {
        match *self {
            Sparsity::Lee { penalty, .. } | Sparsity::GlobalTarget { penalty, .. } => penalty,
        }
    }

    pub fn decay(&self) -> f64 {
        match *self {
            Sparsity::GlobalTarget { decay, .. } => decay,
            Sparsity::Lee { .. } => Sparsity::DEFAULT_DECAY,
        }
    }
}

/// Training hyperparameters of a single layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub momentum: Option<Momentum>,
    pub weight_decay: Option<WeightDecay>,
    pub sparsity: Option<Sparsity>,
    pub cd: CdKind,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 50,
            momentum: None,
            weight_decay: None,
            sparsity: None,
            cd: CdKind::Contrastive { steps: 1 },
        }
    }
}

/// Shape and hyperparameters of a convolutional RBM.
///
/// The visible maps are `channels x visible_size x visible_size`, the hidden maps
/// `filters x hidden_size x hidden_size`. Convolutions are valid (no padding, stride 1),
/// so `visible_size - kernel_size + 1 == hidden_size` must hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub visible_size: usize,
    pub channels: usize,
    pub kernel_size: usize,
    pub hidden_size: usize,
    pub filters: usize,
    pub pooling: Pooling,
    pub visible_unit: VisibleUnit,
    pub hyper: HyperParameters,
}

impl LayerConfig {
    /// Layer with binary visible units, no pooling and default hyperparameters.
    /// The kernel size is derived from the visible and hidden sizes.
    pub fn new(visible_size: usize, channels: usize, hidden_size: usize, filters: usize) -> Self {
        let kernel_size = if hidden_size <= visible_size {
            visible_size - hidden_size + 1
        } else {
            0
        };
        Self {
            visible_size,
            channels,
            kernel_size,
            hidden_size,
            filters,
            pooling: Pooling::None,
            visible_unit: VisibleUnit::Binary,
            hyper: HyperParameters::default(),
        }
    }

    pub fn with_pooling(mut self, ratio: usize) -> Self {
        self.pooling = Pooling::ProbabilisticMax { ratio };
        self
    }

    pub fn with_visible_unit(mut self, unit: VisibleUnit) -> Self {
        self.visible_unit = unit;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.hyper.learning_rate = learning_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.hyper.batch_size = batch_size;
        self
    }

    pub fn with_momentum(mut self, momentum: Momentum) -> Self {
        self.hyper.momentum = Some(momentum);
        self
    }

    pub fn with_weight_decay(mut self, decay: WeightDecay) -> Self {
        self.hyper.weight_decay = Some(decay);
        self
    }

    pub fn with_sparsity(mut self, sparsity: Sparsity) -> Self {
        self.hyper.sparsity = Some(sparsity);
        self
    }

    /// Lee sparsity with target activation `pbias` and strength `pbias_lambda`.
    pub fn with_pbias(self, pbias: f64, pbias_lambda: f64) -> Self {
        self.with_sparsity(Sparsity::lee(pbias, pbias_lambda))
    }

    pub fn with_cd(mut self, cd: CdKind) -> Self {
        self.hyper.cd = cd;
        self
    }

    pub fn pooling_ratio(&self) -> Option<usize> {
        match self.pooling {
            Pooling::None => None,
            Pooling::ProbabilisticMax { ratio } => Some(ratio),
        }
    }

    /// Spatial size of the maps this layer hands to the next one.
    pub fn output_size(&self) -> usize {
        match self.pooling_ratio() {
            Some(ratio) if ratio > 0 => self.hidden_size / ratio,
            _ => self.hidden_size,
        }
    }

    /// Number of visible units.
    pub fn input_len(&self) -> usize {
        self.channels * self.visible_size * self.visible_size
    }

    /// Number of output units (pooled units for pooling layers).
    pub fn output_len(&self) -> usize {
        self.filters * self.output_size() * self.output_size()
    }

    /// Returns true if both configurations describe the same parameter shapes.
    pub fn same_shape(&self, other: &LayerConfig) -> bool {
        self.visible_size == other.visible_size
            && self.channels == other.channels
            && self.kernel_size == other.kernel_size
            && self.hidden_size == other.hidden_size
            && self.filters == other.filters
            && self.pooling == other.pooling
            && self.visible_unit == other.visible_unit
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("visible_size", self.visible_size),
            ("channels", self.channels),
            ("kernel_size", self.kernel_size),
            ("hidden_size", self.hidden_size),
            ("filters", self.filters),
        ] {
            if value == 0 {
                return Err(ConfigError::EmptyDimensionError { name });
            }
        }

        let expected = if self.kernel_size <= self.visible_size {
            self.visible_size - self.kernel_size + 1
        } else {
            0
        };
        if expected != self.hidden_size {
            return Err(ConfigError::KernelShapeError {
                visible: self.visible_size,
                kernel: self.kernel_size,
                hidden: self.hidden_size,
                expected,
            });
        }

        if let Some(ratio) = self.pooling_ratio() {
            if ratio == 0 {
                return Err(ConfigError::EmptyDimensionError {
                    name: "pooling ratio",
                });
            }
            if self.hidden_size % ratio != 0 {
                return Err(ConfigError::PoolingShapeError {
                    hidden: self.hidden_size,
                    ratio,
                });
            }
        }

        self.hyper.validate()
    }
}

impl HyperParameters {
    pub fn validate(&self) -> ConfigResult<()> {
        positive("learning_rate", self.learning_rate)?;
        if self.batch_size == 0 {
            return Err(ConfigError::EmptyDimensionError { name: "batch_size" });
        }
        if self.cd.steps() == 0 {
            return Err(ConfigError::EmptyDimensionError { name: "cd steps" });
        }
        if let Some(momentum) = self.momentum {
            unit_interval("momentum", momentum.initial)?;
            unit_interval("final momentum", momentum.final_value)?;
        }
        if let Some(decay) = self.weight_decay {
            non_negative("weight decay cost", decay.cost)?;
        }
        if let Some(sparsity) = self.sparsity {
            let target = sparsity.target();
            if !(target > 0.0 && target < 1.0) {
                return Err(ConfigError::HyperParameterError {
                    name: "sparsity target",
                    requirement: "in (0, 1)",
                    value: target,
                });
            }
            non_negative("sparsity penalty", sparsity.penalty())?;
            unit_interval("sparsity decay", sparsity.decay())?;
        }
        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::HyperParameterError {
            name,
            requirement: "finite and positive",
            value,
        })
    }
}

fn non_negative(name: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::HyperParameterError {
            name,
            requirement: "finite and non-negative",
            value,
        })
    }
}

fn unit_interval(name: &'static str, value: f64) -> ConfigResult<()> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::HyperParameterError {
            name,
            requirement: "in [0, 1)",
            value,
        })
    }
}

/// Which activations form the feature vector of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Output of the last layer only.
    Last,
    /// Outputs of all layers, concatenated in layer order.
    Concatenate,
}

/// Configuration of a whole stack of layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub layers: Vec<LayerConfig>,
    pub output: OutputMode,
    /// Seed of the sampler. Runs are only reproducible if this is set.
    pub seed: Option<u64>,
}

impl StackConfig {
    pub fn new(layers: Vec<LayerConfig>) -> Self {
        Self {
            layers,
            output: OutputMode::Last,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Two plain layers on 28x28 binary images: 28 -> 17x17x40 -> 12x12x40.
    pub fn mnist() -> Self {
        Self::new(vec![
            mnist_layer(LayerConfig::new(28, 1, 17, 40)).with_pbias(0.05, 50.0),
            mnist_layer(LayerConfig::new(17, 40, 12, 40)).with_pbias(0.05, 100.0),
        ])
    }

    /// Two pooling layers on 28x28 binary images: 28 -> 18x18x40 (pooled 9) -> 6x6x40 (pooled 3),
    /// the features are the concatenated outputs of both layers.
    pub fn mnist_pooling() -> Self {
        Self::new(vec![
            mnist_layer(LayerConfig::new(28, 1, 18, 40).with_pooling(2)).with_pbias(0.05, 50.0),
            mnist_layer(LayerConfig::new(9, 40, 6, 40).with_pooling(2)).with_pbias(0.05, 100.0),
        ])
        .with_output(OutputMode::Concatenate)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.layers.is_empty() {
            return Err(ConfigError::EmptyStackError);
        }
        for layer in &self.layers {
            layer.validate()?;
        }
        for (i, pair) in self.layers.windows(2).enumerate() {
            let (previous, next) = (&pair[0], &pair[1]);
            if next.channels != previous.filters || next.visible_size != previous.output_size() {
                return Err(ConfigError::StackShapeError {
                    layer: i + 1,
                    expected_channels: next.channels,
                    expected_size: next.visible_size,
                    channels: previous.filters,
                    size: previous.output_size(),
                });
            }
        }
        Ok(())
    }
}

fn mnist_layer(config: LayerConfig) -> LayerConfig {
    config
        .with_momentum(Momentum::default())
        .with_batch_size(50)
        .with_weight_decay(WeightDecay::l2(WeightDecay::DEFAULT_COST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_is_derived() {
        let config = LayerConfig::new(28, 1, 17, 40);
        assert_eq!(config.kernel_size, 12);
        assert_eq!(config.output_size(), 17);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kernel_shape_violation() {
        let mut config = LayerConfig::new(28, 1, 17, 40);
        config.kernel_size = 11;
        assert_eq!(
            config.validate(),
            Err(ConfigError::KernelShapeError {
                visible: 28,
                kernel: 11,
                hidden: 17,
                expected: 18
            })
        );

        let too_large = LayerConfig::new(8, 1, 9, 4);
        assert!(matches!(
            too_large.validate(),
            Err(ConfigError::EmptyDimensionError { .. })
        ));
    }

    #[test]
    fn test_pooling_shape() {
        let config = LayerConfig::new(28, 1, 18, 40).with_pooling(2);
        assert_eq!(config.output_size(), 9);
        assert!(config.validate().is_ok());

        let odd = LayerConfig::new(28, 1, 17, 40).with_pooling(2);
        assert_eq!(
            odd.validate(),
            Err(ConfigError::PoolingShapeError {
                hidden: 17,
                ratio: 2
            })
        );
    }

    #[test]
    fn test_hyperparameter_validation() {
        let config = LayerConfig::new(8, 1, 6, 2).with_learning_rate(-1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HyperParameterError {
                name: "learning_rate",
                ..
            })
        ));

        let config = LayerConfig::new(8, 1, 6, 2).with_pbias(1.5, 1.0);
        assert!(config.validate().is_err());

        let config = LayerConfig::new(8, 1, 6, 2).with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(StackConfig::mnist().validate().is_ok());
        assert!(StackConfig::mnist_pooling().validate().is_ok());
        assert_eq!(StackConfig::mnist().layers[1].kernel_size, 6);
        assert_eq!(StackConfig::mnist_pooling().layers[1].output_size(), 3);
    }

    #[test]
    fn test_stack_shape_mismatch() {
        let config = StackConfig::new(vec![
            LayerConfig::new(28, 1, 17, 40),
            LayerConfig::new(17, 20, 12, 40),
        ]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::StackShapeError {
                layer: 1,
                expected_channels: 20,
                expected_size: 17,
                channels: 40,
                size: 17
            })
        );
        assert_eq!(
            StackConfig::new(vec![]).validate(),
            Err(ConfigError::EmptyStackError)
        );
    }

    #[test]
    fn test_momentum_schedule() {
        let momentum = Momentum::default();
        assert_eq!(momentum.at_epoch(0), 0.5);
        assert_eq!(momentum.at_epoch(5), 0.5);
        assert_eq!(momentum.at_epoch(6), 0.9);
        assert_eq!(Momentum::constant(0.7).at_epoch(0), 0.7);
    }

    #[test]
    fn test_json_config() {
        let config = StackConfig::mnist_pooling().with_seed(3);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StackConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
