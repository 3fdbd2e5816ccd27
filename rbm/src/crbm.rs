//! Convolutional restricted Boltzmann machine, after Lee et al., 2009
//! (<https://doi.org/10.1145/1553374.1553453>).
//!
//! A layer maps `channels x visible_size x visible_size` visible maps to
//! `filters x hidden_size x hidden_size` hidden maps through a valid cross-correlation with its
//! filter bank. Plain layers hand their hidden probabilities to the next layer, pooling layers
//! hand over the probabilities of their pooled units.
use std::fmt::{self, Display};

use ndarray::*;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    activation_functions::{
        bernoulli_sample, gaussian_sample, max_pool_probabilities, max_pool_sample, sigmoid,
    },
    config::{LayerConfig, Pooling, VisibleUnit},
    convolutions::{convolve_full, correlate_valid, filter_matrix, im2col},
    errors::{ConfigResult, ModelError, ModelResult},
    tensor::{map_batch, map_batch_sampled, FeatureBatch, FeatureMap, FilterBank},
    WeightPrecision,
};

/// Scale of the initial filter weights.
const INITIAL_WEIGHT_SCALE: f64 = 0.01;
/// Initial hidden biases, slightly negative so that fresh layers start out sparse.
const INITIAL_HIDDEN_BIAS: f64 = -0.1;

pub struct ConvRbm {
    pub(crate) config: LayerConfig,
    pub(crate) filters: FilterBank,
    pub(crate) hidden_bias: Array1<WeightPrecision>,
    pub(crate) visible_bias: Array1<WeightPrecision>,
    /// Negative chain state of persistent CD, one hidden sample per batch slot.
    pub(crate) chain: Option<FeatureBatch>,
    /// Running average of the hidden activation probability per filter.
    pub(crate) mean_activation: Option<Array1<f64>>,
}

impl ConvRbm {
    /// Builds a layer with small random filters. Fails if the configuration is inconsistent.
    pub fn new<R: Rng + ?Sized>(config: LayerConfig, rng: &mut R) -> ConfigResult<ConvRbm> {
        config.validate()?;
        let k = config.kernel_size;
        let filters = Array4::from_shape_fn((config.filters, config.channels, k, k), |_| {
            INITIAL_WEIGHT_SCALE * rng.sample::<f64, _>(StandardNormal)
        });
        Ok(ConvRbm {
            config,
            filters,
            hidden_bias: Array1::from_elem(config.filters, INITIAL_HIDDEN_BIAS),
            visible_bias: Array1::zeros(config.channels),
            chain: None,
            mean_activation: None,
        })
    }

    /// Builds a layer from existing parameters, checking them against the configuration.
    pub fn from_parameters(
        config: LayerConfig,
        filters: FilterBank,
        hidden_bias: Array1<WeightPrecision>,
        visible_bias: Array1<WeightPrecision>,
    ) -> ModelResult<ConvRbm> {
        config.validate()?;
        let k = config.kernel_size;
        if filters.dim() != (config.filters, config.channels, k, k)
            || hidden_bias.len() != config.filters
            || visible_bias.len() != config.channels
        {
            return Err(ModelError::LayerShapeError { layer: 0 });
        }
        Ok(ConvRbm {
            config,
            filters,
            hidden_bias,
            visible_bias,
            chain: None,
            mean_activation: None,
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn filters(&self) -> &FilterBank {
        &self.filters
    }

    pub fn hidden_bias(&self) -> &Array1<WeightPrecision> {
        &self.hidden_bias
    }

    pub fn visible_bias(&self) -> &Array1<WeightPrecision> {
        &self.visible_bias
    }

    /// Running average of the hidden activation probability of every filter,
    /// `None` before the first training step.
    pub fn mean_activation(&self) -> Option<&Array1<f64>> {
        self.mean_activation.as_ref()
    }

    /// Drops the persistent CD chain, the next batch restarts it from the data.
    pub fn reset_chain(&mut self) {
        self.chain = None;
    }

    /// Shape of a visible map, (channels, size, size).
    pub fn input_shape(&self) -> (usize, usize, usize) {
        let c = &self.config;
        (c.channels, c.visible_size, c.visible_size)
    }

    /// Shape of the hidden maps, (filters, size, size).
    pub fn hidden_shape(&self) -> (usize, usize, usize) {
        let c = &self.config;
        (c.filters, c.hidden_size, c.hidden_size)
    }

    /// Shape of the maps handed to the next layer.
    pub fn output_shape(&self) -> (usize, usize, usize) {
        let c = &self.config;
        (c.filters, c.output_size(), c.output_size())
    }

    /// Number of visible units.
    pub fn input_size(&self) -> usize {
        self.config.input_len()
    }

    /// Number of output units.
    pub fn output_size(&self) -> usize {
        self.config.output_len()
    }

    pub(crate) fn filter_matrix(&self) -> Array2<WeightPrecision> {
        filter_matrix(&self.filters)
    }

    /// Hidden energies (pre-activations) from an unrolled visible map.
    pub(crate) fn hidden_energies(
        &self,
        cols: &Array2<f64>,
        filters: &Array2<WeightPrecision>,
    ) -> FeatureMap {
        let mut energies = correlate_valid(cols, filters, self.config.hidden_size);
        for (mut map, bias) in energies.outer_iter_mut().zip(self.hidden_bias.iter()) {
            map += *bias;
        }
        energies
    }

    /// Hidden unit probabilities from hidden energies.
    pub(crate) fn hidden_from_energies(&self, energies: FeatureMap) -> FeatureMap {
        match self.config.pooling {
            Pooling::None => energies.mapv_into(sigmoid),
            Pooling::ProbabilisticMax { ratio } => max_pool_probabilities(&energies, ratio).0,
        }
    }

    /// Hidden unit probabilities from an unrolled visible map.
    pub(crate) fn hidden_from_cols(
        &self,
        cols: &Array2<f64>,
        filters: &Array2<WeightPrecision>,
    ) -> FeatureMap {
        self.hidden_from_energies(self.hidden_energies(cols, filters))
    }

    /// Visible probabilities (binary units) or means (gaussian units) given hidden states.
    pub(crate) fn visible_from_hidden(
        &self,
        hidden: ArrayView3<f64>,
        filters: &Array2<WeightPrecision>,
    ) -> FeatureMap {
        let mut visible = convolve_full(
            hidden,
            filters,
            self.config.channels,
            self.config.kernel_size,
        );
        for (mut map, bias) in visible.outer_iter_mut().zip(self.visible_bias.iter()) {
            map += *bias;
        }
        match self.config.visible_unit {
            VisibleUnit::Binary => visible.mapv_into(sigmoid),
            VisibleUnit::Gaussian => visible,
        }
    }

    /// Hidden unit probabilities `P(h = 1 | v)` of one visible map.
    pub fn hidden_probabilities(&self, visible: ArrayView3<f64>) -> FeatureMap {
        debug_assert_eq!(visible.dim(), self.input_shape());
        let cols = im2col(visible, self.config.kernel_size);
        self.hidden_from_cols(&cols, &self.filter_matrix())
    }

    /// Unit probabilities and per-block "off" probabilities of one visible map.
    /// Only meaningful for pooling layers; plain layers return the sigmoid probabilities and
    /// `1 - p` as the off probability of every unit.
    pub fn pooling_probabilities(&self, visible: ArrayView3<f64>) -> (FeatureMap, FeatureMap) {
        debug_assert_eq!(visible.dim(), self.input_shape());
        let cols = im2col(visible, self.config.kernel_size);
        let energies = self.hidden_energies(&cols, &self.filter_matrix());
        match self.config.pooling {
            Pooling::None => {
                let units = energies.mapv_into(sigmoid);
                let off = units.mapv(|p| 1.0 - p);
                (units, off)
            }
            Pooling::ProbabilisticMax { ratio } => max_pool_probabilities(&energies, ratio),
        }
    }

    /// Binary hidden states drawn from hidden probabilities. Pooling layers switch on at most
    /// one unit per block.
    pub fn sample_hidden_map<R: Rng + ?Sized>(
        &self,
        probabilities: ArrayView3<f64>,
        rng: &mut R,
    ) -> FeatureMap {
        match self.config.pooling {
            Pooling::None => bernoulli_sample(probabilities, rng),
            Pooling::ProbabilisticMax { ratio } => max_pool_sample(probabilities, ratio, rng),
        }
    }

    /// Visible probabilities (or gaussian means) of one set of hidden states.
    pub fn visible_probabilities(&self, hidden: ArrayView3<f64>) -> FeatureMap {
        debug_assert_eq!(hidden.dim(), self.hidden_shape());
        self.visible_from_hidden(hidden, &self.filter_matrix())
    }

    /// Visible states drawn from visible probabilities (or means).
    pub fn sample_visible_map<R: Rng + ?Sized>(
        &self,
        probabilities: ArrayView3<f64>,
        rng: &mut R,
    ) -> FeatureMap {
        match self.config.visible_unit {
            VisibleUnit::Binary => bernoulli_sample(probabilities, rng),
            VisibleUnit::Gaussian => gaussian_sample(probabilities, rng),
        }
    }

    /// Deterministic output of one visible map: the hidden probabilities of plain layers,
    /// `1 - P(off)` of every pooled unit for pooling layers.
    pub fn output_map(&self, visible: ArrayView3<f64>) -> FeatureMap {
        match self.config.pooling {
            Pooling::None => self.hidden_probabilities(visible),
            Pooling::ProbabilisticMax { .. } => {
                self.pooling_probabilities(visible).1.mapv_into(|p| 1.0 - p)
            }
        }
    }

    /// Hidden probabilities of every example of a batch.
    pub fn activate_hidden(&self, visible: ArrayView4<f64>) -> FeatureBatch {
        let filters = self.filter_matrix();
        let k = self.config.kernel_size;
        map_batch(visible, self.hidden_shape(), |v| {
            debug_assert_eq!(v.dim(), self.input_shape());
            self.hidden_from_cols(&im2col(v, k), &filters)
        })
    }

    /// Binary hidden states for every example of a batch of hidden probabilities.
    pub fn sample_hidden<R: Rng + ?Sized>(
        &self,
        probabilities: ArrayView4<f64>,
        rng: &mut R,
    ) -> FeatureBatch {
        map_batch_sampled(probabilities, self.hidden_shape(), rng.gen(), |p, rng| {
            self.sample_hidden_map(p, rng)
        })
    }

    /// Visible probabilities (or gaussian means) for every example of a batch of hidden states.
    pub fn activate_visible(&self, hidden: ArrayView4<f64>) -> FeatureBatch {
        let filters = self.filter_matrix();
        map_batch(hidden, self.input_shape(), |h| {
            debug_assert_eq!(h.dim(), self.hidden_shape());
            self.visible_from_hidden(h, &filters)
        })
    }

    /// Visible states for every example of a batch of visible probabilities.
    pub fn sample_visible<R: Rng + ?Sized>(
        &self,
        probabilities: ArrayView4<f64>,
        rng: &mut R,
    ) -> FeatureBatch {
        map_batch_sampled(probabilities, self.input_shape(), rng.gen(), |p, rng| {
            self.sample_visible_map(p, rng)
        })
    }

    /// Deterministic outputs of every example of a batch, the input of the next layer.
    pub fn activate_output(&self, visible: ArrayView4<f64>) -> FeatureBatch {
        map_batch(visible, self.output_shape(), |v| self.output_map(v))
    }

    /// One up-down pass: hidden probabilities, a hidden sample, and the visible probabilities
    /// reconstructed from that sample.
    pub fn reconstruct<R: Rng + ?Sized>(
        &self,
        visible: ArrayView3<f64>,
        rng: &mut R,
    ) -> FeatureMap {
        let hidden = self.hidden_probabilities(visible);
        let sample = self.sample_hidden_map(hidden.view(), rng);
        self.visible_probabilities(sample.view())
    }

    /// Mean squared difference between a batch and its reconstructions.
    pub fn reconstruction_error<R: Rng + ?Sized>(
        &self,
        visible: ArrayView4<f64>,
        rng: &mut R,
    ) -> f64 {
        if visible.is_empty() {
            return 0.0;
        }
        let reconstructed = map_batch_sampled(visible, self.input_shape(), rng.gen(), |v, rng| {
            self.reconstruct(v, rng)
        });
        (&reconstructed - &visible).mapv(|d| d * d).mean().unwrap_or(0.0)
    }
}

impl Display for ConvRbm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        let kind = match c.pooling {
            Pooling::None => "CRBM",
            Pooling::ProbabilisticMax { .. } => "CRBM(MP)",
        };
        write!(
            f,
            "{}: {}x{}x{} -> ({}x{}) -> {}x{}x{}",
            kind,
            c.visible_size,
            c.visible_size,
            c.channels,
            c.kernel_size,
            c.kernel_size,
            c.hidden_size,
            c.hidden_size,
            c.filters
        )?;
        if let Some(ratio) = c.pooling_ratio() {
            write!(
                f,
                " -> {}x{}x{} (pooling {})",
                c.output_size(),
                c.output_size(),
                c.filters,
                ratio
            )?;
        }
        Ok(())
    }
}
