//! Convolutional restricted Boltzmann machines (CRBM), trained with contrastive divergence
//! and stacked greedily into a convolutional deep belief network.
//!
//! All feature maps are kept in (channels, height, width) layout, batches add a leading
//! example axis. Filter banks have the layout (filters, channels, kernel height, kernel width).
pub mod activation_functions;
pub mod config;
pub mod convolutions;
pub mod crbm;
pub mod dbn;
pub mod errors;
pub mod model_io;
pub mod tensor;
pub mod trainer;

pub use config::{LayerConfig, StackConfig};
pub use crbm::ConvRbm;
pub use dbn::ConvDbn;
pub use errors::{ConfigError, ConfigResult, ModelError, ModelResult};
pub use trainer::CdTrainer;

pub type WeightPrecision = f64;
pub type ImagePrecision = f64;
