//! Binary model files.
//!
//! Layout: the magic bytes `CDBN`, the format version, a header with the number of layers and
//! the output mode, then one record per layer holding its configuration and the raw filter,
//! hidden bias and visible bias buffers. Everything after the magic is bincode encoded, so
//! floats end up as little-endian IEEE-754 doubles.
//!
//! Reading never touches a layer before the whole file has been checked against the
//! configured layers.
use std::io::{Read, Write};

use ndarray::{Array, Array1};
use serde_derive::{Deserialize, Serialize};

use crate::{
    config::{LayerConfig, OutputMode},
    crbm::ConvRbm,
    errors::{ModelError, ModelResult},
    tensor::FilterBank,
    WeightPrecision,
};

pub const MODEL_MAGIC: [u8; 4] = *b"CDBN";
pub const MODEL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelHeader {
    pub layers: u64,
    pub output: OutputMode,
}

/// Parameters of one stored layer, buffers flattened in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub config: LayerConfig,
    pub filters: Vec<WeightPrecision>,
    pub hidden_bias: Vec<WeightPrecision>,
    pub visible_bias: Vec<WeightPrecision>,
}

impl From<&ConvRbm> for LayerRecord {
    fn from(layer: &ConvRbm) -> Self {
        LayerRecord {
            config: layer.config,
            filters: layer.filters.iter().copied().collect(),
            hidden_bias: layer.hidden_bias.to_vec(),
            visible_bias: layer.visible_bias.to_vec(),
        }
    }
}

/// Writes a model file holding `layers`.
pub fn write_layers<W: Write>(
    mut writer: W,
    layers: &[ConvRbm],
    output: OutputMode,
) -> ModelResult<()> {
    writer.write_all(&MODEL_MAGIC)?;
    bincode::serialize_into(&mut writer, &MODEL_VERSION)?;
    let header = ModelHeader {
        layers: layers.len() as u64,
        output,
    };
    bincode::serialize_into(&mut writer, &header)?;
    for layer in layers {
        bincode::serialize_into(&mut writer, &LayerRecord::from(layer))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads the header and all layer records of a model file.
pub fn read_records<R: Read>(mut reader: R) -> ModelResult<(ModelHeader, Vec<LayerRecord>)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MODEL_MAGIC {
        return Err(ModelError::ModelMagicError);
    }
    let version: u32 = bincode::deserialize_from(&mut reader)?;
    if version != MODEL_VERSION {
        return Err(ModelError::ModelVersionError {
            found: version,
            supported: MODEL_VERSION,
        });
    }
    let header: ModelHeader = bincode::deserialize_from(&mut reader)?;
    let records = (0..header.layers)
        .map(|_| bincode::deserialize_from(&mut reader))
        .collect::<Result<Vec<LayerRecord>, _>>()?;
    Ok((header, records))
}

struct Parameters {
    config: LayerConfig,
    filters: FilterBank,
    hidden_bias: Array1<WeightPrecision>,
    visible_bias: Array1<WeightPrecision>,
}

fn check_length(
    layer: usize,
    buffer: &'static str,
    expected: usize,
    found: usize,
) -> ModelResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(ModelError::BufferLengthError {
            layer,
            buffer,
            expected,
            found,
        })
    }
}

/// Checks one record against the configured layer and turns it into parameter arrays.
fn parameters(index: usize, layer: &ConvRbm, record: LayerRecord) -> ModelResult<Parameters> {
    record.config.validate()?;
    if !record.config.same_shape(&layer.config) {
        return Err(ModelError::LayerShapeError { layer: index });
    }
    check_length(index, "filters", layer.filters.len(), record.filters.len())?;
    check_length(index, "hidden_bias", layer.hidden_bias.len(), record.hidden_bias.len())?;
    check_length(index, "visible_bias", layer.visible_bias.len(), record.visible_bias.len())?;
    Ok(Parameters {
        config: record.config,
        filters: Array::from_shape_vec(layer.filters.raw_dim(), record.filters)?,
        hidden_bias: Array1::from(record.hidden_bias),
        visible_bias: Array1::from(record.visible_bias),
    })
}

/// Copies stored parameters into configured layers. Either every layer is restored or,
/// on error, none is touched.
pub fn restore_layers(layers: &mut [ConvRbm], records: Vec<LayerRecord>) -> ModelResult<()> {
    if records.len() != layers.len() {
        return Err(ModelError::LayerCountError {
            expected: layers.len(),
            found: records.len(),
        });
    }
    let checked = records
        .into_iter()
        .enumerate()
        .map(|(i, record)| parameters(i, &layers[i], record))
        .collect::<ModelResult<Vec<_>>>()?;

    for (layer, parameters) in layers.iter_mut().zip(checked) {
        layer.config = parameters.config;
        layer.filters = parameters.filters;
        layer.hidden_bias = parameters.hidden_bias;
        layer.visible_bias = parameters.visible_bias;
        layer.chain = None;
        layer.mean_activation = None;
    }
    Ok(())
}

impl ConvRbm {
    /// Writes this layer as a one-layer model file.
    pub fn store<W: Write>(&self, writer: W) -> ModelResult<()> {
        write_layers(writer, std::slice::from_ref(self), OutputMode::Last)
    }

    /// Restores this layer from a one-layer model file.
    pub fn load<R: Read>(&mut self, reader: R) -> ModelResult<()> {
        let (_, records) = read_records(reader)?;
        restore_layers(std::slice::from_mut(self), records)
    }
}
