//! Helpers of the `cdbn` command line: datasets, stack configuration files and text rendering
//! of images.
pub mod dataset;

use std::{fs::File, io::BufReader, ops::Range, path::Path};

use ndarray::ArrayView2;
use rbm::{ConfigError, StackConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("Could not open the configuration file")]
    Io(#[from] std::io::Error),
    #[error("Could not parse the configuration file")]
    Json(#[from] serde_json::Error),
    #[error("Invalid stack configuration")]
    Invalid(#[from] ConfigError),
}

/// Reads and validates a JSON encoded [`StackConfig`].
pub fn read_stack_config(path: &Path) -> Result<StackConfig, ConfigFileError> {
    let config: StackConfig = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    config.validate()?;
    Ok(config)
}

/// Training images shown next to their reconstructions by `crbm --sample`.
pub const SAMPLE_IMAGES: Range<usize> = 666..676;

/// [`SAMPLE_IMAGES`] clipped to a batch of `len` images.
pub fn sample_range(len: usize) -> Range<usize> {
    let end = SAMPLE_IMAGES.end.min(len);
    SAMPLE_IMAGES.start.min(end)..end
}

/// One line per row, values rounded to the nearest integer.
pub fn render_map(map: ArrayView2<f64>) -> String {
    map.outer_iter()
        .map(|row| {
            row.iter()
                .map(|v| format!("{:.0}", v))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn test_read_stack_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.json");
        let config = StackConfig::mnist_pooling().with_seed(9);
        File::create(&path)
            .unwrap()
            .write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();
        assert_eq!(read_stack_config(&path).unwrap(), config);

        let empty = StackConfig::new(vec![]);
        std::fs::write(&path, serde_json::to_string(&empty).unwrap()).unwrap();
        assert!(matches!(
            read_stack_config(&path),
            Err(ConfigFileError::Invalid(ConfigError::EmptyStackError))
        ));

        std::fs::write(&path, "{ layers: ").unwrap();
        assert!(matches!(read_stack_config(&path), Err(ConfigFileError::Json(_))));
    }

    #[test]
    fn test_sample_range() {
        assert_eq!(sample_range(60000), 666..676);
        assert_eq!(sample_range(670), 666..670);
        assert_eq!(sample_range(100), 100..100);
    }

    #[test]
    fn test_render_map() {
        let map = array![[0.0, 1.0], [0.9, 0.2]];
        assert_eq!(render_map(map.view()), "0 1\n1 0");
    }
}
