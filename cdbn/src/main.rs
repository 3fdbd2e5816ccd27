//! Command line interface: greedy pretraining of a convolutional DBN on MNIST, an optional SVM
//! on its features, and training or sampling of a single convolutional RBM.

use cdbn::{
    dataset::{binarize_dataset, read_dataset, shuffle_dataset, Dataset, DatasetResult},
    read_stack_config, render_map, sample_range, ConfigFileError,
};
use classifier::{test_all, ArgmaxPredictor, RbfGrid, Svm, SvmParameters, SvmStack};
use env_logger::Builder;
use log::{info, warn};
use ndarray::{s, ArrayView4, Axis};
use quicli::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rbm::{CdTrainer, ConvDbn, ConvRbm, LayerConfig, ModelResult, StackConfig};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};
use structopt::StructOpt;

/// Pretrains a convolutional DBN and reports its error rates
#[derive(Debug, StructOpt)]
struct DbnOpts {
    /// Directory with the MNIST IDX files, or an .npz archive
    #[structopt(short = "d", long = "data", parse(from_os_str), default_value = "mnist")]
    data: PathBuf,
    /// Model file, written after pretraining and read with --load
    #[structopt(short = "m", long = "model", parse(from_os_str), default_value = "dbn.dat")]
    model: PathBuf,
    /// JSON stack configuration, replaces the built-in stacks
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    /// Loads the model instead of pretraining. Falls back to pretraining if that fails.
    #[structopt(long)]
    load: bool,
    /// Trains an SVM on the features of the last layer
    #[structopt(long)]
    svm: bool,
    /// Grid search of the SVM parameters, only with --svm
    #[structopt(long)]
    grid: bool,
    /// Uses the stack with probabilistic max pooling
    #[structopt(long)]
    mp: bool,
    /// Shuffles the training set before pretraining
    #[structopt(long)]
    shuffle: bool,
    /// Pretraining epochs per layer, 50 with --svm and 5 otherwise
    #[structopt(short = "e", long = "epochs")]
    epochs: Option<usize>,
    /// Only uses the first <limit> training images
    #[structopt(short = "l", long = "limit")]
    limit: Option<usize>,
    #[structopt(short = "s", long = "seed")]
    seed: Option<u64>,
    /// Size of the thread pool, all cores by default
    #[structopt(short = "t", long = "threads")]
    threads: Option<usize>,
    /// Cross-validation folds of the grid search
    #[structopt(long = "folds", default_value = "4")]
    folds: usize,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Trains a single convolutional RBM
#[derive(Debug, StructOpt)]
struct CrbmOpts {
    /// Directory with the MNIST IDX files, or an .npz archive
    #[structopt(short = "d", long = "data", parse(from_os_str), default_value = "mnist")]
    data: PathBuf,
    #[structopt(short = "m", long = "model", parse(from_os_str), default_value = "crbm-1.dat")]
    model: PathBuf,
    /// Loads the layer instead of training it
    #[structopt(long)]
    load: bool,
    /// Prints some training images next to their reconstructions
    #[structopt(long)]
    sample: bool,
    #[structopt(short = "e", long = "epochs", default_value = "2")]
    epochs: usize,
    /// Only uses the first <limit> training images
    #[structopt(short = "l", long = "limit")]
    limit: Option<usize>,
    #[structopt(short = "s", long = "seed")]
    seed: Option<u64>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Unsupervised feature learning with convolutional deep belief networks.
#[derive(Debug, StructOpt)]
#[structopt(name = "cdbn")]
enum Cdbn {
    #[structopt(
        name = "dbn",
        about = "Pretrains a convolutional DBN, optionally with an SVM, and prints its error rates."
    )]
    Dbn(DbnOpts),
    #[structopt(
        name = "crbm",
        about = "Trains a single convolutional RBM and optionally shows reconstructions."
    )]
    Crbm(CrbmOpts),
}

/// Trait for the subcommands of cdbn
trait CdbnOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

/// Reads and binarizes the dataset, an empty training set is an error.
fn prepare_dataset(path: &Path, limit: Option<usize>) -> DatasetResult<Dataset> {
    let mut dataset = read_dataset(path, limit)?;
    binarize_dataset(&mut dataset);
    Ok(dataset)
}

fn open_model<F>(path: &Path, load: F) -> ModelResult<()>
where
    F: FnOnce(BufReader<File>) -> ModelResult<()>,
{
    load(BufReader::new(File::open(path)?))
}

/// `<model>.svm` next to the model file.
fn svm_path(model: &Path) -> PathBuf {
    let mut name = model.as_os_str().to_owned();
    name.push(".svm");
    PathBuf::from(name)
}

impl DbnOpts {
    fn stack_config(&self) -> Result<StackConfig, ConfigFileError> {
        let mut config = match &self.config {
            Some(path) => read_stack_config(path)?,
            None if self.mp => StackConfig::mnist_pooling(),
            None => StackConfig::mnist(),
        };
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }

    fn load_or_pretrain(&self, dbn: &mut ConvDbn, images: ArrayView4<f64>) -> CliResult {
        if self.load {
            match open_model(&self.model, |reader| dbn.load(reader)) {
                Ok(()) => {
                    println!("Loaded {}", self.model.display());
                    return Ok(());
                }
                Err(e) => warn!(
                    "Could not load {}, pretraining instead: {}",
                    self.model.display(),
                    e
                ),
            }
        }

        let epochs = self.epochs.unwrap_or(if self.svm { 50 } else { 5 });
        println!("Start pretraining");
        for report in dbn.pretrain(images, epochs) {
            if let Some(last) = report.epochs.last() {
                info!(
                    "Layer {} done, reconstruction error {:.5}",
                    report.layer, last.reconstruction_error
                );
            }
        }
        dbn.store(BufWriter::new(File::create(&self.model)?))?;
        Ok(())
    }
}

impl CdbnOpts for DbnOpts {
    fn run(&self) -> CliResult {
        if let Some(threads) = self.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()?;
        }

        let mut dataset = prepare_dataset(&self.data, self.limit)?;
        let config = self.stack_config()?;
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed.unwrap_or_else(rand::random));
            shuffle_dataset(&mut dataset, &mut rng);
        }

        let mut dbn = ConvDbn::new(config)?;
        dataset.check_input_shape(dbn.input_shape())?;
        println!("{}", dbn);

        let training = dataset.training_batch()?;
        let test = dataset.test_batch()?;
        self.load_or_pretrain(&mut dbn, training.view())?;

        let training_set = (training.view(), &dataset.training_labels[..]);
        let test_set = (test.view(), &dataset.test_labels[..]);
        if !self.svm {
            println!("{}", test_all(&dbn, &ArgmaxPredictor, training_set, test_set));
            return Ok(());
        }

        let mut svm = Svm::new();
        let trained = if self.grid {
            dbn.svm_grid_search(
                &mut svm,
                training.view(),
                &dataset.training_labels,
                self.folds,
                &RbfGrid::default(),
            )
            .map(|result| {
                println!(
                    "Best parameters: C={} gamma={} (cross-validation error rate {:.5})",
                    result.best.c, result.best.gamma, result.best.error_rate
                )
            })
        } else {
            dbn.svm_train(
                &mut svm,
                training.view(),
                &dataset.training_labels,
                &SvmParameters::default(),
            )
        };
        if let Err(e) = trained {
            warn!("{}", e);
            println!("SVM training failed");
            return Ok(());
        }

        svm.store(BufWriter::new(File::create(svm_path(&self.model))?))?;
        if let Some(model) = svm.model() {
            println!("{}", test_all(&dbn, model, training_set, test_set));
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl CdbnOpts for CrbmOpts {
    fn run(&self) -> CliResult {
        let dataset = prepare_dataset(&self.data, self.limit)?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.unwrap_or_else(rand::random));
        let config = LayerConfig::new(28, 1, 17, 40).with_learning_rate(1e-4);
        let mut layer = ConvRbm::new(config, &mut rng)?;
        dataset.check_input_shape(layer.input_shape())?;
        println!("{}", layer);

        let loaded = self.load
            && match open_model(&self.model, |reader| layer.load(reader)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not load {}, training instead: {}", self.model.display(), e);
                    false
                }
            };
        let training = dataset.training_batch()?;
        if !loaded {
            CdTrainer::train(&mut layer, training.view(), self.epochs, rng.gen());
            layer.store(BufWriter::new(File::create(&self.model)?))?;
        }

        if self.sample {
            let range = sample_range(training.len_of(Axis(0)));
            let samples = training.slice(s![range, .., .., ..]);
            println!(
                "Reconstruction error: {:.5}",
                layer.reconstruction_error(samples, &mut rng)
            );
            for image in samples.outer_iter() {
                println!("Source image");
                println!("{}", render_map(image.index_axis(Axis(0), 0)));
                let reconstructed = layer.reconstruct(image, &mut rng);
                println!("Reconstructed image");
                println!("{}", render_map(reconstructed.index_axis(Axis(0), 0)));
            }
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl CdbnOpts for Cdbn {
    fn run(&self) -> CliResult {
        match self {
            Cdbn::Dbn(c) => c.run(),
            Cdbn::Crbm(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Cdbn::Dbn(c) => c.get_verbosity(),
            Cdbn::Crbm(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Cdbn::from_args();
    args.setup_env_logger()?;
    args.run()
}
