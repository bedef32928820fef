//! On-disk model format: a topology document, a raw weights blob and a label
//! vocabulary. All three are required to load a model.

use crate::{
    classifier::{
        network::{Activation, Dense, Network},
        TrainedModel,
    },
    error::Error,
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub(crate) const TOPOLOGY_FILE: &str = "model.json";
pub(crate) const WEIGHTS_FILE: &str = "weights.bin";
pub(crate) const LABELS_FILE: &str = "labels.json";

const FORMAT: &str = "form-coach/dense-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LayerSpec {
    units: usize,
    activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WeightSpec {
    name: String,
    shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Topology {
    format: String,
    input_width: usize,
    layers: Vec<LayerSpec>,
    weights_manifest: Vec<WeightSpec>,
}

impl Topology {
    fn describe(network: &Network) -> Self {
        let layers = network.layers();
        Self {
            format: FORMAT.to_owned(),
            input_width: network.input_width(),
            layers: layers
                .iter()
                .map(|layer| LayerSpec {
                    units: layer.units(),
                    activation: layer.activation,
                })
                .collect(),
            weights_manifest: manifest(network.input_width(), layers.iter().map(Dense::units)),
        }
    }
}

fn manifest<I>(input_width: usize, units: I) -> Vec<WeightSpec>
where
    I: IntoIterator<Item = usize>,
{
    let mut specs = Vec::new();
    let mut inputs = input_width;
    for (i, units) in units.into_iter().enumerate() {
        specs.push(WeightSpec {
            name: format!("dense_{}/kernel", i),
            shape: vec![inputs, units],
        });
        specs.push(WeightSpec {
            name: format!("dense_{}/bias", i),
            shape: vec![units],
        });
        inputs = units;
    }
    specs
}

/// Where each artifact lives. A `None` entry is an artifact that was not
/// supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ModelPaths {
    pub(crate) topology: Option<PathBuf>,
    pub(crate) weights: Option<PathBuf>,
    pub(crate) labels: Option<PathBuf>,
}

impl ModelPaths {
    /// The standard file names inside `dir`, keeping only those that exist.
    pub(crate) fn in_dir<P>(dir: P) -> Self
    where
        P: AsRef<Path>,
    {
        let existing = |name: &str| {
            let path = dir.as_ref().join(name);
            if path.is_file() {
                Some(path)
            } else {
                None
            }
        };
        Self {
            topology: existing(TOPOLOGY_FILE),
            weights: existing(WEIGHTS_FILE),
            labels: existing(LABELS_FILE),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| Error::ReadFile(e, path.to_path_buf()))
}

fn write(path: PathBuf, contents: &[u8]) -> Result<PathBuf, Error> {
    fs::write(&path, contents).map_err(|e| Error::WriteFile(e, path.clone()))?;
    Ok(path)
}

/// Write all three artifacts into `dir`, creating it if needed.
pub(crate) fn save<P>(model: &TrainedModel, dir: P) -> Result<ModelPaths, Error>
where
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::WriteFile(e, dir.to_path_buf()))?;

    let network = model.network();
    let topology = serde_json::to_vec_pretty(&Topology::describe(network))
        .map_err(Error::SerializeTopology)?;
    let labels = serde_json::to_vec_pretty(model.labels()).map_err(Error::SerializeTopology)?;

    let mut weights = Vec::new();
    for layer in network.layers() {
        // logical (row-major) order regardless of memory layout
        for value in layer.kernel.iter().chain(layer.bias.iter()) {
            weights.extend_from_slice(&value.to_le_bytes());
        }
    }

    let paths = ModelPaths {
        topology: Some(write(dir.join(TOPOLOGY_FILE), &topology)?),
        weights: Some(write(dir.join(WEIGHTS_FILE), &weights)?),
        labels: Some(write(dir.join(LABELS_FILE), &labels)?),
    };
    info!(
        message = "saved model",
        dir = %dir.display(),
        labels = model.labels().len()
    );
    Ok(paths)
}

fn parse_labels(bytes: &[u8]) -> Result<Vec<String>, Error> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(Error::ParseLabels)?;
    value
        .as_array()
        .ok_or(Error::LabelsNotAList)?
        .iter()
        .map(|label| label.as_str().map(str::to_owned).ok_or(Error::LabelsNotAList))
        .collect()
}

fn take<'a>(values: &mut impl Iterator<Item = &'a [u8]>, n: usize) -> Vec<f32> {
    values
        .take(n)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Byte length of the weights blob a manifest describes.
fn weight_bytes(manifest: &[WeightSpec]) -> Result<usize, Error> {
    let overflow = || Error::InvalidTopology("weights manifest is too large".to_owned());
    let mut values = 0_usize;
    for spec in manifest {
        let count = spec
            .shape
            .iter()
            .try_fold(1_usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(overflow)?;
        values = values.checked_add(count).ok_or_else(overflow)?;
    }
    values.checked_mul(4).ok_or_else(overflow)
}

fn build(topology: &Topology, weights: &[u8]) -> Result<Network, Error> {
    if topology.format != FORMAT {
        return Err(Error::UnsupportedModelFormat(topology.format.clone()));
    }
    let expected_manifest = manifest(
        topology.input_width,
        topology.layers.iter().map(|layer| layer.units),
    );
    if topology.weights_manifest != expected_manifest {
        return Err(Error::InvalidTopology(
            "weights manifest does not match the layer list".to_owned(),
        ));
    }

    let expected = weight_bytes(&expected_manifest)?;
    if weights.len() != expected {
        return Err(Error::WeightsSizeMismatch {
            expected,
            got: weights.len(),
        });
    }

    // sizes below are bounded by the checked total
    let mut chunks = weights.chunks_exact(4);
    let mut layers = Vec::with_capacity(topology.layers.len());
    let mut inputs = topology.input_width;
    for spec in &topology.layers {
        let kernel = Array2::from_shape_vec((inputs, spec.units), take(&mut chunks, inputs * spec.units))
            .map_err(Error::ShapeFeatures)?;
        let bias = Array1::from(take(&mut chunks, spec.units));
        layers.push(Dense {
            kernel,
            bias,
            activation: spec.activation,
        });
        inputs = spec.units;
    }
    Network::from_layers(layers)
}

/// Load a model. Every artifact is read and checked before anything is
/// returned.
pub(crate) fn load(paths: &ModelPaths) -> Result<TrainedModel, Error> {
    let topology_path = paths
        .topology
        .as_deref()
        .ok_or(Error::MissingArtifact(TOPOLOGY_FILE))?;
    let weights_path = paths
        .weights
        .as_deref()
        .ok_or(Error::MissingArtifact(WEIGHTS_FILE))?;
    let labels_path = paths
        .labels
        .as_deref()
        .ok_or(Error::MissingArtifact(LABELS_FILE))?;

    let labels = parse_labels(&read(labels_path)?)?;
    let topology: Topology =
        serde_json::from_slice(&read(topology_path)?).map_err(Error::ParseTopology)?;
    let network = build(&topology, &read(weights_path)?)?;
    let model = TrainedModel::new(network, labels)?;

    info!(
        message = "loaded model",
        topology = %topology_path.display(),
        labels = ?model.labels()
    );
    Ok(model)
}
