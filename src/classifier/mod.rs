mod adam;
pub(crate) mod artifacts;
mod network;
mod train;

pub(crate) use train::{EpochMetrics, TrainingConfig, TrainingEngine, TrainingStatus};

use crate::error::Error;
use network::Network;
use ndarray::{ArrayView2, Axis};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prediction {
    pub(crate) index: usize,
    pub(crate) confidence: f32,
    pub(crate) probabilities: Vec<f32>,
}

/// A trained network frozen together with its label vocabulary.
///
/// Output index `i` of the network means `labels[i]`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainedModel {
    network: Network,
    labels: Vec<String>,
}

impl TrainedModel {
    pub(crate) fn new(network: Network, labels: Vec<String>) -> Result<Self, Error> {
        if labels.len() != network.output_width() {
            return Err(Error::VocabularyMismatch {
                labels: labels.len(),
                outputs: network.output_width(),
            });
        }
        Ok(Self { network, labels })
    }

    pub(crate) fn network(&self) -> &Network {
        &self.network
    }

    pub(crate) fn labels(&self) -> &[String] {
        &self.labels
    }

    pub(crate) fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub(crate) fn input_width(&self) -> usize {
        self.network.input_width()
    }

    pub(crate) fn predict(&self, features: &[f32]) -> Result<Prediction, Error> {
        let expected = self.input_width();
        if features.len() != expected {
            return Err(Error::FeatureWidthMismatch {
                expected,
                got: features.len(),
            });
        }
        let x = ArrayView2::from_shape((1, expected), features).map_err(Error::ShapeFeatures)?;
        let probabilities = self.network.forward(x);
        let row = probabilities.index_axis(Axis(0), 0);
        let (index, confidence) = network::argmax(row).ok_or(Error::VocabularyMismatch {
            labels: self.labels.len(),
            outputs: 0,
        })?;
        Ok(Prediction {
            index,
            confidence,
            probabilities: row.to_vec(),
        })
    }
}

/// Hand-off point between training and inference.
///
/// The model and its vocabulary are published as one value, so a reader
/// sees either nothing or a complete model.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModelSlot(Arc<RwLock<Option<Arc<TrainedModel>>>>);

impl ModelSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, model: TrainedModel) {
        let mut slot = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(model));
    }

    pub(crate) fn current(&self) -> Option<Arc<TrainedModel>> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.current().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn model(labels: &[&str]) -> TrainedModel {
        let mut rng = StdRng::seed_from_u64(0);
        let network = Network::new(6, &[4], labels.len(), &mut rng).unwrap();
        TrainedModel::new(network, labels.iter().map(|l| l.to_string()).collect()).unwrap()
    }

    #[test]
    fn vocabulary_must_match_outputs() {
        let mut rng = StdRng::seed_from_u64(0);
        let network = Network::new(6, &[4], 3, &mut rng).unwrap();
        assert!(matches!(
            TrainedModel::new(network, vec!["a".to_owned(), "b".to_owned()]),
            Err(Error::VocabularyMismatch {
                labels: 2,
                outputs: 3
            })
        ));
    }

    #[test]
    fn predict_checks_width() {
        let model = model(&["good", "bad"]);
        assert!(matches!(
            model.predict(&[0.0; 5]),
            Err(Error::FeatureWidthMismatch {
                expected: 6,
                got: 5
            })
        ));
        let prediction = model.predict(&[0.1; 6]).unwrap();
        assert_eq!(prediction.probabilities.len(), 2);
        assert!(model.label(prediction.index).is_some());
        assert_eq!(prediction.confidence, prediction.probabilities[prediction.index]);
    }

    #[test]
    fn slot_publishes_whole_models() {
        let slot = ModelSlot::new();
        let reader = slot.clone();
        assert!(!reader.is_ready());
        slot.publish(model(&["good", "bad"]));
        let current = reader.current().unwrap();
        assert_eq!(current.labels().len(), current.network().output_width());
    }
}
