use crate::{
    classifier::{
        adam::{Adam, DEFAULT_LEARNING_RATE},
        network::{count_correct, cross_entropy, Network},
        TrainedModel,
    },
    dataset::Dataset,
    error::Error,
    pose::SkeletonSchema,
};
use ndarray::{Array2, Axis};
use num_traits::ToPrimitive;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, info};

pub(crate) const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainingConfig {
    pub(crate) hidden_units: Vec<usize>,
    pub(crate) epochs: usize,
    pub(crate) batch_size: usize,
    pub(crate) learning_rate: f32,
    /// Fraction of shuffled samples held out for validation, if any.
    pub(crate) validation_split: Option<f32>,
    pub(crate) seed: u64,
}

impl TrainingConfig {
    pub(crate) fn for_schema(schema: SkeletonSchema) -> Self {
        match schema {
            SkeletonSchema::MoveNet => Self {
                hidden_units: vec![64, 32],
                epochs: 50,
                batch_size: 16,
                learning_rate: DEFAULT_LEARNING_RATE,
                validation_split: Some(0.2),
                seed: DEFAULT_SEED,
            },
            SkeletonSchema::BlazePose => Self {
                hidden_units: vec![128, 64],
                epochs: 30,
                batch_size: 32,
                learning_rate: DEFAULT_LEARNING_RATE,
                validation_split: None,
                seed: DEFAULT_SEED,
            },
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::InvalidBatchSize);
        }
        if self.epochs == 0 {
            return Err(Error::InvalidEpochs);
        }
        match self.validation_split {
            Some(split) if !(0.0..1.0).contains(&split) => {
                Err(Error::InvalidValidationSplit(split))
            }
            _ => Ok(()),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::for_schema(SkeletonSchema::MoveNet)
    }
}

/// What one pass over the training split achieved.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct EpochMetrics {
    /// 1-based.
    pub(crate) epoch: usize,
    pub(crate) epochs: usize,
    pub(crate) loss: f32,
    pub(crate) accuracy: f32,
    pub(crate) val_loss: Option<f32>,
    pub(crate) val_accuracy: Option<f32>,
}

impl EpochMetrics {
    pub(crate) fn percent_complete(&self) -> f32 {
        match (self.epoch.to_f32(), self.epochs.to_f32()) {
            (Some(epoch), Some(epochs)) if epochs > 0.0 => 100.0 * epoch / epochs,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TrainingStatus {
    Idle,
    Training,
    Completed,
}

struct Split {
    features: Array2<f32>,
    targets: Array2<f32>,
}

impl Split {
    fn rows(&self) -> usize {
        self.features.nrows()
    }

    fn evaluate(&self, network: &Network) -> Result<(f32, f32), Error> {
        let probabilities = network.forward(self.features.view());
        let loss = cross_entropy(probabilities.view(), self.targets.view())?;
        let correct = count_correct(probabilities.view(), self.targets.view());
        Ok((loss, ratio(correct, self.rows())?))
    }
}

fn ratio(part: usize, whole: usize) -> Result<f32, Error> {
    Ok(part.to_f32().ok_or(Error::ConvertToF32)? / whole.to_f32().ok_or(Error::ConvertToF32)?)
}

/// One-hot targets and the feature matrix, rows in dataset order.
fn encode(dataset: &Dataset, vocabulary: &[String]) -> Result<Split, Error> {
    let width = dataset.feature_width().ok_or(Error::EmptyDataset)?;
    let index: HashMap<&str, usize> = vocabulary
        .iter()
        .enumerate()
        .map(|(i, label)| (label.as_str(), i))
        .collect();

    let rows = dataset.len();
    let features = Array2::from_shape_vec(
        (rows, width),
        dataset
            .samples()
            .iter()
            .flat_map(|s| s.keypoints.iter().copied())
            .collect(),
    )
    .map_err(Error::ShapeFeatures)?;

    let mut targets = Array2::zeros((rows, vocabulary.len()));
    for (row, sample) in dataset.samples().iter().enumerate() {
        if let Some(&class) = index.get(sample.label.as_str()) {
            targets[(row, class)] = 1.0;
        }
    }
    Ok(Split { features, targets })
}

/// Trains a dense classifier over a recorded dataset.
#[derive(Debug)]
pub(crate) struct TrainingEngine {
    config: TrainingConfig,
    status: TrainingStatus,
}

impl TrainingEngine {
    pub(crate) fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            status: TrainingStatus::Idle,
        }
    }

    pub(crate) fn status(&self) -> TrainingStatus {
        self.status
    }

    /// Train a fresh model, calling `on_epoch` after every epoch.
    ///
    /// The label vocabulary is the dataset's distinct labels in first-seen
    /// order and is frozen into the returned model.
    pub(crate) fn train<F>(&mut self, dataset: &Dataset, mut on_epoch: F) -> Result<TrainedModel, Error>
    where
        F: FnMut(&EpochMetrics),
    {
        self.config.validate()?;
        if dataset.is_empty() {
            return Err(Error::EmptyDataset);
        }
        let vocabulary = dataset.labels();
        if vocabulary.len() < 2 {
            return Err(Error::SingleClassDataset(vocabulary.concat()));
        }

        let all = encode(dataset, &vocabulary)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..all.rows()).collect();
        order.shuffle(&mut rng);

        let holdout = match self.config.validation_split {
            Some(split) => {
                let rows = all.rows().to_f32().ok_or(Error::ConvertToF32)?;
                let kept = (rows * (1.0 - split))
                    .floor()
                    .to_usize()
                    .ok_or(Error::ConvertToUSize)?;
                all.rows() - kept
            }
            None => 0,
        };
        let (validation_rows, training_rows) = order.split_at(holdout);
        if training_rows.is_empty() {
            return Err(Error::EmptyTrainingSplit);
        }
        let select = |rows: &[usize]| Split {
            features: all.features.select(Axis(0), rows),
            targets: all.targets.select(Axis(0), rows),
        };
        let training = select(training_rows);
        let validation = if validation_rows.is_empty() {
            None
        } else {
            Some(select(validation_rows))
        };

        self.status = TrainingStatus::Training;
        info!(
            message = "training started",
            samples = dataset.len(),
            classes = vocabulary.len(),
            training = training.rows(),
            validation = validation_rows.len(),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size
        );

        let result = self.fit(&training, validation.as_ref(), &mut rng, &mut on_epoch);
        let network = match result {
            Ok(network) => network,
            Err(e) => {
                self.status = TrainingStatus::Idle;
                return Err(e);
            }
        };

        let model = TrainedModel::new(network, vocabulary)?;
        self.status = TrainingStatus::Completed;
        info!(message = "training completed", labels = ?model.labels());
        Ok(model)
    }

    fn fit<F>(
        &self,
        training: &Split,
        validation: Option<&Split>,
        rng: &mut StdRng,
        on_epoch: &mut F,
    ) -> Result<Network, Error>
    where
        F: FnMut(&EpochMetrics),
    {
        let config = &self.config;
        let mut network = Network::new(
            training.features.ncols(),
            &config.hidden_units,
            training.targets.ncols(),
            rng,
        )?;
        let mut optimizer = Adam::new(config.learning_rate, &network);
        let mut order: Vec<usize> = (0..training.rows()).collect();

        for epoch in 1..=config.epochs {
            order.shuffle(rng);
            let mut loss_sum = 0.0;
            let mut correct = 0;

            for batch in order.chunks(config.batch_size) {
                let x = training.features.select(Axis(0), batch);
                let y = training.targets.select(Axis(0), batch);
                let activations = network.forward_trace(x.view());
                let probabilities = &activations[activations.len() - 1];

                let rows = batch.len().to_f32().ok_or(Error::ConvertToF32)?;
                loss_sum += cross_entropy(probabilities.view(), y.view())? * rows;
                correct += count_correct(probabilities.view(), y.view());

                let gradients = network.backward(&activations, y.view())?;
                optimizer.step(&mut network, &gradients);
            }

            let (val_loss, val_accuracy) = match validation {
                Some(split) => {
                    let (loss, accuracy) = split.evaluate(&network)?;
                    (Some(loss), Some(accuracy))
                }
                None => (None, None),
            };
            let metrics = EpochMetrics {
                epoch,
                epochs: config.epochs,
                loss: loss_sum / training.rows().to_f32().ok_or(Error::ConvertToF32)?,
                accuracy: ratio(correct, training.rows())?,
                val_loss,
                val_accuracy,
            };
            debug!(
                message = "epoch finished",
                epoch,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                val_loss = ?metrics.val_loss,
                val_accuracy = ?metrics.val_accuracy
            );
            on_epoch(&metrics);
        }

        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::LabeledSample;
    use rand::Rng;

    /// Two well separated clusters in 17×3 feature space.
    fn good_and_bad(per_class: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = Vec::new();
        for i in 0..per_class * 2 {
            let (label, center) = if i % 2 == 0 { ("good", 0.25) } else { ("bad", 0.75) };
            samples.push(LabeledSample {
                label: label.to_owned(),
                keypoints: (0..51)
                    .map(|_| center + rng.gen_range(-0.1..0.1))
                    .collect(),
            });
        }
        Dataset::from_samples(samples).unwrap()
    }

    fn sample(label: &str, width: usize) -> LabeledSample {
        LabeledSample {
            label: label.to_owned(),
            keypoints: vec![0.5; width],
        }
    }

    mod precondition_tests {
        use super::*;

        #[test]
        fn empty_dataset_is_rejected() {
            let mut engine = TrainingEngine::new(TrainingConfig::default());
            assert!(matches!(
                engine.train(&Dataset::default(), |_| {}),
                Err(Error::EmptyDataset)
            ));
            assert_eq!(engine.status(), TrainingStatus::Idle);
        }

        #[test]
        fn single_class_is_rejected() {
            let dataset =
                Dataset::from_samples(vec![sample("good", 51), sample("good", 51)]).unwrap();
            let mut engine = TrainingEngine::new(TrainingConfig::default());
            let mut calls = 0;
            let result = engine.train(&dataset, |_| calls += 1);
            assert!(matches!(result, Err(Error::SingleClassDataset(ref label)) if label == "good"));
            assert_eq!(calls, 0);
        }

        #[test]
        fn zero_batch_size_is_rejected() {
            let dataset =
                Dataset::from_samples(vec![sample("good", 3), sample("bad", 3)]).unwrap();
            let mut engine = TrainingEngine::new(TrainingConfig {
                batch_size: 0,
                ..TrainingConfig::default()
            });
            assert!(matches!(
                engine.train(&dataset, |_| {}),
                Err(Error::InvalidBatchSize)
            ));
        }

        #[test]
        fn split_must_leave_training_rows() {
            let dataset = Dataset::from_samples(vec![sample("good", 3), sample("bad", 3)]).unwrap();
            let mut engine = TrainingEngine::new(TrainingConfig {
                validation_split: Some(0.99),
                ..TrainingConfig::default()
            });
            assert!(matches!(
                engine.train(&dataset, |_| {}),
                Err(Error::EmptyTrainingSplit)
            ));

            let mut engine = TrainingEngine::new(TrainingConfig {
                validation_split: Some(1.5),
                ..TrainingConfig::default()
            });
            assert!(matches!(
                engine.train(&dataset, |_| {}),
                Err(Error::InvalidValidationSplit(_))
            ));
        }
    }

    mod training_tests {
        use super::*;

        #[test]
        fn reports_every_epoch_and_loss_falls() {
            let dataset = good_and_bad(30, 9);
            let config = TrainingConfig::for_schema(SkeletonSchema::MoveNet);
            let epochs = config.epochs;
            let mut engine = TrainingEngine::new(config);

            let mut history = Vec::new();
            let model = engine.train(&dataset, |m| history.push(*m)).unwrap();

            assert_eq!(engine.status(), TrainingStatus::Completed);
            assert_eq!(history.len(), epochs);
            assert_eq!(model.labels(), ["good".to_owned(), "bad".to_owned()]);
            assert!(history.iter().all(|m| m.val_loss.is_some()));
            assert_eq!(history[epochs - 1].percent_complete(), 100.0);

            let mean = |window: &[EpochMetrics]| {
                window.iter().map(|m| m.loss).sum::<f32>() / window.len() as f32
            };
            assert!(mean(&history[..5]) > mean(&history[epochs - 5..]));
        }

        #[test]
        fn held_out_samples_favor_their_class() {
            let mut margin = 0.0;
            let runs = 3;
            for seed in 0..runs {
                let dataset = good_and_bad(20, 100 + seed);
                let mut engine = TrainingEngine::new(TrainingConfig {
                    seed,
                    ..TrainingConfig::default()
                });
                let model = engine.train(&dataset, |_| {}).unwrap();

                let held_out = good_and_bad(1, 999 + seed);
                let good = &held_out.samples()[0];
                assert_eq!(good.label, "good");
                let prediction = model.predict(&good.keypoints).unwrap();
                margin += prediction.probabilities[0] - prediction.probabilities[1];
            }
            assert!(margin / runs as f32 > 0.0);
        }

        #[test]
        fn same_seed_gives_same_model() {
            let dataset = good_and_bad(10, 4);
            let config = TrainingConfig {
                epochs: 3,
                ..TrainingConfig::default()
            };
            let a = TrainingEngine::new(config.clone())
                .train(&dataset, |_| {})
                .unwrap();
            let b = TrainingEngine::new(config).train(&dataset, |_| {}).unwrap();
            assert_eq!(a, b);
        }

        #[test]
        fn no_validation_metrics_without_split() {
            let dataset = good_and_bad(5, 1);
            let mut engine = TrainingEngine::new(TrainingConfig {
                epochs: 2,
                validation_split: None,
                ..TrainingConfig::default()
            });
            let mut history = Vec::new();
            engine.train(&dataset, |m| history.push(*m)).unwrap();
            assert!(history.iter().all(|m| m.val_loss.is_none() && m.val_accuracy.is_none()));
        }
    }
}
