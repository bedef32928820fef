use crate::error::Error;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct LabeledSample {
    pub(crate) label: String,
    pub(crate) keypoints: Vec<f32>,
}

/// An ordered collection of labeled samples with a constant feature width.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Dataset {
    samples: Vec<LabeledSample>,
}

impl Dataset {
    pub(crate) fn from_samples(samples: Vec<LabeledSample>) -> Result<Self, Error> {
        if let Some(first) = samples.first() {
            let expected = first.keypoints.len();
            for (index, sample) in samples.iter().enumerate() {
                if sample.label.trim().is_empty() {
                    return Err(Error::EmptyLabel {
                        index,
                        label: sample.label.clone(),
                    });
                }
                if sample.keypoints.len() != expected {
                    return Err(Error::InconsistentSampleWidth {
                        index,
                        expected,
                        got: sample.keypoints.len(),
                    });
                }
            }
        }
        Ok(Self { samples })
    }

    pub(crate) fn from_json(json: &str) -> Result<Self, Error> {
        let samples: Vec<LabeledSample> = serde_json::from_str(json).map_err(Error::ParseDataset)?;
        Self::from_samples(samples)
    }

    pub(crate) fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self.samples).map_err(Error::SerializeDataset)
    }

    pub(crate) fn load<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| Error::ReadFile(e, path.to_path_buf()))?;
        let dataset = Self::from_json(&json)?;
        info!(
            message = "loaded dataset",
            path = %path.display(),
            samples = dataset.len(),
            classes = dataset.labels().len()
        );
        Ok(dataset)
    }

    pub(crate) fn save<P>(&self, path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|e| Error::WriteFile(e, path.to_path_buf()))?;
        info!(
            message = "saved dataset",
            path = %path.display(),
            samples = self.len()
        );
        Ok(())
    }

    pub(crate) fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub(crate) fn feature_width(&self) -> Option<usize> {
        self.samples.first().map(|s| s.keypoints.len())
    }

    pub(crate) fn push(&mut self, sample: LabeledSample) {
        self.samples.push(sample);
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }

    /// Distinct labels in first-seen order. This is the label vocabulary: the
    /// position of a label is the classifier output index it maps to.
    pub(crate) fn labels(&self) -> Vec<String> {
        self.samples
            .iter()
            .map(|s| s.label.as_str())
            .unique()
            .map(str::to_owned)
            .collect()
    }
}
