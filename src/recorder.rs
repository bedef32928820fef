use crate::{
    dataset::{Dataset, LabeledSample},
    error::Error,
    pose::{Keypoint, SkeletonSchema},
    quality::GateResult,
};
use tracing::{debug, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RecordingState {
    Idle,
    Recording,
    Stopped,
}

/// The exercise and form label attached to samples captured while recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordingTag {
    pub(crate) exercise: String,
    pub(crate) label: String,
}

impl RecordingTag {
    pub(crate) fn new(exercise: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            exercise: exercise.into(),
            label: label.into(),
        }
    }

    /// The label stored with each sample, e.g. `squat_good`.
    pub(crate) fn sample_label(&self) -> String {
        if self.exercise.is_empty() {
            self.label.clone()
        } else {
            format!("{}_{}", self.exercise, self.label)
        }
    }
}

/// Accumulates labeled keypoint vectors for one dataset.
#[derive(Debug)]
pub(crate) struct SampleRecorder {
    schema: SkeletonSchema,
    state: RecordingState,
    tag: Option<RecordingTag>,
    dataset: Dataset,
}

impl SampleRecorder {
    pub(crate) fn new(schema: SkeletonSchema) -> Self {
        Self {
            schema,
            state: RecordingState::Idle,
            tag: None,
            dataset: Dataset::default(),
        }
    }

    /// Resume collecting into previously exported samples, which must have
    /// been captured with the same schema.
    pub(crate) fn with_dataset(schema: SkeletonSchema, dataset: Dataset) -> Result<Self, Error> {
        if let Some(got) = dataset.feature_width() {
            let expected = schema.feature_width();
            if got != expected {
                return Err(Error::SampleWidthMismatch { expected, got });
            }
        }
        info!(message = "resuming dataset", samples = dataset.len());
        Ok(Self {
            dataset,
            ..Self::new(schema)
        })
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    pub(crate) fn sample_count(&self) -> usize {
        self.dataset.len()
    }

    pub(crate) fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Start a recording session. Also valid after [`stop`](Self::stop), which
    /// keeps earlier samples so several labels can share one dataset.
    pub(crate) fn start(&mut self, tag: RecordingTag) -> Result<(), Error> {
        if self.is_recording() {
            return Err(Error::AlreadyRecording);
        }
        info!(
            message = "recording started",
            label = %tag.sample_label(),
            samples = self.dataset.len()
        );
        self.tag = Some(tag);
        self.state = RecordingState::Recording;
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if self.is_recording() {
            self.state = RecordingState::Stopped;
            info!(message = "recording stopped", samples = self.dataset.len());
        }
    }

    pub(crate) fn reset(&mut self) -> Result<(), Error> {
        if self.is_recording() {
            return Err(Error::ResetWhileRecording);
        }
        self.dataset.clear();
        self.tag = None;
        self.state = RecordingState::Idle;
        info!("recording session reset");
        Ok(())
    }

    /// Capture the frame if recording and the gate accepted it.
    ///
    /// Returns whether a sample was stored.
    pub(crate) fn on_frame(
        &mut self,
        keypoints: &[Keypoint],
        gate: &GateResult,
    ) -> Result<bool, Error> {
        let tag = match (&self.tag, self.state) {
            (Some(tag), RecordingState::Recording) => tag,
            _ => return Ok(false),
        };
        if !gate.eligible {
            return Ok(false);
        }

        let sample = LabeledSample {
            label: tag.sample_label(),
            keypoints: self.schema.flatten(keypoints),
        };
        if let Some(expected) = self.dataset.feature_width() {
            if sample.keypoints.len() != expected {
                return Err(Error::SampleWidthMismatch {
                    expected,
                    got: sample.keypoints.len(),
                });
            }
        }
        debug!(
            message = "captured sample",
            label = %sample.label,
            count = self.dataset.len() + 1
        );
        self.dataset.push(sample);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{QualityConfig, QualityGate};

    fn frame(confident: usize) -> Vec<Keypoint> {
        (0..17)
            .map(|i| {
                let score = if i < confident { 0.9 } else { 0.1 };
                Keypoint::new(i as f32, i as f32, 0.0, score)
            })
            .collect()
    }

    mod lifecycle_tests {
        use super::*;

        #[test]
        fn start_twice_is_rejected() {
            let mut recorder = SampleRecorder::new(SkeletonSchema::MoveNet);
            recorder.start(RecordingTag::new("squat", "good")).unwrap();
            assert!(matches!(
                recorder.start(RecordingTag::new("squat", "bad")),
                Err(Error::AlreadyRecording)
            ));
        }

        #[test]
        fn reset_requires_stop() {
            let mut recorder = SampleRecorder::new(SkeletonSchema::MoveNet);
            recorder.start(RecordingTag::new("squat", "good")).unwrap();
            assert!(matches!(recorder.reset(), Err(Error::ResetWhileRecording)));
            recorder.stop();
            assert_eq!(recorder.state, RecordingState::Stopped);
            recorder.reset().unwrap();
            assert_eq!(recorder.state, RecordingState::Idle);
            assert_eq!(recorder.sample_count(), 0);
        }

        #[test]
        fn restart_after_stop_keeps_samples() {
            let mut gate = QualityGate::new(QualityConfig::default());
            let mut recorder = SampleRecorder::new(SkeletonSchema::MoveNet);
            let kps = frame(17);
            let result = gate.evaluate(&kps).unwrap();

            recorder.start(RecordingTag::new("squat", "good")).unwrap();
            recorder.on_frame(&kps, &result).unwrap();
            recorder.stop();
            recorder.start(RecordingTag::new("squat", "bad")).unwrap();
            recorder.on_frame(&kps, &result).unwrap();

            let labels: Vec<_> = recorder
                .dataset()
                .samples()
                .iter()
                .map(|s| s.label.as_str())
                .collect();
            assert_eq!(labels, vec!["squat_good", "squat_bad"]);
        }
    }

    mod capture_tests {
        use super::*;

        #[test]
        fn only_eligible_frames_while_recording_are_kept() {
            let mut gate = QualityGate::new(QualityConfig::default());
            let mut recorder = SampleRecorder::new(SkeletonSchema::MoveNet);
            let pattern = [17, 3, 16, 15, 14, 0, 17];

            // Idle frames are ignored regardless of quality.
            for &confident in pattern.iter() {
                let kps = frame(confident);
                let result = gate.evaluate(&kps).unwrap();
                assert!(!recorder.on_frame(&kps, &result).unwrap());
            }

            recorder.start(RecordingTag::new("", "plank")).unwrap();
            let mut eligible = 0;
            for &confident in pattern.iter() {
                let kps = frame(confident);
                let result = gate.evaluate(&kps).unwrap();
                let stored = recorder.on_frame(&kps, &result).unwrap();
                assert_eq!(stored, result.eligible);
                eligible += usize::from(result.eligible);
            }

            assert_eq!(eligible, 4);
            assert_eq!(recorder.sample_count(), eligible);
            let sample = &recorder.dataset().samples()[0];
            assert_eq!(sample.label, "plank");
            assert_eq!(sample.keypoints.len(), 51);
        }

        #[test]
        fn width_change_is_rejected() {
            let mut gate = QualityGate::new(QualityConfig::default());
            let mut recorder = SampleRecorder::new(SkeletonSchema::MoveNet);
            recorder.start(RecordingTag::new("squat", "good")).unwrap();
            let kps = frame(17);
            let result = gate.evaluate(&kps).unwrap();
            recorder.on_frame(&kps, &result).unwrap();

            let short = &kps[..16];
            assert!(matches!(
                recorder.on_frame(short, &result),
                Err(Error::SampleWidthMismatch { expected: 51, got: 48 })
            ));
        }
    }

    mod append_tests {
        use super::*;

        fn exported(width: usize) -> Dataset {
            Dataset::from_samples(vec![
                LabeledSample {
                    label: "squat_bad".to_owned(),
                    keypoints: vec![0.5; width],
                };
                2
            ])
            .unwrap()
        }

        #[test]
        fn matching_dataset_keeps_growing() {
            let mut gate = QualityGate::new(QualityConfig::default());
            let mut recorder =
                SampleRecorder::with_dataset(SkeletonSchema::MoveNet, exported(51)).unwrap();
            assert_eq!(recorder.state, RecordingState::Idle);
            assert_eq!(recorder.sample_count(), 2);

            recorder.start(RecordingTag::new("squat", "good")).unwrap();
            let kps = frame(17);
            let result = gate.evaluate(&kps).unwrap();
            assert!(recorder.on_frame(&kps, &result).unwrap());

            assert_eq!(recorder.sample_count(), 3);
            assert_eq!(recorder.dataset().labels(), vec!["squat_bad", "squat_good"]);
        }

        #[test]
        fn other_schema_is_rejected_up_front() {
            assert!(matches!(
                SampleRecorder::with_dataset(SkeletonSchema::MoveNet, exported(132)),
                Err(Error::SampleWidthMismatch {
                    expected: 51,
                    got: 132
                })
            ));
            assert!(SampleRecorder::with_dataset(SkeletonSchema::BlazePose, exported(132)).is_ok());
        }

        #[test]
        fn empty_import_is_accepted() {
            let recorder =
                SampleRecorder::with_dataset(SkeletonSchema::BlazePose, Dataset::default()).unwrap();
            assert_eq!(recorder.sample_count(), 0);
        }
    }
}
