use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("unknown skeleton schema: {0}")]
    UnknownSchema(String),

    #[error("expected {expected} keypoints for the configured schema, got {got}")]
    KeypointCountMismatch { expected: usize, got: usize },

    #[error("failed to convert value to f32")]
    ConvertToF32,

    #[error("failed to convert value to usize")]
    ConvertToUSize,

    #[error("recording session is already active")]
    AlreadyRecording,

    #[error("cannot reset a recording session while recording; stop it first")]
    ResetWhileRecording,

    #[error("sample width {got} does not match the dataset width {expected}")]
    SampleWidthMismatch { expected: usize, got: usize },

    #[error("failed to read {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("failed to write {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),

    #[error("failed to parse dataset")]
    ParseDataset(#[source] serde_json::Error),

    #[error("failed to serialize dataset")]
    SerializeDataset(#[source] serde_json::Error),

    #[error("sample {index} has label {label:?}; labels must be non-empty")]
    EmptyLabel { index: usize, label: String },

    #[error("sample {index} has {got} features, expected {expected}")]
    InconsistentSampleWidth {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("failed to parse keypoint trace at line {1}")]
    ParseTrace(#[source] serde_json::Error, usize),

    #[error("cannot train on an empty dataset")]
    EmptyDataset,

    #[error("cannot train a classifier on a single class: {0:?}")]
    SingleClassDataset(String),

    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("epoch budget must be positive")]
    InvalidEpochs,

    #[error("validation split must lie in [0, 1), got {0}")]
    InvalidValidationSplit(f32),

    #[error("validation split leaves no samples to train on")]
    EmptyTrainingSplit,

    #[error("failed to build feature matrix")]
    ShapeFeatures(#[source] ndarray::ShapeError),

    #[error("classifier expects {expected} features, got {got}")]
    FeatureWidthMismatch { expected: usize, got: usize },

    #[error("model upload is missing {0}; topology, weights and labels are all required")]
    MissingArtifact(&'static str),

    #[error("labels file must contain a JSON array of strings")]
    LabelsNotAList,

    #[error("failed to parse labels")]
    ParseLabels(#[source] serde_json::Error),

    #[error("failed to parse model topology")]
    ParseTopology(#[source] serde_json::Error),

    #[error("failed to serialize model topology")]
    SerializeTopology(#[source] serde_json::Error),

    #[error("unsupported model format: {0}")]
    UnsupportedModelFormat(String),

    #[error("model topology is inconsistent: {0}")]
    InvalidTopology(String),

    #[error("weights blob holds {got} bytes, topology requires {expected}")]
    WeightsSizeMismatch { expected: usize, got: usize },

    #[error("{labels} labels do not match {outputs} model outputs")]
    VocabularyMismatch { labels: usize, outputs: usize },

    #[error("detection loop has already been started")]
    LoopAlreadyStarted,
}
