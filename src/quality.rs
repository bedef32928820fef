use crate::{error::Error, pose::{Keypoint, SkeletonSchema}};
use bitvec::prelude::*;
use num_traits::ToPrimitive;
use std::fmt;

/// Why a frame is or is not usable for capture and inference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PoseStatus {
    NoPoseDetected,
    AdjustPosition,
    Ready,
}

impl PoseStatus {
    pub(crate) fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

impl fmt::Display for PoseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoPoseDetected => "No pose detected",
            Self::AdjustPosition => "Step back or adjust your position",
            Self::Ready => "Pose detected, ready",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct QualityConfig {
    /// A keypoint counts as confident when its score is strictly above this.
    pub(crate) confidence_threshold: f32,
    /// Fraction of the skeleton that must be confident for a frame to be eligible.
    pub(crate) min_confident_fraction: f32,
    /// Blend factor for the displayed quality score.
    pub(crate) score_alpha: f32,
    /// Minimum change of the displayed score worth publishing.
    pub(crate) score_epsilon: f32,
}

impl QualityConfig {
    pub(crate) fn for_schema(schema: SkeletonSchema) -> Self {
        let min_confident_fraction = match schema {
            SkeletonSchema::MoveNet => 15.0 / 17.0,
            SkeletonSchema::BlazePose => 25.0 / 33.0,
        };
        Self {
            confidence_threshold: 0.5,
            min_confident_fraction,
            score_alpha: 0.1,
            score_epsilon: 0.1,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self::for_schema(SkeletonSchema::MoveNet)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GateResult {
    pub(crate) status: PoseStatus,
    /// Raw quality, `100 * confident / total`.
    pub(crate) score: f32,
    pub(crate) confident: BitVec,
    pub(crate) eligible: bool,
    /// Smoothed score as last published to observers.
    pub(crate) display_score: f32,
    /// Whether `display_score` moved on this frame.
    pub(crate) display_changed: bool,
}

impl GateResult {
    pub(crate) fn confident_count(&self) -> usize {
        self.confident.count_ones()
    }
}

#[derive(Debug, Clone)]
struct QualityMeter {
    alpha: f32,
    epsilon: f32,
    smoothed: f32,
    published: f32,
}

impl QualityMeter {
    fn update(&mut self, score: f32) -> bool {
        self.smoothed += self.alpha * (score - self.smoothed);
        if (self.smoothed - self.published).abs() > self.epsilon {
            self.published = self.smoothed;
            true
        } else {
            false
        }
    }

    fn clear(&mut self) -> bool {
        let changed = self.published != 0.0;
        self.smoothed = 0.0;
        self.published = 0.0;
        changed
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QualityGate {
    config: QualityConfig,
    meter: QualityMeter,
}

impl QualityGate {
    pub(crate) fn new(config: QualityConfig) -> Self {
        Self {
            meter: QualityMeter {
                alpha: config.score_alpha,
                epsilon: config.score_epsilon,
                smoothed: 0.0,
                published: 0.0,
            },
            config,
        }
    }

    /// Number of confident keypoints a skeleton of `n` landmarks needs.
    pub(crate) fn min_confident(&self, n: usize) -> Result<usize, Error> {
        let n = n.to_f32().ok_or(Error::ConvertToF32)?;
        (self.config.min_confident_fraction * n)
            .round()
            .to_usize()
            .ok_or(Error::ConvertToUSize)
    }

    pub(crate) fn reset(&mut self) {
        self.meter.clear();
    }

    pub(crate) fn evaluate(&mut self, keypoints: &[Keypoint]) -> Result<GateResult, Error> {
        if keypoints.is_empty() {
            return Ok(self.no_pose());
        }

        let threshold = self.config.confidence_threshold;
        let confident: BitVec = keypoints.iter().map(|kp| kp.score > threshold).collect();
        let count = confident.count_ones();
        let score = 100.0 * count.to_f32().ok_or(Error::ConvertToF32)?
            / keypoints.len().to_f32().ok_or(Error::ConvertToF32)?;
        let eligible = count >= self.min_confident(keypoints.len())?;
        let display_changed = self.meter.update(score);

        Ok(GateResult {
            status: if eligible {
                PoseStatus::Ready
            } else {
                PoseStatus::AdjustPosition
            },
            score,
            confident,
            eligible,
            display_score: self.meter.published,
            display_changed,
        })
    }

    pub(crate) fn no_pose(&mut self) -> GateResult {
        let display_changed = self.meter.clear();
        GateResult {
            status: PoseStatus::NoPoseDetected,
            score: 0.0,
            confident: BitVec::new(),
            eligible: false,
            display_score: 0.0,
            display_changed,
        }
    }
}
