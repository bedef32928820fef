use crate::error::Error;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Landmarks shared by every supported skeleton, in MoveNet order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub(crate) enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointKind {
    pub(crate) fn idx(self) -> Result<usize, Error> {
        self.to_usize().ok_or(Error::ConvertToUSize)
    }

    /// Position of this landmark in the 33-point BlazePose topology.
    fn blazepose_idx(self) -> usize {
        match self {
            Self::Nose => 0,
            Self::LeftEye => 2,
            Self::RightEye => 5,
            Self::LeftEar => 7,
            Self::RightEar => 8,
            Self::LeftShoulder => 11,
            Self::RightShoulder => 12,
            Self::LeftElbow => 13,
            Self::RightElbow => 14,
            Self::LeftWrist => 15,
            Self::RightWrist => 16,
            Self::LeftHip => 23,
            Self::RightHip => 24,
            Self::LeftKnee => 25,
            Self::RightKnee => 26,
            Self::LeftAnkle => 27,
            Self::RightAnkle => 28,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Keypoint {
    pub(crate) x: f32,
    pub(crate) y: f32,
    #[serde(default)]
    pub(crate) z: f32,
    pub(crate) score: f32,
}

impl Keypoint {
    pub(crate) fn new(x: f32, y: f32, z: f32, score: f32) -> Self {
        Self { x, y, z, score }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Pose {
    pub(crate) keypoints: Vec<Keypoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) score: Option<f32>,
}

/// The keypoint layout a pose estimator variant produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SkeletonSchema {
    /// 17 landmarks in image space, flattened as (x, y, score).
    MoveNet,
    /// 33 landmarks in 3-D, flattened as (x, y, z, score).
    BlazePose,
}

impl SkeletonSchema {
    pub(crate) fn num_keypoints(self) -> usize {
        match self {
            Self::MoveNet => constants::NUM_KEYPOINTS,
            Self::BlazePose => constants::NUM_BLAZEPOSE_KEYPOINTS,
        }
    }

    /// Number of values each keypoint contributes to a feature vector.
    pub(crate) fn values_per_keypoint(self) -> usize {
        match self {
            Self::MoveNet => 3,
            Self::BlazePose => 4,
        }
    }

    pub(crate) fn feature_width(self) -> usize {
        self.num_keypoints() * self.values_per_keypoint()
    }

    pub(crate) fn bones(self) -> &'static [(usize, usize)] {
        match self {
            Self::MoveNet => &constants::MOVENET_BONES,
            Self::BlazePose => &constants::BLAZEPOSE_BONES,
        }
    }

    pub(crate) fn index_of(self, kind: KeypointKind) -> Result<usize, Error> {
        match self {
            Self::MoveNet => kind.idx(),
            Self::BlazePose => Ok(kind.blazepose_idx()),
        }
    }

    /// Flatten keypoints into the classifier's feature layout.
    pub(crate) fn flatten(self, keypoints: &[Keypoint]) -> Vec<f32> {
        let mut features = Vec::with_capacity(keypoints.len() * self.values_per_keypoint());
        for kp in keypoints {
            match self {
                Self::MoveNet => features.extend_from_slice(&[kp.x, kp.y, kp.score]),
                Self::BlazePose => features.extend_from_slice(&[kp.x, kp.y, kp.z, kp.score]),
            }
        }
        features
    }
}

impl FromStr for SkeletonSchema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "movenet" => Ok(Self::MoveNet),
            "blazepose" => Ok(Self::BlazePose),
            other => Err(Error::UnknownSchema(other.to_owned())),
        }
    }
}

impl fmt::Display for SkeletonSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MoveNet => "movenet",
            Self::BlazePose => "blazepose",
        })
    }
}

pub(crate) mod constants {
    use crate::pose::KeypointKind::{self, *};

    pub(crate) const NUM_KEYPOINTS: usize = 17;
    pub(crate) const NUM_BLAZEPOSE_KEYPOINTS: usize = 33;

    const fn bone(a: KeypointKind, b: KeypointKind) -> (usize, usize) {
        (a as usize, b as usize)
    }

    pub(crate) const MOVENET_BONES: [(usize, usize); 19] = [
        bone(Nose, LeftEye),
        bone(Nose, RightEye),
        bone(Nose, LeftEar),
        bone(Nose, RightEar),
        bone(LeftEar, LeftEye),
        bone(RightEar, RightEye),
        bone(LeftEye, RightEye),
        bone(LeftShoulder, RightShoulder),
        bone(LeftShoulder, LeftElbow),
        bone(LeftShoulder, LeftHip),
        bone(RightShoulder, RightElbow),
        bone(RightShoulder, RightHip),
        bone(LeftElbow, LeftWrist),
        bone(RightElbow, RightWrist),
        bone(LeftHip, RightHip),
        bone(LeftHip, LeftKnee),
        bone(RightHip, RightKnee),
        bone(LeftKnee, LeftAnkle),
        bone(RightKnee, RightAnkle),
    ];

    pub(crate) const BLAZEPOSE_BONES: [(usize, usize); 21] = [
        // face
        (0, 1),
        (1, 2),
        (2, 3),
        (3, 7),
        (0, 4),
        (4, 5),
        (5, 6),
        (6, 8),
        (9, 10),
        // torso and arms
        (11, 12),
        (11, 13),
        (13, 15),
        (12, 14),
        (14, 16),
        (11, 23),
        (12, 24),
        (23, 24),
        // legs
        (23, 25),
        (24, 26),
        (25, 27),
        (26, 28),
    ];
}
