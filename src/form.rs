use crate::{
    error::Error,
    pose::{Keypoint, KeypointKind, SkeletonSchema},
};
use std::fmt;

/// Angle at `b` between the segments to `a` and `c`, in degrees.
///
/// `None` when either segment has zero length.
pub(crate) fn joint_angle(a: &Keypoint, b: &Keypoint, c: &Keypoint) -> Option<f32> {
    let (abx, aby) = (b.x - a.x, b.y - a.y);
    let (cbx, cby) = (b.x - c.x, b.y - c.y);
    let magnitude = (abx * abx + aby * aby).sqrt() * (cbx * cbx + cby * cby).sqrt();
    if magnitude == 0.0 {
        return None;
    }
    let cosine = ((abx * cbx + aby * cby) / magnitude).clamp(-1.0, 1.0);
    Some(cosine.acos().to_degrees())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BackPosture {
    Straight,
    SlightlyBent,
    NeedsFix,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SquatDepth {
    Deep,
    Shallow,
}

/// The single message surfaced for a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Feedback {
    BodyNotVisible,
    FixBack,
    GoodSquat,
    GoDeeper,
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BodyNotVisible => "Make sure your body is visible",
            Self::FixBack => "Fix your back posture",
            Self::GoodSquat => "Good squat",
            Self::GoDeeper => "Go deeper",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct SquatReport {
    pub(crate) back: Option<(BackPosture, f32)>,
    pub(crate) depth: Option<(SquatDepth, f32)>,
}

impl SquatReport {
    /// Depth decides the message once the legs are visible; a badly bent back
    /// overrides it.
    pub(crate) fn feedback(&self) -> Feedback {
        match (self.back, self.depth) {
            (_, None) => Feedback::BodyNotVisible,
            (Some((BackPosture::NeedsFix, _)), Some(_)) => Feedback::FixBack,
            (_, Some((SquatDepth::Deep, _))) => Feedback::GoodSquat,
            (_, Some((SquatDepth::Shallow, _))) => Feedback::GoDeeper,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct FormRules {
    schema: SkeletonSchema,
    /// Every joint of a rule must score strictly above this.
    pub(crate) min_score: f32,
    pub(crate) straight_back_degrees: f32,
    pub(crate) slight_bend_degrees: f32,
    pub(crate) deep_knee_degrees: f32,
}

impl FormRules {
    pub(crate) fn new(schema: SkeletonSchema) -> Self {
        Self {
            schema,
            min_score: 0.5,
            straight_back_degrees: 160.0,
            slight_bend_degrees: 130.0,
            deep_knee_degrees: 100.0,
        }
    }

    /// Angle over three joints, left side first and right side as fallback.
    fn side_angle(
        &self,
        keypoints: &[Keypoint],
        left: [KeypointKind; 3],
        right: [KeypointKind; 3],
    ) -> Result<Option<f32>, Error> {
        for joints in [left, right].iter() {
            let mut points = [Keypoint::default(); 3];
            let mut visible = true;
            for (point, &kind) in points.iter_mut().zip(joints.iter()) {
                match keypoints.get(self.schema.index_of(kind)?) {
                    Some(kp) if kp.score > self.min_score => *point = *kp,
                    _ => visible = false,
                }
            }
            if visible {
                if let Some(angle) = joint_angle(&points[0], &points[1], &points[2]) {
                    return Ok(Some(angle));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn evaluate(&self, keypoints: &[Keypoint]) -> Result<SquatReport, Error> {
        use KeypointKind::*;

        let back = self
            .side_angle(
                keypoints,
                [LeftShoulder, LeftHip, LeftKnee],
                [RightShoulder, RightHip, RightKnee],
            )?
            .map(|angle| {
                let posture = if angle > self.straight_back_degrees {
                    BackPosture::Straight
                } else if angle > self.slight_bend_degrees {
                    BackPosture::SlightlyBent
                } else {
                    BackPosture::NeedsFix
                };
                (posture, angle)
            });
        let depth = self
            .side_angle(
                keypoints,
                [LeftHip, LeftKnee, LeftAnkle],
                [RightHip, RightKnee, RightAnkle],
            )?
            .map(|angle| {
                let depth = if angle < self.deep_knee_degrees {
                    SquatDepth::Deep
                } else {
                    SquatDepth::Shallow
                };
                (depth, angle)
            });
        Ok(SquatReport { back, depth })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn point(x: f32, y: f32) -> Keypoint {
        Keypoint::new(x, y, 0.0, 0.9)
    }

    /// A side-on MoveNet skeleton with the given hip and ankle positions.
    fn squat(shoulder: (f32, f32), hip: (f32, f32), ankle: (f32, f32)) -> Vec<Keypoint> {
        let mut kps = vec![Keypoint::new(0.0, 0.0, 0.0, 0.1); 17];
        let knee = point(0.5, 0.5);
        for &(kind, kp) in [
            (KeypointKind::LeftShoulder, point(shoulder.0, shoulder.1)),
            (KeypointKind::LeftHip, point(hip.0, hip.1)),
            (KeypointKind::LeftKnee, knee),
            (KeypointKind::LeftAnkle, point(ankle.0, ankle.1)),
        ]
        .iter()
        {
            kps[kind.idx().unwrap()] = kp;
        }
        kps
    }

    mod angle_tests {
        use super::*;

        #[test]
        fn right_angle() {
            let angle = joint_angle(&point(0.0, 1.0), &point(0.0, 0.0), &point(1.0, 0.0)).unwrap();
            assert_approx_eq!(angle, 90.0, 1e-3);
        }

        #[test]
        fn straight_line() {
            let angle = joint_angle(&point(0.0, 0.0), &point(1.0, 1.0), &point(2.0, 2.0)).unwrap();
            assert_approx_eq!(angle, 180.0, 1e-2);
        }

        #[test]
        fn degenerate_segment() {
            assert_eq!(
                joint_angle(&point(1.0, 1.0), &point(1.0, 1.0), &point(2.0, 0.0)),
                None
            );
        }
    }

    mod rule_tests {
        use super::*;

        #[test]
        fn standing_tall_needs_depth() {
            let rules = FormRules::new(SkeletonSchema::MoveNet);
            let report = rules
                .evaluate(&squat((0.5, -0.5), (0.5, 0.0), (0.5, 1.0)))
                .unwrap();
            assert_eq!(report.back.map(|(p, _)| p), Some(BackPosture::Straight));
            assert_eq!(report.depth.map(|(d, _)| d), Some(SquatDepth::Shallow));
            assert_eq!(report.feedback(), Feedback::GoDeeper);
        }

        #[test]
        fn deep_squat_with_upright_torso() {
            let rules = FormRules::new(SkeletonSchema::MoveNet);
            // thigh horizontal, shin vertical, torso leaning forward ~35°
            let report = rules
                .evaluate(&squat((-0.41, 0.213), (0.0, 0.5), (0.5, 1.0)))
                .unwrap();
            assert_eq!(report.depth.map(|(d, _)| d), Some(SquatDepth::Deep));
            assert_eq!(report.back.map(|(p, _)| p), Some(BackPosture::SlightlyBent));
            assert_eq!(report.feedback(), Feedback::GoodSquat);
        }

        #[test]
        fn collapsed_back_overrides_depth() {
            let rules = FormRules::new(SkeletonSchema::MoveNet);
            let report = rules
                .evaluate(&squat((0.5, 0.3), (0.0, 0.5), (0.5, 1.0)))
                .unwrap();
            assert_eq!(report.back.map(|(p, _)| p), Some(BackPosture::NeedsFix));
            assert_eq!(report.feedback(), Feedback::FixBack);
        }

        #[test]
        fn hidden_legs_fall_back_to_right_side() {
            let rules = FormRules::new(SkeletonSchema::MoveNet);
            let mut kps = squat((0.5, -0.5), (0.5, 0.0), (0.5, 1.0));
            assert!(rules.evaluate(&kps).unwrap().depth.is_some());

            kps[KeypointKind::LeftAnkle.idx().unwrap()].score = 0.2;
            assert_eq!(rules.evaluate(&kps).unwrap().feedback(), Feedback::BodyNotVisible);

            kps[KeypointKind::RightHip.idx().unwrap()] = point(0.5, 0.0);
            kps[KeypointKind::RightKnee.idx().unwrap()] = point(0.5, 0.5);
            kps[KeypointKind::RightAnkle.idx().unwrap()] = point(0.5, 1.0);
            assert_eq!(
                rules.evaluate(&kps).unwrap().depth.map(|(d, _)| d),
                Some(SquatDepth::Shallow)
            );
        }

        #[test]
        fn short_skeleton_is_not_visible() {
            let rules = FormRules::new(SkeletonSchema::BlazePose);
            let kps = vec![point(0.0, 0.0); 17];
            assert_eq!(rules.evaluate(&kps).unwrap().feedback(), Feedback::BodyNotVisible);
        }
    }
}
