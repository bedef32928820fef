use crate::{error::Error, pose::Keypoint, quality::PoseStatus};
use std::sync::mpsc::Sender;
use tracing::trace;

/// Draws the smoothed skeleton overlay.
pub(crate) trait Renderer {
    fn render(&mut self, keypoints: &[Keypoint], bones: &[(usize, usize)]) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub(crate) struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _keypoints: &[Keypoint], _bones: &[(usize, usize)]) -> Result<(), Error> {
        Ok(())
    }
}

/// Bones whose endpoints both score above `threshold`.
pub(crate) fn visible_bones<'a>(
    keypoints: &'a [Keypoint],
    bones: &'a [(usize, usize)],
    threshold: f32,
) -> impl Iterator<Item = (&'a Keypoint, &'a Keypoint)> + 'a {
    bones.iter().filter_map(move |&(a, b)| {
        match (keypoints.get(a), keypoints.get(b)) {
            (Some(a), Some(b)) if a.score > threshold && b.score > threshold => Some((a, b)),
            _ => None,
        }
    })
}

/// Emits the overlay as trace events.
#[derive(Debug)]
pub(crate) struct TraceRenderer {
    threshold: f32,
}

impl TraceRenderer {
    pub(crate) fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Renderer for TraceRenderer {
    fn render(&mut self, keypoints: &[Keypoint], bones: &[(usize, usize)]) -> Result<(), Error> {
        for (a, b) in visible_bones(keypoints, bones, self.threshold) {
            trace!(
                message = "bone",
                from_x = a.x,
                from_y = a.y,
                to_x = b.x,
                to_y = b.y
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PredictionView {
    pub(crate) label: String,
    /// Confidence of the latest raw inference, not of the vote.
    pub(crate) confidence: Option<f32>,
}

/// Loop state published after every iteration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) frame: usize,
    pub(crate) status: PoseStatus,
    /// Smoothed quality score, 0 to 100.
    pub(crate) quality: f32,
    pub(crate) eligible: bool,
    pub(crate) recording: bool,
    pub(crate) samples: usize,
    pub(crate) prediction: Option<PredictionView>,
}

pub(crate) trait Observer {
    fn publish(&mut self, snapshot: &Snapshot);
}

impl Observer for Sender<Snapshot> {
    fn publish(&mut self, snapshot: &Snapshot) {
        if self.send(snapshot.clone()).is_err() {
            trace!("snapshot receiver hung up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::SkeletonSchema;

    #[test]
    fn only_confident_bones_are_visible() {
        let mut kps = vec![Keypoint::new(0.0, 0.0, 0.0, 0.9); 17];
        kps[0].score = 0.3;
        let bones = SkeletonSchema::MoveNet.bones();
        let visible = visible_bones(&kps, bones, 0.5).count();
        // four bones touch the nose
        assert_eq!(visible, bones.len() - 4);
    }

    #[test]
    fn out_of_range_bones_are_skipped() {
        let kps = vec![Keypoint::new(0.0, 0.0, 0.0, 0.9); 17];
        let bones = SkeletonSchema::BlazePose.bones();
        assert!(visible_bones(&kps, bones, 0.5).all(|(a, b)| a.score > 0.5 && b.score > 0.5));
        assert!(visible_bones(&kps, bones, 0.5).count() < bones.len());
    }

    #[test]
    fn sender_observer_forwards_snapshots() {
        let (mut tx, rx) = std::sync::mpsc::channel();
        let snapshot = Snapshot {
            frame: 3,
            status: PoseStatus::Ready,
            quality: 88.0,
            eligible: true,
            recording: false,
            samples: 0,
            prediction: None,
        };
        tx.publish(&snapshot);
        assert_eq!(rx.recv().unwrap(), snapshot);
        drop(rx);
        tx.publish(&snapshot);
    }
}
