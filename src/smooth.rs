use crate::pose::Keypoint;
use tracing::warn;

pub(crate) const DEFAULT_KEYPOINT_ALPHA: f32 = 0.2;

/// Exponential smoothing over a fixed-size keypoint set.
///
/// The first observation after construction or [`reset`](Self::reset) seeds the
/// state unchanged. Every later observation is blended into it with `alpha`
/// weighting the new value.
#[derive(Debug, Clone)]
pub(crate) struct KeypointSmoother {
    alpha: f32,
    state: Vec<Keypoint>,
}

impl Default for KeypointSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_KEYPOINT_ALPHA)
    }
}

fn blend(alpha: f32, new: f32, old: f32) -> f32 {
    alpha * new + (1.0 - alpha) * old
}

impl KeypointSmoother {
    pub(crate) fn new(alpha: f32) -> Self {
        Self {
            alpha,
            state: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state.clear();
    }

    pub(crate) fn smooth(&mut self, raw: &[Keypoint]) -> &[Keypoint] {
        if self.state.len() != raw.len() {
            if !self.state.is_empty() {
                warn!(
                    message = "keypoint count changed, reseeding smoother",
                    previous = self.state.len(),
                    current = raw.len()
                );
            }
            self.state.clear();
            self.state.extend_from_slice(raw);
            return &self.state;
        }

        let alpha = self.alpha;
        for (smoothed, kp) in self.state.iter_mut().zip(raw) {
            smoothed.x = blend(alpha, kp.x, smoothed.x);
            smoothed.y = blend(alpha, kp.y, smoothed.y);
            smoothed.z = blend(alpha, kp.z, smoothed.z);
            smoothed.score = blend(alpha, kp.score, smoothed.score);
        }
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn skeleton(value: f32, score: f32) -> Vec<Keypoint> {
        vec![Keypoint::new(value, value * 2.0, value * 3.0, score); 17]
    }

    #[test]
    fn first_frame_passes_through() {
        let mut smoother = KeypointSmoother::default();
        let raw = skeleton(10.0, 0.9);
        assert_eq!(smoother.smooth(&raw), raw.as_slice());
    }

    #[test]
    fn second_frame_lies_between_observations() {
        let mut smoother = KeypointSmoother::default();
        smoother.smooth(&skeleton(10.0, 0.2));
        let out = smoother.smooth(&skeleton(20.0, 0.8)).to_vec();
        for kp in out {
            assert!(kp.x > 10.0 && kp.x < 20.0);
            assert!(kp.y > 20.0 && kp.y < 40.0);
            assert!(kp.z > 30.0 && kp.z < 60.0);
            assert!(kp.score > 0.2 && kp.score < 0.8);
            assert_approx_eq!(kp.x, 12.0);
            assert_approx_eq!(kp.score, 0.32);
        }
    }

    #[test]
    fn reset_drops_previous_subject() {
        let mut smoother = KeypointSmoother::new(0.5);
        smoother.smooth(&skeleton(100.0, 1.0));
        smoother.reset();
        assert!(smoother.state.is_empty());
        let raw = skeleton(1.0, 0.1);
        assert_eq!(smoother.smooth(&raw), raw.as_slice());
    }

    #[test]
    fn length_change_reseeds() {
        let mut smoother = KeypointSmoother::default();
        smoother.smooth(&skeleton(5.0, 0.5));
        let raw = vec![Keypoint::new(1.0, 1.0, 1.0, 1.0); 33];
        assert_eq!(smoother.smooth(&raw), raw.as_slice());
    }
}
