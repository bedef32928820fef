use crate::{
    aggregate::PredictionAggregator,
    classifier::ModelSlot,
    error::Error,
    form::FormRules,
    pose::{Keypoint, SkeletonSchema},
    quality::{GateResult, PoseStatus, QualityConfig, QualityGate},
    recorder::SampleRecorder,
    render::{NullRenderer, Observer, PredictionView, Renderer, Snapshot},
    smooth::{KeypointSmoother, DEFAULT_KEYPOINT_ALPHA},
    source::{FrameSource, PoseEstimator},
    speech::{LogVoice, SpeechAdvisor, SpeechConfig, Trigger, Voice},
};
use num_traits::ToPrimitive;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub(crate) const DEFAULT_READY_POLL: Duration = Duration::from_millis(50);

/// What the loop does with an evaluated frame.
#[derive(Debug)]
pub(crate) enum Mode {
    /// Capture eligible frames into a dataset.
    Collect(SampleRecorder),
    /// Classify eligible frames once a model has been published.
    Infer {
        model: ModelSlot,
        votes: PredictionAggregator,
    },
    /// Angle-based squat feedback, no model required.
    Coach(FormRules),
}

impl Mode {
    pub(crate) fn infer(model: ModelSlot, vote_window: usize) -> Self {
        Self::Infer {
            model,
            votes: PredictionAggregator::new(vote_window),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Self::Infer { model, .. } => model.is_ready(),
            Self::Collect(_) | Self::Coach(_) => true,
        }
    }

    pub(crate) fn recorder(&self) -> Option<&SampleRecorder> {
        match self {
            Self::Collect(recorder) => Some(recorder),
            _ => None,
        }
    }

    pub(crate) fn into_recorder(self) -> Option<SampleRecorder> {
        match self {
            Self::Collect(recorder) => Some(recorder),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Timing {
    /// Time spent waiting on the pose estimator.
    pub(crate) estimate: Duration,
    pub(crate) frames: usize,
}

impl Timing {
    pub(crate) fn fps(&self) -> Option<f64> {
        let secs = self.estimate.as_secs_f64();
        if secs > 0.0 {
            Some(self.frames.to_f64()? / secs)
        } else {
            None
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct LoopConfig {
    pub(crate) keypoint_alpha: f32,
    pub(crate) quality: QualityConfig,
    pub(crate) ready_poll: Duration,
}

impl LoopConfig {
    pub(crate) fn for_schema(schema: SkeletonSchema) -> Self {
        Self {
            keypoint_alpha: DEFAULT_KEYPOINT_ALPHA,
            quality: QualityConfig::for_schema(schema),
            ready_poll: DEFAULT_READY_POLL,
        }
    }
}

/// Drives frames through smoothing, gating and the active [`Mode`].
///
/// One iteration runs per frame and finishes before the next frame is read.
/// Clearing `running` stops the loop before the next iteration; an estimate
/// already in flight completes and its result is discarded.
pub(crate) struct DetectionLoop<S, E> {
    source: S,
    estimator: E,
    schema: SkeletonSchema,
    mode: Mode,
    smoother: KeypointSmoother,
    gate: QualityGate,
    renderer: Box<dyn Renderer + Send>,
    observer: Option<Box<dyn Observer + Send>>,
    speech: SpeechAdvisor<Box<dyn Voice + Send>>,
    running: Arc<AtomicBool>,
    ready_poll: Duration,
    started: bool,
    timing: Timing,
}

impl<S, E> DetectionLoop<S, E>
where
    S: FrameSource,
    E: PoseEstimator<S::Frame>,
{
    pub(crate) fn new(
        source: S,
        estimator: E,
        schema: SkeletonSchema,
        mode: Mode,
        config: LoopConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            estimator,
            schema,
            mode,
            smoother: KeypointSmoother::new(config.keypoint_alpha),
            gate: QualityGate::new(config.quality),
            renderer: Box::new(NullRenderer),
            observer: None,
            speech: SpeechAdvisor::new(
                SpeechConfig::default(),
                Box::new(LogVoice) as Box<dyn Voice + Send>,
            ),
            running,
            ready_poll: config.ready_poll,
            started: false,
            timing: Timing::default(),
        }
    }

    pub(crate) fn with_renderer(mut self, renderer: Box<dyn Renderer + Send>) -> Self {
        self.renderer = renderer;
        self
    }

    pub(crate) fn with_observer(mut self, observer: Box<dyn Observer + Send>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub(crate) fn with_speech(mut self, speech: SpeechAdvisor<Box<dyn Voice + Send>>) -> Self {
        self.speech = speech;
        self
    }

    pub(crate) fn into_mode(self) -> Mode {
        self.mode
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll until the source, the estimator and the mode can all proceed.
    ///
    /// Returns `false` if cancelled while waiting.
    fn wait_until_ready(&mut self) -> bool {
        let mut announced = false;
        while self.is_running() {
            if self.source.is_ready() && self.estimator.is_ready() && self.mode.is_ready() {
                return true;
            }
            if !announced {
                info!("waiting for frame source, pose estimator and model");
                announced = true;
            }
            thread::sleep(self.ready_poll);
        }
        false
    }

    /// Run until the source is exhausted or `running` is cleared.
    ///
    /// A loop runs at most once.
    pub(crate) fn run(&mut self) -> Result<Timing, Error> {
        if self.started {
            return Err(Error::LoopAlreadyStarted);
        }
        self.started = true;
        self.smoother.reset();
        self.gate.reset();

        if !self.wait_until_ready() {
            info!("detection loop cancelled before start");
            return Ok(self.timing);
        }
        info!(message = "detection loop started", schema = %self.schema);

        while self.is_running() {
            let frame = match self.source.next_frame()? {
                Some(frame) => frame,
                None => {
                    info!("frame source exhausted");
                    break;
                }
            };
            self.step(&frame)?;
        }

        info!(
            message = "detection loop finished",
            frames = self.timing.frames,
            fps = ?self.timing.fps()
        );
        Ok(self.timing)
    }

    /// Process one frame; `None` if the loop was cancelled during estimation.
    fn step(&mut self, frame: &S::Frame) -> Result<Option<Snapshot>, Error> {
        let start = Instant::now();
        let poses = self.estimator.estimate_poses(frame)?;
        self.timing.estimate += start.elapsed();

        if !self.is_running() {
            debug!("discarding estimate received after cancellation");
            return Ok(None);
        }
        self.timing.frames += 1;

        let raw = match poses.into_iter().next() {
            Some(pose) if !pose.keypoints.is_empty() => pose.keypoints,
            _ => {
                let gate = self.gate.no_pose();
                return Ok(Some(self.publish(&gate, None)));
            }
        };

        let expected = self.schema.num_keypoints();
        if raw.len() != expected {
            warn!(
                message = "pose does not match the configured schema",
                expected,
                got = raw.len()
            );
            return Err(Error::KeypointCountMismatch {
                expected,
                got: raw.len(),
            });
        }

        let smoothed = self.smoother.smooth(&raw).to_vec();
        self.renderer.render(&smoothed, self.schema.bones())?;
        let gate = self.gate.evaluate(&smoothed)?;
        if gate.display_changed {
            debug!(
                message = "pose quality changed",
                quality = gate.display_score,
                confident = gate.confident_count(),
                eligible = gate.eligible
            );
        }

        if gate.status == PoseStatus::AdjustPosition {
            self.speech
                .notify(Trigger::PoseQuality, &gate.status.to_string());
        }

        let prediction = self.dispatch(&smoothed, &gate)?;
        if let Some(view) = &prediction {
            if gate.status.is_ready() {
                let announcement = match self.mode {
                    Mode::Infer { .. } => format!("Detected {}", view.label),
                    _ => view.label.clone(),
                };
                self.speech.notify(Trigger::Prediction, &announcement);
            }
        }

        Ok(Some(self.publish(&gate, prediction)))
    }

    fn dispatch(
        &mut self,
        keypoints: &[Keypoint],
        gate: &GateResult,
    ) -> Result<Option<PredictionView>, Error> {
        match &mut self.mode {
            Mode::Collect(recorder) => {
                recorder.on_frame(keypoints, gate)?;
                Ok(None)
            }
            Mode::Infer { model, votes } => {
                let model = match model.current() {
                    Some(model) if gate.eligible => model,
                    _ => return Ok(None),
                };
                let prediction = model.predict(&self.schema.flatten(keypoints))?;
                let vote = votes.push(prediction.index);
                let label = model
                    .label(vote)
                    .map_or_else(|| format!("Class {}", vote), str::to_owned);
                debug!(
                    message = "classified frame",
                    raw = prediction.index,
                    vote,
                    label = %label,
                    confidence = prediction.confidence
                );
                Ok(Some(PredictionView {
                    label,
                    confidence: Some(prediction.confidence),
                }))
            }
            Mode::Coach(rules) => {
                let report = rules.evaluate(keypoints)?;
                debug!(
                    message = "evaluated form",
                    back = ?report.back,
                    depth = ?report.depth
                );
                Ok(Some(PredictionView {
                    label: report.feedback().to_string(),
                    confidence: None,
                }))
            }
        }
    }

    fn publish(&mut self, gate: &GateResult, prediction: Option<PredictionView>) -> Snapshot {
        let (recording, samples) = self
            .mode
            .recorder()
            .map_or((false, 0), |r| (r.is_recording(), r.sample_count()));
        let snapshot = Snapshot {
            frame: self.timing.frames,
            status: gate.status,
            quality: gate.display_score,
            eligible: gate.eligible,
            recording,
            samples,
            prediction,
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.publish(&snapshot);
        }
        snapshot
    }
}
