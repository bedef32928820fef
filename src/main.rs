use anyhow::{anyhow, bail, Context, Result};
use classifier::{artifacts, EpochMetrics, ModelSlot, TrainingConfig, TrainingEngine};
use dataset::Dataset;
use engine::{DetectionLoop, LoopConfig, Mode, Timing};
use error::Error;
use indicatif::{ProgressBar, ProgressStyle};
use num_traits::ToPrimitive;
use pose::SkeletonSchema;
use quality::QualityConfig;
use recorder::{RecordingTag, SampleRecorder};
use render::{Snapshot, TraceRenderer};
use source::{FrameSource, PoseEstimator, RecordedPoses, ReplaySource};
use speech::{CommandVoice, LogVoice, SpeechAdvisor, SpeechConfig, Voice};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    time::{Duration, Instant},
};
use structopt::StructOpt;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;

mod aggregate;
mod classifier;
mod dataset;
mod engine;
mod error;
mod form;
mod pose;
mod quality;
mod recorder;
mod render;
mod smooth;
mod source;
mod speech;

fn parse_alpha(text: &str) -> Result<f32, String> {
    let alpha: f32 = text.parse().map_err(|e| format!("{}", e))?;
    if alpha > 0.0 && alpha < 1.0 {
        Ok(alpha)
    } else {
        Err(format!("{} is not strictly between 0 and 1", alpha))
    }
}

fn parse_fraction(text: &str) -> Result<f32, String> {
    let fraction: f32 = text.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&fraction) {
        Ok(fraction)
    } else {
        Err(format!("{} is not between 0 and 1", fraction))
    }
}

fn parse_interval(text: &str) -> Result<Duration, String> {
    let secs: f64 = text.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{}: {}", secs, e))
}

#[derive(Debug, structopt::StructOpt)]
struct PipelineOpts {
    /// Keypoint layout of the pose estimator: movenet (17 points) or blazepose (33 points).
    #[structopt(long, default_value = "movenet")]
    schema: SkeletonSchema,

    /// Blend factor for keypoint smoothing, in (0, 1).
    #[structopt(long, default_value = "0.2", parse(try_from_str = parse_alpha))]
    keypoint_alpha: f32,

    /// Blend factor for the displayed quality score.
    #[structopt(long, default_value = "0.1")]
    quality_alpha: f32,

    /// Smallest change of the displayed quality score worth publishing.
    #[structopt(long, default_value = "0.1")]
    quality_epsilon: f32,

    /// Keypoint score a landmark must exceed to count as confident.
    #[structopt(long, default_value = "0.5")]
    confidence_threshold: f32,

    /// Fraction of confident keypoints a frame needs. Defaults to 15/17 or 25/33.
    #[structopt(long, parse(try_from_str = parse_fraction))]
    min_confident_fraction: Option<f32>,

    /// Number of recent predictions in the majority vote.
    #[structopt(long, default_value = "10")]
    vote_window: usize,

    /// Minimum number of seconds between utterances of one kind.
    #[structopt(
        long = "speech-interval-secs",
        default_value = "5",
        parse(try_from_str = parse_interval)
    )]
    speech_interval: Duration,

    /// Speak through this program, e.g. "espeak -s 150". Utterances are logged otherwise.
    #[structopt(long)]
    voice_command: Option<String>,

    /// Predictions containing this text are never announced. Empty to announce everything.
    #[structopt(long, default_value = "good")]
    silent_label: String,

    /// Replay traces at their recorded pace.
    #[structopt(long)]
    realtime: bool,

    /// How often to poll collaborators that are not ready yet.
    #[structopt(long, default_value = "50")]
    ready_poll_ms: u64,

    #[structopt(short, long)]
    show_progress: bool,
}

impl PipelineOpts {
    fn loop_config(&self) -> LoopConfig {
        let defaults = QualityConfig::for_schema(self.schema);
        LoopConfig {
            keypoint_alpha: self.keypoint_alpha,
            quality: QualityConfig {
                confidence_threshold: self.confidence_threshold,
                min_confident_fraction: self
                    .min_confident_fraction
                    .unwrap_or(defaults.min_confident_fraction),
                score_alpha: self.quality_alpha,
                score_epsilon: self.quality_epsilon,
            },
            ready_poll: Duration::from_millis(self.ready_poll_ms),
        }
    }

    fn speech(&self) -> SpeechAdvisor<Box<dyn Voice + Send>> {
        let voice: Box<dyn Voice + Send> = match self
            .voice_command
            .as_deref()
            .and_then(CommandVoice::parse)
        {
            Some(voice) => Box::new(voice),
            None => Box::new(LogVoice),
        };
        let silent_pattern = if self.silent_label.is_empty() {
            None
        } else {
            Some(self.silent_label.clone())
        };
        SpeechAdvisor::new(
            SpeechConfig {
                interval: self.speech_interval,
                silent_pattern,
            },
            voice,
        )
    }

    fn detection_loop<S, E>(
        &self,
        source: S,
        estimator: E,
        mode: Mode,
        running: Arc<AtomicBool>,
        snapshots: Sender<Snapshot>,
    ) -> DetectionLoop<S, E>
    where
        S: FrameSource,
        E: PoseEstimator<S::Frame>,
    {
        DetectionLoop::new(
            source,
            estimator,
            self.schema,
            mode,
            self.loop_config(),
            running,
        )
        .with_renderer(Box::new(TraceRenderer::new(self.confidence_threshold)))
        .with_observer(Box::new(snapshots))
        .with_speech(self.speech())
    }
}

#[derive(Debug, structopt::StructOpt)]
struct TrainingOpts {
    /// Number of passes over the training split. Defaults to 50 (movenet) or 30 (blazepose).
    #[structopt(long)]
    epochs: Option<usize>,

    /// Samples per optimizer step. Defaults to 16 (movenet) or 32 (blazepose).
    #[structopt(long)]
    batch_size: Option<usize>,

    #[structopt(long)]
    learning_rate: Option<f32>,

    /// Fraction of samples held out for validation; 0 disables it.
    #[structopt(long)]
    validation_split: Option<f32>,

    /// Seed for weight initialization and shuffling.
    #[structopt(long, default_value = "42")]
    seed: u64,
}

impl TrainingOpts {
    fn config(&self, schema: SkeletonSchema) -> TrainingConfig {
        let defaults = TrainingConfig::for_schema(schema);
        TrainingConfig {
            epochs: self.epochs.unwrap_or(defaults.epochs),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
            validation_split: match self.validation_split {
                Some(split) if split == 0.0 => None,
                Some(split) => Some(split),
                None => defaults.validation_split,
            },
            seed: self.seed,
            ..defaults
        }
    }
}

#[derive(Debug, structopt::StructOpt)]
enum Command {
    /// Record labeled samples from a keypoint trace and export them as JSON.
    Collect {
        /// JSON-lines keypoint trace to replay.
        #[structopt(long)]
        trace: PathBuf,

        /// Exercise name, prefixed to the label, e.g. squat.
        #[structopt(long, default_value = "")]
        exercise: String,

        /// Form label of the recorded frames, e.g. good.
        #[structopt(long)]
        label: String,

        #[structopt(short, long, default_value = "pose-data.json")]
        output: PathBuf,

        /// Continue an exported dataset instead of starting empty.
        #[structopt(long)]
        append: Option<PathBuf>,
    },

    /// Train a classifier on an exported dataset.
    Train {
        dataset: PathBuf,

        /// Directory receiving model.json, weights.bin and labels.json.
        #[structopt(short, long, default_value = "model")]
        out_dir: PathBuf,

        #[structopt(flatten)]
        training: TrainingOpts,

        /// Classify this trace as soon as the model is ready.
        #[structopt(long)]
        predict: Option<PathBuf>,
    },

    /// Classify a keypoint trace with a saved model.
    Predict {
        /// Directory holding model.json, weights.bin and labels.json.
        #[structopt(long)]
        model_dir: Option<PathBuf>,

        #[structopt(long)]
        topology: Option<PathBuf>,

        #[structopt(long)]
        weights: Option<PathBuf>,

        #[structopt(long)]
        labels: Option<PathBuf>,

        #[structopt(long)]
        trace: PathBuf,
    },

    /// Rule-based squat feedback; no model required.
    Coach {
        #[structopt(long)]
        trace: PathBuf,
    },
}

#[derive(Debug, structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    #[structopt(flatten)]
    pipeline: PipelineOpts,

    #[structopt(subcommand)]
    command: Command,
}

fn spinner(show: bool) -> Option<ProgressBar> {
    if show {
        Some(
            ProgressBar::new_spinner().with_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
                    .template("{prefix:.bold.dim} {spinner} {wide_msg}"),
            ),
        )
    } else {
        None
    }
}

fn epoch_bar(show: bool, epochs: usize) -> Option<ProgressBar> {
    if show {
        Some(
            ProgressBar::new(epochs as u64).with_style(
                ProgressStyle::default_bar()
                    .template("{prefix:.bold.dim} [{bar:40}] {pos}/{len} {wide_msg}"),
            ),
        )
    } else {
        None
    }
}

fn describe(snapshot: &Snapshot) -> String {
    let mut text = format!(
        "frame {} | {} | quality {:.0}%",
        snapshot.frame, snapshot.status, snapshot.quality
    );
    if snapshot.recording {
        text.push_str(&format!(" | samples {}", snapshot.samples));
    }
    if let Some(prediction) = &snapshot.prediction {
        text.push_str(&format!(" | {}", prediction.label));
        if let Some(confidence) = prediction.confidence {
            text.push_str(&format!(" ({:.1}%)", 100.0 * confidence));
        }
    }
    text
}

fn describe_epoch(metrics: &EpochMetrics) -> String {
    let mut text = format!(
        "epoch {}/{} ({:.0}%) loss {:.4} accuracy {:.3}",
        metrics.epoch,
        metrics.epochs,
        metrics.percent_complete(),
        metrics.loss,
        metrics.accuracy
    );
    if let (Some(loss), Some(accuracy)) = (metrics.val_loss, metrics.val_accuracy) {
        text.push_str(&format!(" val_loss {:.4} val_accuracy {:.3}", loss, accuracy));
    }
    text
}

/// Run `detection` on its own thread while this thread reports its snapshots.
fn drive<S, E>(
    mut detection: DetectionLoop<S, E>,
    snapshots: Receiver<Snapshot>,
    progress: Option<&ProgressBar>,
) -> Result<(Timing, Mode)>
where
    S: FrameSource + Send,
    E: PoseEstimator<S::Frame> + Send,
{
    crossbeam::thread::scope(|scope| {
        let handle = scope.spawn(move |_| {
            let timing = detection.run()?;
            Ok::<_, Error>((timing, detection.into_mode()))
        });

        let started = Instant::now();
        let mut last_status = None;
        for snapshot in snapshots.iter() {
            if last_status != Some(snapshot.status) {
                info!(message = "pose status", status = %snapshot.status, frame = snapshot.frame);
                last_status = Some(snapshot.status);
            }
            match progress {
                Some(pb) => {
                    let fps = snapshot
                        .frame
                        .to_f64()
                        .map(|frames| frames / started.elapsed().as_secs_f64())
                        .unwrap_or_default();
                    pb.set_message(format!("{} | {:.1} fps", describe(&snapshot), fps));
                    pb.inc(1);
                }
                None => debug!(message = "frame", summary = %describe(&snapshot)),
            }
        }

        handle
            .join()
            .map_err(|_| anyhow!("detection loop panicked"))?
            .context("detection loop failed")
    })
    .map_err(|_| anyhow!("detection thread scope panicked"))?
}

fn collect(
    pipeline: &PipelineOpts,
    trace: PathBuf,
    tag: RecordingTag,
    output: PathBuf,
    append: Option<PathBuf>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let dataset = match append {
        Some(path) => Dataset::load(&path).context("failed importing dataset to append to")?,
        None => Dataset::default(),
    };
    let mut recorder = SampleRecorder::with_dataset(pipeline.schema, dataset)
        .with_context(|| format!("dataset to append to was not captured with the {} schema", pipeline.schema))?;
    recorder.start(tag).context("failed starting recording")?;

    let source = ReplaySource::open(&trace, pipeline.realtime).context("failed opening keypoint trace")?;
    let (snapshots_tx, snapshots_rx) = channel();
    let detection = pipeline.detection_loop(
        source,
        RecordedPoses,
        Mode::Collect(recorder),
        running,
        snapshots_tx,
    );
    let progress = spinner(pipeline.show_progress);
    let (timing, mode) = drive(detection, snapshots_rx, progress.as_ref())?;

    let mut recorder = mode
        .into_recorder()
        .ok_or_else(|| anyhow!("collect loop ended without its recorder"))?;
    recorder.stop();
    recorder
        .dataset()
        .save(&output)
        .context("failed exporting dataset")?;

    info!(
        message = "collection finished",
        frames = timing.frames,
        samples = recorder.sample_count(),
        labels = ?recorder.dataset().labels()
    );
    Ok(())
}

fn train(
    pipeline: &PipelineOpts,
    dataset: PathBuf,
    out_dir: PathBuf,
    training: TrainingOpts,
    predict: Option<PathBuf>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let dataset = Dataset::load(&dataset).context("failed importing dataset")?;
    let config = training.config(pipeline.schema);
    if let Some(width) = dataset.feature_width() {
        if width != pipeline.schema.feature_width() {
            bail!(
                "dataset rows hold {} values but the {} schema produces {}",
                width,
                pipeline.schema,
                pipeline.schema.feature_width()
            );
        }
    }

    let slot = ModelSlot::new();
    let bar = epoch_bar(pipeline.show_progress, config.epochs);

    // a prediction loop started now defers until the model is published
    let predictor = match predict {
        Some(trace) => {
            let source =
                ReplaySource::open(&trace, pipeline.realtime).context("failed opening keypoint trace")?;
            let (snapshots_tx, snapshots_rx) = channel();
            let detection = pipeline.detection_loop(
                source,
                RecordedPoses,
                Mode::infer(slot.clone(), pipeline.vote_window),
                running.clone(),
                snapshots_tx,
            );
            Some((detection, snapshots_rx))
        }
        None => None,
    };

    let (metrics_tx, metrics_rx) = channel::<EpochMetrics>();
    let dataset = &dataset;
    let trainer_slot = slot.clone();

    crossbeam::thread::scope(|scope| {
        let trainer = scope.spawn(move |_| {
            let mut engine = TrainingEngine::new(config);
            let model = engine.train(dataset, |metrics| {
                // the receiver lives until training ends
                let _ = metrics_tx.send(*metrics);
            })?;
            trainer_slot.publish(model);
            Ok::<_, Error>(engine.status())
        });

        let prediction = predictor.map(|(detection, snapshots_rx)| {
            scope.spawn(move |_| drive(detection, snapshots_rx, None))
        });

        for metrics in metrics_rx.iter() {
            match bar.as_ref() {
                Some(pb) => {
                    pb.set_position(metrics.epoch as u64);
                    pb.set_message(describe_epoch(&metrics));
                }
                None => info!(message = "training progress", summary = %describe_epoch(&metrics)),
            }
        }

        let trained = trainer
            .join()
            .map_err(|_| anyhow!("training thread panicked"))?;
        if trained.is_err() {
            running.store(false, Ordering::SeqCst);
        }
        let status = trained.context("training failed")?;
        if let Some(pb) = bar.as_ref() {
            pb.finish_with_message(format!("training {:?}", status));
        }

        if let Some(prediction) = prediction {
            let (timing, _) = prediction
                .join()
                .map_err(|_| anyhow!("prediction thread panicked"))??;
            info!(message = "live prediction finished", frames = timing.frames);
        }
        Ok::<_, anyhow::Error>(())
    })
    .map_err(|_| anyhow!("training thread scope panicked"))??;

    let model = slot
        .current()
        .ok_or_else(|| anyhow!("training finished without publishing a model"))?;
    artifacts::save(&model, &out_dir).context("failed exporting model")?;
    Ok(())
}

fn predict(
    pipeline: &PipelineOpts,
    paths: artifacts::ModelPaths,
    trace: PathBuf,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let model = artifacts::load(&paths).context("failed loading model")?;
    if model.input_width() != pipeline.schema.feature_width() {
        bail!(
            "model expects {} features but the {} schema produces {}",
            model.input_width(),
            pipeline.schema,
            pipeline.schema.feature_width()
        );
    }
    let slot = ModelSlot::new();
    slot.publish(model);

    let source = ReplaySource::open(&trace, pipeline.realtime).context("failed opening keypoint trace")?;
    let (snapshots_tx, snapshots_rx) = channel();
    let detection = pipeline.detection_loop(
        source,
        RecordedPoses,
        Mode::infer(slot, pipeline.vote_window),
        running,
        snapshots_tx,
    );
    let progress = spinner(pipeline.show_progress);
    let (timing, _) = drive(detection, snapshots_rx, progress.as_ref())?;
    info!(message = "prediction finished", frames = timing.frames, fps = ?timing.fps());
    Ok(())
}

fn coach(pipeline: &PipelineOpts, trace: PathBuf, running: Arc<AtomicBool>) -> Result<()> {
    let source = ReplaySource::open(&trace, pipeline.realtime).context("failed opening keypoint trace")?;
    let (snapshots_tx, snapshots_rx) = channel();
    let detection = pipeline.detection_loop(
        source,
        RecordedPoses,
        Mode::Coach(form::FormRules::new(pipeline.schema)),
        running,
        snapshots_tx,
    );
    let progress = spinner(pipeline.show_progress);
    let (timing, _) = drive(detection, snapshots_rx, progress.as_ref())?;
    info!(message = "coaching finished", frames = timing.frames);
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(opt.log_level),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrl_c = running.clone();

    ctrlc::set_handler(move || {
        running_ctrl_c.store(false, Ordering::SeqCst);
    })
    .context("failed setting Ctrl-C handler")?;

    let pipeline = opt.pipeline;
    match opt.command {
        Command::Collect {
            trace,
            exercise,
            label,
            output,
            append,
        } => collect(
            &pipeline,
            trace,
            RecordingTag::new(exercise, label),
            output,
            append,
            running,
        ),
        Command::Train {
            dataset,
            out_dir,
            training,
            predict: trace,
        } => train(&pipeline, dataset, out_dir, training, trace, running),
        Command::Predict {
            model_dir,
            topology,
            weights,
            labels,
            trace,
        } => {
            let found = model_dir
                .map(artifacts::ModelPaths::in_dir)
                .unwrap_or_default();
            let paths = artifacts::ModelPaths {
                topology: topology.or(found.topology),
                weights: weights.or(found.weights),
                labels: labels.or(found.labels),
            };
            predict(&pipeline, paths, trace, running)
        }
        Command::Coach { trace } => coach(&pipeline, trace, running),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(args: &[&str]) -> std::result::Result<PipelineOpts, structopt::clap::Error> {
        PipelineOpts::from_iter_safe(std::iter::once("form-coach").chain(args.iter().copied()))
    }

    mod argument_tests {
        use super::*;

        #[test]
        fn defaults_parse() {
            let opts = pipeline(&[]).unwrap();
            assert_eq!(opts.speech_interval, Duration::from_secs(5));
            assert_eq!(opts.min_confident_fraction, None);
            assert!((opts.keypoint_alpha - 0.2).abs() < f32::EPSILON);
        }

        #[test]
        fn fractional_interval_is_accepted() {
            let opts = pipeline(&["--speech-interval-secs", "1.5"]).unwrap();
            assert_eq!(opts.speech_interval, Duration::from_millis(1500));
        }

        #[test]
        fn unrepresentable_interval_is_rejected() {
            for secs in ["inf", "-1", "NaN", "1e30"].iter() {
                assert!(pipeline(&["--speech-interval-secs", *secs]).is_err(), "{}", secs);
            }
        }

        #[test]
        fn keypoint_alpha_must_be_open_unit() {
            for alpha in ["0", "1", "-0.2", "1.5", "NaN"].iter() {
                assert!(pipeline(&["--keypoint-alpha", *alpha]).is_err(), "{}", alpha);
            }
            assert!(pipeline(&["--keypoint-alpha", "0.5"]).is_ok());
        }

        #[test]
        fn confident_fraction_must_be_closed_unit() {
            for fraction in ["-0.1", "1.01", "NaN"].iter() {
                assert!(
                    pipeline(&["--min-confident-fraction", *fraction]).is_err(),
                    "{}",
                    fraction
                );
            }
            let opts = pipeline(&["--min-confident-fraction", "1"]).unwrap();
            assert_eq!(opts.min_confident_fraction, Some(1.0));
            assert!(pipeline(&["--min-confident-fraction", "0"]).is_ok());
        }
    }
}
