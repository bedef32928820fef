use crate::{error::Error, pose::Pose};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Something that yields video frames.
pub(crate) trait FrameSource {
    type Frame;

    /// Whether frames can be decoded yet.
    fn is_ready(&mut self) -> bool;

    /// The next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Self::Frame>, Error>;
}

/// The external pose-estimation capability.
pub(crate) trait PoseEstimator<F> {
    fn is_ready(&mut self) -> bool {
        true
    }

    /// Zero or more poses; only the first is used.
    fn estimate_poses(&mut self, frame: &F) -> Result<Vec<Pose>, Error>;
}

/// One line of a keypoint trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RecordedFrame {
    #[serde(default)]
    pub(crate) timestamp_ms: u64,
    #[serde(default)]
    pub(crate) poses: Vec<Pose>,
}

/// Replays a JSON-lines keypoint trace as a frame source.
#[derive(Debug)]
pub(crate) struct ReplaySource<R> {
    lines: Lines<R>,
    origin: PathBuf,
    line: usize,
    realtime: bool,
    clock: Option<(Instant, u64)>,
}

impl ReplaySource<BufReader<File>> {
    pub(crate) fn open<P>(path: P, realtime: bool) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::ReadFile(e, path.to_path_buf()))?;
        info!(message = "replaying keypoint trace", path = %path.display(), realtime);
        Ok(Self::new(BufReader::new(file), path, realtime))
    }
}

impl<R> ReplaySource<R>
where
    R: BufRead,
{
    pub(crate) fn new(reader: R, origin: impl Into<PathBuf>, realtime: bool) -> Self {
        Self {
            lines: reader.lines(),
            origin: origin.into(),
            line: 0,
            realtime,
            clock: None,
        }
    }

    /// Sleep until `timestamp_ms` is due relative to the first frame.
    fn pace(&mut self, timestamp_ms: u64) {
        match self.clock {
            None => self.clock = Some((Instant::now(), timestamp_ms)),
            Some((start, first)) => {
                let due = Duration::from_millis(timestamp_ms.saturating_sub(first));
                let elapsed = start.elapsed();
                if due > elapsed {
                    thread::sleep(due - elapsed);
                }
            }
        }
    }
}

impl<R> FrameSource for ReplaySource<R>
where
    R: BufRead,
{
    type Frame = RecordedFrame;

    fn is_ready(&mut self) -> bool {
        true
    }

    fn next_frame(&mut self) -> Result<Option<RecordedFrame>, Error> {
        while let Some(line) = self.lines.next() {
            self.line += 1;
            let line = line.map_err(|e| Error::ReadFile(e, self.origin.clone()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: RecordedFrame =
                serde_json::from_str(&line).map_err(|e| Error::ParseTrace(e, self.line))?;
            if self.realtime {
                self.pace(frame.timestamp_ms);
            }
            return Ok(Some(frame));
        }
        debug!(message = "keypoint trace exhausted", lines = self.line);
        Ok(None)
    }
}

/// Returns the poses stored in each recorded frame.
#[derive(Debug, Default)]
pub(crate) struct RecordedPoses;

impl PoseEstimator<RecordedFrame> for RecordedPoses {
    fn estimate_poses(&mut self, frame: &RecordedFrame) -> Result<Vec<Pose>, Error> {
        Ok(frame.poses.clone())
    }
}
