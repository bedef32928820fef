use std::{
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub(crate) const DEFAULT_SPEECH_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_SILENT_PATTERN: &str = "good";

/// Independent rate-limit categories.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Trigger {
    PoseQuality,
    Prediction,
}

/// A text-to-speech sink.
pub(crate) trait Voice {
    /// Whether an earlier utterance is still playing.
    fn is_speaking(&mut self) -> bool;

    fn speak(&mut self, text: &str);
}

impl<V: Voice + ?Sized> Voice for Box<V> {
    fn is_speaking(&mut self) -> bool {
        (**self).is_speaking()
    }

    fn speak(&mut self, text: &str) {
        (**self).speak(text)
    }
}

/// Writes utterances to the log instead of an audio device.
#[derive(Debug, Default)]
pub(crate) struct LogVoice;

impl Voice for LogVoice {
    fn is_speaking(&mut self) -> bool {
        false
    }

    fn speak(&mut self, text: &str) {
        info!(message = "speak", text);
    }
}

/// Runs an external speech program (`say`, `espeak`, ...) with the text as
/// its final argument. The voice is busy while the child process runs.
#[derive(Debug)]
pub(crate) struct CommandVoice {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl CommandVoice {
    /// Split a command line on whitespace; `None` if it is blank.
    pub(crate) fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_owned);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
            child: None,
        })
    }
}

impl Voice for CommandVoice {
    fn is_speaking(&mut self) -> bool {
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return false,
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(message = "speech command failed", program = %self.program, %status);
                }
                self.child = None;
                false
            }
            Err(e) => {
                warn!(message = "failed to poll speech command", error = %e);
                self.child = None;
                false
            }
        }
    }

    fn speak(&mut self, text: &str) {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => self.child = Some(child),
            Err(e) => warn!(message = "failed to start speech command", program = %self.program, error = %e),
        }
    }
}

impl Drop for CommandVoice {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!(message = "failed to wait for speech command", error = %e);
            }
        }
    }
}

/// Drop everything except letters, digits, underscores and whitespace.
pub(crate) fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|&c| c.is_alphanumeric() || c == '_' || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_owned()
}

#[derive(Debug, Clone)]
pub(crate) struct SpeechConfig {
    pub(crate) interval: Duration,
    /// Prediction announcements containing this text (case-insensitive) are
    /// tracked but never spoken.
    pub(crate) silent_pattern: Option<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SPEECH_INTERVAL,
            silent_pattern: Some(DEFAULT_SILENT_PATTERN.to_owned()),
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    last_message: Option<String>,
    last_spoken: Option<Instant>,
}

/// Rate-limited spoken feedback.
#[derive(Debug)]
pub(crate) struct SpeechAdvisor<V> {
    config: SpeechConfig,
    voice: V,
    quality: Channel,
    prediction: Channel,
}

impl<V: Voice> SpeechAdvisor<V> {
    pub(crate) fn new(config: SpeechConfig, voice: V) -> Self {
        Self {
            config,
            voice,
            quality: Channel::default(),
            prediction: Channel::default(),
        }
    }

    pub(crate) fn notify(&mut self, trigger: Trigger, message: &str) -> bool {
        self.notify_at(trigger, message, Instant::now())
    }

    /// Returns whether an utterance was emitted.
    pub(crate) fn notify_at(&mut self, trigger: Trigger, message: &str, now: Instant) -> bool {
        let channel = match trigger {
            Trigger::PoseQuality => &mut self.quality,
            Trigger::Prediction => &mut self.prediction,
        };

        if trigger == Trigger::Prediction && channel.last_message.as_deref() == Some(message) {
            return false;
        }
        if let Some(last) = channel.last_spoken {
            if now.saturating_duration_since(last) < self.config.interval {
                return false;
            }
        }

        let silent = trigger == Trigger::Prediction
            && self
                .config
                .silent_pattern
                .as_deref()
                .map_or(false, |pattern| {
                    message.to_lowercase().contains(&pattern.to_lowercase())
                });

        let text = sanitize(message);
        if !silent {
            if text.is_empty() || self.voice.is_speaking() {
                return false;
            }
            self.voice.speak(&text);
        }

        debug!(message = "speech channel updated", ?trigger, text = %text, silent);
        channel.last_message = Some(message.to_owned());
        channel.last_spoken = Some(now);
        !silent
    }
}
