use std::path::PathBuf;
use std::time::{Duration, Instant};

/// High-level behaviour requested by the caller.
///
/// The render policy decides whether frames should animate continuously,
/// be evaluated at a fixed timestamp, or be exported to disk.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderPolicy {
    /// Run the render loop continuously, optionally clamping the frame rate.
    Animate {
        /// Optional requested frames-per-second cap.
        target_fps: Option<f32>,
    },
    /// Render a single still frame at an optional timestamp and keep it on
    /// screen until the window closes.
    Still {
        /// Specific timestamp to evaluate the shader at (seconds).
        time: Option<f32>,
    },
    /// Render a frame, write it to a PNG file and exit.
    Export {
        /// Specific timestamp to evaluate the shader at (seconds).
        time: Option<f32>,
        /// Destination path for the exported file.
        path: PathBuf,
    },
}

impl Default for RenderPolicy {
    fn default() -> Self {
        Self::Animate { target_fps: None }
    }
}

impl RenderPolicy {
    pub fn is_export(&self) -> bool {
        matches!(self, Self::Export { .. })
    }
}

/// Snapshot of the time state supplied to the shader uniforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSample {
    /// Elapsed wall-clock or simulated time in seconds.
    pub seconds: f32,
    /// Monotonic frame counter for the running session.
    pub frame_index: u64,
}

impl TimeSample {
    pub fn new(seconds: f32, frame_index: u64) -> Self {
        Self {
            seconds,
            frame_index,
        }
    }
}

/// Abstraction over where time values originate from.
pub trait TimeSource: Send {
    /// Resets the source to its initial state.
    fn reset(&mut self);
    /// Produces a time sample for the next frame.
    fn sample(&mut self) -> TimeSample;
}

/// Time source backed by the system monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: Instant,
    frame: u64,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            frame: 0,
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn reset(&mut self) {
        self.origin = Instant::now();
        self.frame = 0;
    }

    fn sample(&mut self) -> TimeSample {
        let elapsed = self.origin.elapsed();
        let sample = TimeSample::new(elapsed.as_secs_f32(), self.frame);
        self.frame = self.frame.saturating_add(1);
        sample
    }
}

/// Time source that always reports a fixed timestamp.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    time: f32,
    frame: u64,
}

impl FixedTimeSource {
    pub fn new(time: f32) -> Self {
        Self { time, frame: 0 }
    }

    pub fn time(&self) -> f32 {
        self.time
    }
}

impl TimeSource for FixedTimeSource {
    fn reset(&mut self) {
        self.frame = 0;
    }

    fn sample(&mut self) -> TimeSample {
        let sample = TimeSample::new(self.time, self.frame);
        self.frame = self.frame.saturating_add(1);
        sample
    }
}

pub type BoxedTimeSource = Box<dyn TimeSource + Send>;

/// Builds a time source suited to the requested render policy.
pub fn time_source_for_policy(policy: &RenderPolicy) -> BoxedTimeSource {
    match policy {
        RenderPolicy::Animate { .. } => Box::new(SystemTimeSource::new()),
        RenderPolicy::Still { time } | RenderPolicy::Export { time, .. } => {
            Box::new(FixedTimeSource::new(time.unwrap_or(0.0)))
        }
    }
}

/// Decides when the next frame is due under a render policy.
///
/// Animation without a cap renders whenever the event loop is idle; with a
/// cap, frames are spaced by `1 / fps` and a late frame does not trigger a
/// burst of catch-up frames. Still and export policies render exactly once.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    policy: RenderPolicy,
    interval: Option<Duration>,
    next_frame: Option<Instant>,
    rendered: u64,
}

impl FrameScheduler {
    pub fn new(policy: RenderPolicy) -> Self {
        let interval = match &policy {
            RenderPolicy::Animate {
                target_fps: Some(fps),
            } if fps.is_finite() && *fps > 0.0 => {
                Some(Duration::from_secs_f64(1.0 / f64::from(*fps)))
            }
            _ => None,
        };
        Self {
            policy,
            interval,
            next_frame: None,
            rendered: 0,
        }
    }

    pub fn policy(&self) -> &RenderPolicy {
        &self.policy
    }

    pub fn frames_rendered(&self) -> u64 {
        self.rendered
    }

    fn single_shot(&self) -> bool {
        !matches!(self.policy, RenderPolicy::Animate { .. })
    }

    pub fn ready_for_frame(&mut self, now: Instant) -> bool {
        if self.single_shot() {
            return self.rendered == 0;
        }
        match self.next_frame {
            Some(due) => now >= due,
            None => true,
        }
    }

    /// Records a presented frame and schedules the next one.
    pub fn mark_rendered(&mut self) {
        self.mark_rendered_at(Instant::now());
    }

    pub fn mark_rendered_at(&mut self, now: Instant) {
        self.rendered = self.rendered.saturating_add(1);
        if let Some(interval) = self.interval {
            let next = match self.next_frame {
                Some(due) if due + interval > now => due + interval,
                _ => now + interval,
            };
            self.next_frame = Some(next);
        }
    }

    /// Instant the event loop should wake at, or `None` to wait for events.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.single_shot() {
            return None;
        }
        self.next_frame
    }

    pub fn reset(&mut self) {
        self.next_frame = None;
        self.rendered = 0;
    }
}
