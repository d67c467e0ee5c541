//! Video Decode Surface.
//!
//! A worker thread decodes a media file through an `ffmpeg` subprocess into
//! raw RGBA frames, paced at the source frame rate, and publishes each one
//! into a single-slot mailbox. Publishing overwrites any frame the render
//! thread has not taken yet; overwritten frames are counted, never queued.
//! The worker never touches GPU handles.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::control::ControlHandle;
use crate::gl::{Gpu, TextureId, VertexArrayId, CLAMP_TO_EDGE, LINEAR};
use crate::gl::{TEXTURE_MAG_FILTER, TEXTURE_MIN_FILTER, TEXTURE_WRAP_S, TEXTURE_WRAP_T};
use crate::program::{self, GraphicsProgram, ProgramError, PASSTHROUGH_FRAGMENT};
use crate::target::BACKGROUND;

const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("video file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("ffprobe failed: {0}")]
    Probe(String),
    #[error("video decode failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to spawn decode thread: {0}")]
    Thread(io::Error),
    #[error("decode thread panicked")]
    Panicked,
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("failed to create video {object}: {reason}")]
    CreateObject { object: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VideoInfo {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Native frame interval. Rates below 1 fps are honoured; a non-positive
    /// rate falls back to the default.
    pub fn frame_duration(&self) -> Duration {
        let fps = if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            DEFAULT_FPS
        };
        Duration::from_secs_f64(1.0 / fps)
    }
}

/// Parses `num/den` or a plain number; falls back to 30 fps.
pub fn parse_frame_rate(rate: &str) -> f64 {
    let rate = rate.trim();
    let parsed = match rate.split_once('/') {
        Some((num, den)) => match (num.parse::<f64>(), den.parse::<f64>()) {
            (Ok(num), Ok(den)) if den > 0.0 => Some(num / den),
            _ => None,
        },
        None => rate.parse::<f64>().ok(),
    };
    parsed
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(DEFAULT_FPS)
}

/// Parses `width,height,rate` as printed by `ffprobe -of csv=p=0`.
pub fn parse_probe_output(output: &str) -> Result<VideoInfo, VideoError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| VideoError::Probe("no video stream found".into()))?;
    let mut fields = line.split(',');
    let mut dimension = |name: &str| -> Result<u32, VideoError> {
        fields
            .next()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|value| *value > 0)
            .ok_or_else(|| VideoError::Probe(format!("missing {name} in '{line}'")))
    };
    let width = dimension("width")?;
    let height = dimension("height")?;
    let fps = parse_frame_rate(fields.next().unwrap_or(""));
    Ok(VideoInfo { width, height, fps })
}

pub fn probe(path: &Path) -> Result<VideoInfo, VideoError> {
    if !path.exists() {
        return Err(VideoError::NotFound(path.to_path_buf()));
    }
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| VideoError::Spawn {
            tool: "ffprobe",
            source,
        })?;
    if !output.status.success() {
        return Err(VideoError::Probe(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// Top-down RGBA rows.
    pub pixels: Vec<u8>,
}

/// Producer half of the single-slot mailbox.
#[derive(Debug, Clone)]
pub struct FramePublisher {
    sender: Sender<DecodedFrame>,
    // Held so a full slot can be drained before publishing the newer frame.
    drain: Receiver<DecodedFrame>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of the single-slot mailbox.
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    receiver: Receiver<DecodedFrame>,
    dropped: Arc<AtomicU64>,
}

pub fn frame_mailbox() -> (FramePublisher, FrameReceiver) {
    let (sender, receiver) = bounded(1);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FramePublisher {
            sender,
            drain: receiver.clone(),
            dropped: dropped.clone(),
        },
        FrameReceiver { receiver, dropped },
    )
}

impl FramePublisher {
    /// Publishes `frame`, replacing any unconsumed one.
    pub fn publish(&self, mut frame: DecodedFrame) {
        loop {
            match self.sender.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.drain.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = rejected;
                }
                // Unreachable while `drain` is alive; nothing to deliver to.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl FrameReceiver {
    /// Takes the newest frame, if one arrived since the last call.
    pub fn take_latest(&self) -> Option<DecodedFrame> {
        self.receiver.try_recv().ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// `ffmpeg` child whose stdout yields raw RGBA frames. Killed on drop.
struct FfmpegStream {
    child: Child,
    stdout: ChildStdout,
}

impl FfmpegStream {
    fn spawn(path: &Path) -> io::Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdout missing"))?;
        Ok(Self { child, stdout })
    }
}

impl Read for FfmpegStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn decode_loop<R, F>(
    open: &mut F,
    info: VideoInfo,
    looping: bool,
    cancel: &AtomicBool,
    publisher: &FramePublisher,
) -> Result<u64, VideoError>
where
    R: Read,
    F: FnMut() -> io::Result<R>,
{
    let frame_len = info.frame_len();
    let frame_duration = info.frame_duration();
    let mut index = 0u64;
    let mut deadline = Instant::now();
    'session: loop {
        let mut reader = open()?;
        let mut frames_this_pass = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                break 'session;
            }
            let mut pixels = vec![0u8; frame_len];
            match reader.read_exact(&mut pixels) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            publisher.publish(DecodedFrame {
                index,
                width: info.width,
                height: info.height,
                pixels,
            });
            index += 1;
            frames_this_pass += 1;

            deadline += frame_duration;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                deadline = now;
            }
        }
        if !looping || frames_this_pass == 0 {
            break;
        }
        tracing::debug!(frames = frames_this_pass, "video reached end; looping");
    }
    Ok(index)
}

/// One playback session: a decode worker plus the consumer mailbox half.
pub struct DecodeSession {
    info: VideoInfo,
    source: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64, VideoError>>>,
    frames: FrameReceiver,
}

impl DecodeSession {
    /// Probes `path` and starts decoding it on a worker thread.
    pub fn start(path: &Path, looping: bool) -> Result<Self, VideoError> {
        let info = probe(path)?;
        let owned = path.to_path_buf();
        tracing::info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            looping,
            "starting video playback"
        );
        let mut session = Self::spawn_with(info, looping, move || FfmpegStream::spawn(&owned))?;
        session.source = Some(path.to_path_buf());
        Ok(session)
    }

    /// Starts a worker that decodes from readers produced by `open`; called
    /// again at end of stream when looping.
    pub fn spawn_with<R, F>(info: VideoInfo, looping: bool, mut open: F) -> Result<Self, VideoError>
    where
        R: Read,
        F: FnMut() -> io::Result<R> + Send + 'static,
    {
        let (publisher, frames) = frame_mailbox();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("shadechain-decode".into())
            .spawn(move || {
                let result = decode_loop(&mut open, info, looping, &worker_cancel, &publisher);
                match &result {
                    Ok(frames) => tracing::debug!(frames, "decode worker finished"),
                    Err(err) => tracing::warn!(error = %err, "decode worker stopped"),
                }
                result
            })
            .map_err(VideoError::Thread)?;
        Ok(Self {
            info,
            source: None,
            cancel,
            handle: Some(handle),
            frames,
        })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn frames(&self) -> &FrameReceiver {
        &self.frames
    }

    /// Frames overwritten in the mailbox before the render thread took them.
    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Signals cancellation and waits for the worker to unwind. Returns the
    /// number of frames it decoded.
    pub fn stop(&mut self) -> Result<u64, VideoError> {
        self.cancel.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| VideoError::Panicked)?,
            None => Ok(0),
        }
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

struct VideoResources {
    vertex_array: VertexArrayId,
    passthrough: GraphicsProgram,
    texture: TextureId,
    texture_size: Option<(u32, u32)>,
}

/// Secondary surface that blits decoded frames to the screen.
pub struct VideoSurface {
    session: Option<DecodeSession>,
    controls: ControlHandle,
    size: (u32, u32),
    resources: Option<VideoResources>,
    frames_shown: u64,
    last_dropped: u64,
    last_drop_log: Option<Instant>,
}

impl VideoSurface {
    pub fn new(session: DecodeSession, size: (u32, u32), controls: ControlHandle) -> Self {
        Self {
            session: Some(session),
            controls,
            size: (size.0.max(1), size.1.max(1)),
            resources: None,
            frames_shown: 0,
            last_dropped: 0,
            last_drop_log: None,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width.max(1), height.max(1));
    }

    pub fn frames_shown(&self) -> u64 {
        self.frames_shown
    }

    pub fn is_playing(&self) -> bool {
        self.session.is_some()
    }

    fn initialize<G: Gpu>(&mut self, gpu: &G) -> Result<(), VideoError> {
        let vertex_array = gpu
            .create_vertex_array()
            .map_err(|reason| VideoError::CreateObject {
                object: "vertex array",
                reason,
            })?;
        let passthrough = match program::build_fragment(gpu, PASSTHROUGH_FRAGMENT) {
            Ok(program) => program,
            Err(err) => {
                gpu.delete_vertex_array(vertex_array);
                return Err(err.into());
            }
        };
        let texture = match gpu.create_texture() {
            Ok(texture) => texture,
            Err(reason) => {
                passthrough.destroy(gpu);
                gpu.delete_vertex_array(vertex_array);
                return Err(VideoError::CreateObject {
                    object: "texture",
                    reason,
                });
            }
        };
        gpu.active_texture(0);
        gpu.bind_texture(Some(texture));
        gpu.tex_parameter(TEXTURE_MIN_FILTER, LINEAR as i32);
        gpu.tex_parameter(TEXTURE_MAG_FILTER, LINEAR as i32);
        gpu.tex_parameter(TEXTURE_WRAP_S, CLAMP_TO_EDGE as i32);
        gpu.tex_parameter(TEXTURE_WRAP_T, CLAMP_TO_EDGE as i32);
        gpu.bind_texture(None);
        self.resources = Some(VideoResources {
            vertex_array,
            passthrough,
            texture,
            texture_size: None,
        });
        Ok(())
    }

    /// Uploads the newest decoded frame, if any, and draws the current one.
    pub fn render_frame<G: Gpu>(&mut self, gpu: &G) -> Result<(), VideoError> {
        if self.resources.is_none() {
            self.initialize(gpu)?;
        }
        let latest = self
            .session
            .as_ref()
            .and_then(|session| session.frames().take_latest());
        self.publish_dropped();

        let (width, height) = self.size;
        let Some(resources) = self.resources.as_mut() else {
            return Ok(());
        };
        gpu.active_texture(0);
        gpu.bind_texture(Some(resources.texture));
        if let Some(frame) = latest {
            let frame_size = (frame.width, frame.height);
            if resources.texture_size == Some(frame_size) {
                gpu.tex_sub_image_rgba(frame.width as i32, frame.height as i32, &frame.pixels);
            } else {
                gpu.tex_image_rgba(frame.width as i32, frame.height as i32, Some(&frame.pixels));
                resources.texture_size = Some(frame_size);
            }
            self.frames_shown += 1;
        }

        gpu.bind_framebuffer(None);
        gpu.viewport(0, 0, width as i32, height as i32);
        gpu.clear(BACKGROUND);
        if resources.texture_size.is_some() {
            gpu.bind_vertex_array(Some(resources.vertex_array));
            resources.passthrough.bind(gpu);
            resources.passthrough.set_sampler(gpu, "u_texture", 0);
            // Decoded rows are top-down; texture rows are bottom-up.
            resources.passthrough.set_f32(gpu, "u_flip_y", 1.0);
            gpu.draw_triangles(3);
            gpu.bind_vertex_array(None);
            gpu.use_program(None);
        }
        gpu.bind_texture(None);
        Ok(())
    }

    fn publish_dropped(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let dropped = session.dropped_frames();
        self.controls.publish_dropped_video_frames(dropped);
        if dropped == self.last_dropped {
            return;
        }
        let now = Instant::now();
        let due = self
            .last_drop_log
            .map(|last| now.duration_since(last) >= Duration::from_secs(1))
            .unwrap_or(true);
        if due {
            tracing::debug!(
                dropped,
                since_last = dropped - self.last_dropped,
                "video frames overwritten before display"
            );
            self.last_dropped = dropped;
            self.last_drop_log = Some(now);
        }
    }

    /// Cancels decoding and releases the session.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.stop() {
                Ok(frames) => tracing::info!(
                    decoded = frames,
                    shown = self.frames_shown,
                    dropped = session.dropped_frames(),
                    "video playback stopped"
                ),
                Err(err) => tracing::warn!(error = %err, "video worker ended with an error"),
            }
        }
    }

    pub fn teardown<G: Gpu>(&mut self, gpu: &G) {
        if let Some(resources) = self.resources.take() {
            gpu.delete_texture(resources.texture);
            resources.passthrough.destroy(gpu);
            gpu.delete_vertex_array(resources.vertex_array);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::fake::FakeGpu;
    use std::io::Cursor;

    fn frame(index: u64) -> DecodedFrame {
        DecodedFrame {
            index,
            width: 1,
            height: 1,
            pixels: vec![index as u8; 4],
        }
    }

    #[test]
    fn frame_rate_parsing() {
        assert!((parse_frame_rate("30/1") - 30.0).abs() < 1e-9);
        assert!((parse_frame_rate("24000/1001") - 23.976).abs() < 0.001);
        assert!((parse_frame_rate("25") - 25.0).abs() < 1e-9);
        assert!((parse_frame_rate("30/0") - DEFAULT_FPS).abs() < 1e-9);
        assert!((parse_frame_rate("0/0") - DEFAULT_FPS).abs() < 1e-9);
        assert!((parse_frame_rate("garbage") - DEFAULT_FPS).abs() < 1e-9);
    }

    #[test]
    fn slow_sources_keep_their_native_interval() {
        let info = VideoInfo {
            width: 2,
            height: 2,
            fps: parse_frame_rate("1/2"),
        };
        assert_eq!(info.frame_duration(), Duration::from_secs(2));
        let broken = VideoInfo { fps: 0.0, ..info };
        assert_eq!(
            broken.frame_duration(),
            Duration::from_secs_f64(1.0 / DEFAULT_FPS)
        );
    }

    #[test]
    fn probe_output_parsing() {
        let info = parse_probe_output("1920,1080,30000/1001\n").unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("0,1080,30/1").is_err());
    }

    #[test]
    fn probe_missing_file() {
        let err = probe(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(matches!(err, VideoError::NotFound(_)));
    }

    #[test]
    fn mailbox_keeps_only_newest_and_counts_drops() {
        let (publisher, receiver) = frame_mailbox();
        assert!(receiver.take_latest().is_none());
        for index in 0..5 {
            publisher.publish(frame(index));
        }
        assert_eq!(receiver.dropped(), 4);
        assert_eq!(receiver.take_latest().map(|frame| frame.index), Some(4));
        assert!(receiver.take_latest().is_none());

        publisher.publish(frame(5));
        assert_eq!(receiver.take_latest().map(|frame| frame.index), Some(5));
        assert_eq!(receiver.dropped(), 4);
    }

    fn fast_info() -> VideoInfo {
        VideoInfo {
            width: 1,
            height: 1,
            fps: 1000.0,
        }
    }

    #[test]
    fn worker_decodes_all_frames_and_stops_at_end() {
        let bytes: Vec<u8> = (0..3u8).flat_map(|value| [value; 4]).collect();
        let mut session =
            DecodeSession::spawn_with(fast_info(), false, move || Ok(Cursor::new(bytes.clone())))
                .unwrap();
        let decoded = session.stop_after_finish();
        assert_eq!(decoded, 3);
        let latest = session.frames().take_latest().expect("a frame is waiting");
        assert_eq!(latest.index, 2);
        assert_eq!(latest.pixels, vec![2; 4]);
        assert_eq!(session.dropped_frames(), 2);
    }

    #[test]
    fn looping_worker_honours_cancel() {
        let bytes = vec![9u8; 4];
        let mut session =
            DecodeSession::spawn_with(fast_info(), true, move || Ok(Cursor::new(bytes.clone())))
                .unwrap();
        while session.frames().take_latest().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        let decoded = session.stop().unwrap();
        assert!(decoded >= 1);
        assert!(session.is_finished());
    }

    #[test]
    fn open_failure_surfaces_from_stop() {
        let mut session = DecodeSession::spawn_with(fast_info(), false, || -> io::Result<Cursor<Vec<u8>>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such stream"))
        })
        .unwrap();
        assert!(matches!(session.stop(), Err(VideoError::Io(_))));
    }

    #[test]
    fn surface_uploads_latest_frame_flipped() {
        // Two rows: top row red, bottom row blue (top-down order).
        let info = VideoInfo {
            width: 1,
            height: 2,
            fps: 1000.0,
        };
        let bytes = vec![255, 0, 0, 255, 0, 0, 255, 255];
        let mut session =
            DecodeSession::spawn_with(info, false, move || Ok(Cursor::new(bytes.clone())))
                .unwrap();
        session.stop_after_finish();

        let gpu = FakeGpu::new();
        let controls = ControlHandle::new();
        let mut surface = VideoSurface::new(session, (1, 2), controls.clone());
        surface.render_frame(&gpu).unwrap();
        assert_eq!(surface.frames_shown(), 1);
        // Screen row 0 is the bottom row.
        assert_eq!(gpu.screen_pixel(0, 0), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(gpu.screen_pixel(0, 1), [1.0, 0.0, 0.0, 1.0]);

        // No new frame: the previous one stays on screen.
        surface.render_frame(&gpu).unwrap();
        assert_eq!(surface.frames_shown(), 1);
        assert_eq!(gpu.screen_pixel(0, 1), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(controls.dropped_video_frames(), 0);

        surface.stop();
        assert!(!surface.is_playing());
        surface.teardown(&gpu);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_programs(), 0);
    }

    impl DecodeSession {
        fn stop_after_finish(&mut self) -> u64 {
            while !self.is_finished() {
                thread::sleep(Duration::from_millis(1));
            }
            self.stop().unwrap()
        }
    }
}
