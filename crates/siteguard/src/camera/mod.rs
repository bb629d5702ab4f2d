//! Camera display slots and stream attachment.
//!
//! A [`DisplaySlot`] is a named place where a camera is shown. What actually
//! renders the stream is a [`StreamSink`]; binding a URL is delegated to the
//! sink, which either rebinds itself or hands back the sink that should
//! replace it. Every bind gets a new generation number, so callbacks from an
//! older binding can never overwrite the state of the current one.

pub mod mjpeg;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use reqwest::{Client, Url};
use tracing::{debug, trace};

use crate::client::BackendClient;
use crate::error::Result;
use crate::status::StatusLine;

pub use mjpeg::MjpegSink;

/// Canvas used when a frame has no usable dimensions.
pub const DEFAULT_CANVAS: (u32, u32) = (640, 480);

/// Connection state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Bound, waiting for the first frame.
    Connecting,
    /// Showing frames.
    Live,
    /// The stream failed.
    Error,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Live => write!(f, "live"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug)]
struct SlotShared {
    generation: u64,
    state: StreamState,
    camera: Option<u32>,
    url: Option<Url>,
}

/// Callback handle given to a sink on bind.
///
/// Calls are ignored once the slot has been rebound or detached.
#[derive(Debug, Clone)]
pub struct SlotSignal {
    shared: Arc<Mutex<SlotShared>>,
    status: StatusLine,
    generation: u64,
}

impl SlotSignal {
    /// Whether this signal belongs to the slot's current binding.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.generation == self.generation)
            .unwrap_or(false)
    }

    /// The first frame arrived.
    pub fn ready(&self) {
        self.transition(StreamState::Live, |camera| format!("Live: camera {camera}"), |_| true);
    }

    /// The stream failed.
    pub fn error(&self, message: &str) {
        self.transition(
            StreamState::Error,
            |camera| format!("Camera {camera} unavailable: {message}"),
            |_| true,
        );
    }

    /// Neither callback fired within the fallback delay.
    pub fn fallback(&self) {
        self.transition(
            StreamState::Live,
            |camera| format!("Live: camera {camera}"),
            |state| state == StreamState::Connecting,
        );
    }

    fn transition(
        &self,
        next: StreamState,
        text: impl FnOnce(String) -> String,
        allowed: impl FnOnce(StreamState) -> bool,
    ) {
        let camera = {
            let Ok(mut shared) = self.shared.lock() else {
                return;
            };
            if shared.generation != self.generation || !allowed(shared.state) {
                return;
            }
            if shared.state == next {
                return;
            }
            shared.state = next;
            shared
                .camera
                .map_or_else(|| "?".to_string(), |c| c.to_string())
        };
        trace!(generation = self.generation, state = %next, "Slot state changed");
        self.status.set(text(camera));
    }
}

/// Something that renders a camera stream.
pub trait StreamSink: Send + std::fmt::Debug {
    /// Show `url`, reporting progress through `signal`.
    ///
    /// Returns the sink that now displays the stream: `self` when it can
    /// rebind in place, or a replacement.
    fn bind(self: Box<Self>, url: Url, signal: SlotSignal) -> Box<dyn StreamSink>;

    /// The most recent frame, if any.
    fn latest_frame(&self) -> Option<DynamicImage>;

    /// Release the stream.
    fn stop(&mut self) {}
}

/// A continuous-media placeholder that cannot show MJPEG itself.
///
/// Binding it yields an [`MjpegSink`] that takes its place.
#[derive(Debug, Clone)]
pub struct PlaceholderSink {
    http: Client,
    max_frame_bytes: usize,
}

impl PlaceholderSink {
    /// Create a placeholder whose replacement uses `http`.
    #[must_use]
    pub fn new(http: Client, max_frame_bytes: usize) -> Self {
        Self {
            http,
            max_frame_bytes,
        }
    }
}

impl StreamSink for PlaceholderSink {
    fn bind(self: Box<Self>, url: Url, signal: SlotSignal) -> Box<dyn StreamSink> {
        debug!(%url, "Replacing placeholder with MJPEG sink");
        Box::new(MjpegSink::new(self.http, self.max_frame_bytes)).bind(url, signal)
    }

    fn latest_frame(&self) -> Option<DynamicImage> {
        None
    }
}

/// A named place where one camera is shown.
#[derive(Debug)]
pub struct DisplaySlot {
    name: String,
    sink: Option<Box<dyn StreamSink>>,
    shared: Arc<Mutex<SlotShared>>,
    status: StatusLine,
}

impl DisplaySlot {
    /// Create an unbound slot.
    #[must_use]
    pub fn new(name: impl Into<String>, sink: Box<dyn StreamSink>, status: StatusLine) -> Self {
        Self {
            name: name.into(),
            sink: Some(sink),
            shared: Arc::new(Mutex::new(SlotShared {
                generation: 0,
                state: StreamState::Connecting,
                camera: None,
                url: None,
            })),
            status,
        }
    }

    /// Slot name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status line of this slot.
    #[must_use]
    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared
            .lock()
            .map(|s| s.state)
            .unwrap_or(StreamState::Error)
    }

    /// Camera of the current binding.
    #[must_use]
    pub fn camera(&self) -> Option<u32> {
        self.shared.lock().ok().and_then(|s| s.camera)
    }

    /// URL of the current binding.
    #[must_use]
    pub fn bound_url(&self) -> Option<Url> {
        self.shared.lock().ok().and_then(|s| s.url.clone())
    }

    /// Generation of the current binding.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.lock().map(|s| s.generation).unwrap_or(0)
    }

    /// Whether the slot still has a sink to bind.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Tear the slot down. Later attaches are skipped.
    pub fn detach(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.stop();
        }
        if let Ok(mut shared) = self.shared.lock() {
            shared.generation += 1;
        }
    }

    /// Snapshot the current frame.
    #[must_use]
    pub fn capture(&self, quality: u8) -> Option<Snapshot> {
        capture_frame(self.sink.as_deref(), quality)
    }

    fn begin_binding(&self, camera: u32, url: &Url) -> SlotSignal {
        let generation = self.shared.lock().map_or(0, |mut shared| {
            shared.generation += 1;
            shared.state = StreamState::Connecting;
            shared.camera = Some(camera);
            shared.url = Some(url.clone());
            shared.generation
        });
        SlotSignal {
            shared: Arc::clone(&self.shared),
            status: self.status.clone(),
            generation,
        }
    }
}

/// Binds display slots to backend camera streams.
#[derive(Debug, Clone)]
pub struct CameraAttacher {
    client: BackendClient,
    fallback: Duration,
}

impl CameraAttacher {
    /// Create an attacher resolving stream URLs through `client`.
    #[must_use]
    pub fn new(client: BackendClient, fallback: Duration) -> Self {
        Self { client, fallback }
    }

    /// Bind every slot. Without `cameras`, or past its end, slots use
    /// camera 0.
    pub fn attach(&self, slots: &mut [DisplaySlot], cameras: Option<&[u32]>) {
        for (i, slot) in slots.iter_mut().enumerate() {
            let camera = cameras.and_then(|c| c.get(i).copied()).unwrap_or(0);
            self.attach_one(slot, Some(camera));
        }
    }

    /// Bind one slot to `camera`, replacing whatever it showed.
    ///
    /// `None` means no camera is configured; the slot only gets a status.
    pub fn attach_one(&self, slot: &mut DisplaySlot, camera: Option<u32>) {
        let Some(camera) = camera else {
            slot.status.set("No camera configured");
            return;
        };
        let Some(sink) = slot.sink.take() else {
            debug!(slot = %slot.name, camera, "Slot detached, skipping attach");
            slot.status
                .set(format!("Camera view closed; camera {camera} not attached"));
            return;
        };
        let url = match self.client.video_feed_url(camera) {
            Ok(url) => url,
            Err(e) => {
                slot.sink = Some(sink);
                slot.status.set(format!("Camera {camera} unavailable: {e}"));
                return;
            }
        };

        let signal = slot.begin_binding(camera, &url);
        slot.status.set(format!("Connecting to camera {camera}..."));
        debug!(slot = %slot.name, camera, generation = signal.generation, %url, "Attaching stream");
        slot.sink = Some(sink.bind(url, signal.clone()));

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let delay = self.fallback;
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                signal.fallback();
            });
        }
    }
}

/// A JPEG snapshot of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Canvas width.
    pub width: u32,
    /// Canvas height.
    pub height: u32,
    /// Encoded JPEG bytes.
    pub jpeg: Vec<u8>,
}

impl Snapshot {
    /// The snapshot as a `data:` URL.
    #[must_use]
    pub fn to_data_url(&self) -> String {
        format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.jpeg)
        )
    }

    /// Write the JPEG bytes to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, &self.jpeg).await?;
        Ok(())
    }
}

/// Snapshot the latest frame of `sink`.
///
/// Returns `None` when there is no sink, no frame yet, or encoding fails.
#[must_use]
pub fn capture_frame(sink: Option<&dyn StreamSink>, quality: u8) -> Option<Snapshot> {
    let frame = sink?.latest_frame()?;
    encode_frame(&frame, quality)
        .map_err(|e| debug!(error = %e, "Snapshot encoding failed"))
        .ok()
}

/// Encode `frame` as JPEG, drawing it on a 640x480 canvas when its own
/// dimensions are unknown.
///
/// # Errors
///
/// Returns an image error if the JPEG encoder fails.
pub fn encode_frame(frame: &DynamicImage, quality: u8) -> Result<Snapshot> {
    let canvas = if frame.width() == 0 || frame.height() == 0 {
        RgbImage::new(DEFAULT_CANVAS.0, DEFAULT_CANVAS.1)
    } else {
        frame.to_rgb8()
    };

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode_image(&canvas)?;
    Ok(Snapshot {
        width: canvas.width(),
        height: canvas.height(),
        jpeg,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;

    /// Sink that records binds and never touches the network.
    #[derive(Debug, Default)]
    pub(crate) struct FakeSink {
        pub bound: Arc<Mutex<Vec<Url>>>,
        pub signals: Arc<Mutex<Vec<SlotSignal>>>,
        pub frame: Option<DynamicImage>,
        pub replace: bool,
    }

    impl StreamSink for FakeSink {
        fn bind(self: Box<Self>, url: Url, signal: SlotSignal) -> Box<dyn StreamSink> {
            self.bound.lock().unwrap().push(url);
            self.signals.lock().unwrap().push(signal);
            if self.replace {
                Box::new(FakeSink {
                    bound: Arc::clone(&self.bound),
                    signals: Arc::clone(&self.signals),
                    frame: self.frame.clone(),
                    replace: false,
                })
            } else {
                self
            }
        }

        fn latest_frame(&self) -> Option<DynamicImage> {
            self.frame.clone()
        }
    }

    pub(crate) fn attacher() -> CameraAttacher {
        let client = BackendClient::new(
            Url::parse("http://127.0.0.1:5000").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        CameraAttacher::new(client, Duration::from_secs(1))
    }

    fn slot(name: &str, sink: FakeSink) -> DisplaySlot {
        DisplaySlot::new(name, Box::new(sink), StatusLine::new(name))
    }

    #[test]
    fn test_attach_defaults_to_camera_zero() {
        let sink = FakeSink::default();
        let bound = Arc::clone(&sink.bound);
        let mut slots = vec![slot("a", sink)];

        attacher().attach(&mut slots, None);

        assert_eq!(slots[0].camera(), Some(0));
        assert_eq!(
            bound.lock().unwrap()[0].as_str(),
            "http://127.0.0.1:5000/video_feed/0"
        );
        assert_eq!(slots[0].state(), StreamState::Connecting);
        assert!(slots[0].status().get().contains("Connecting"));
    }

    #[test]
    fn test_attach_with_indices() {
        let mut slots = vec![
            slot("a", FakeSink::default()),
            slot("b", FakeSink::default()),
            slot("c", FakeSink::default()),
        ];

        attacher().attach(&mut slots, Some(&[3, 1]));

        assert_eq!(slots[0].camera(), Some(3));
        assert_eq!(slots[1].camera(), Some(1));
        assert_eq!(slots[2].camera(), Some(0));
    }

    #[test]
    fn test_ready_and_error_signals() {
        let sink = FakeSink::default();
        let signals = Arc::clone(&sink.signals);
        let mut s = slot("a", sink);
        attacher().attach_one(&mut s, Some(2));

        let signal = signals.lock().unwrap()[0].clone();
        signal.ready();
        assert_eq!(s.state(), StreamState::Live);
        assert_eq!(s.status().get(), "Live: camera 2");

        signal.error("connection reset");
        assert_eq!(s.state(), StreamState::Error);
        assert!(s.status().get().contains("connection reset"));
    }

    #[test]
    fn test_fallback_only_promotes_connecting() {
        let sink = FakeSink::default();
        let signals = Arc::clone(&sink.signals);
        let mut s = slot("a", sink);
        attacher().attach_one(&mut s, Some(1));

        let signal = signals.lock().unwrap()[0].clone();
        signal.error("404");
        signal.fallback();
        assert_eq!(s.state(), StreamState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_timer_marks_live() {
        let mut s = slot("a", FakeSink::default());
        attacher().attach_one(&mut s, Some(0));
        assert_eq!(s.state(), StreamState::Connecting);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(s.state(), StreamState::Live);
    }

    #[test]
    fn test_detached_slot_is_skipped() {
        let sink = FakeSink::default();
        let bound = Arc::clone(&sink.bound);
        let mut s = slot("a", sink);
        s.detach();

        attacher().attach_one(&mut s, Some(4));

        assert!(!s.is_attached());
        assert!(bound.lock().unwrap().is_empty());
        assert!(s.status().get().contains("not attached"));
    }

    #[test]
    fn test_no_camera_configured() {
        let mut s = slot("a", FakeSink::default());
        attacher().attach_one(&mut s, None);
        assert_eq!(s.status().get(), "No camera configured");
        assert_eq!(s.camera(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_reselect_last_write_wins() {
        let sink = FakeSink::default();
        let signals = Arc::clone(&sink.signals);
        let mut s = slot("a", sink);
        let attacher = attacher();

        attacher.attach_one(&mut s, Some(1));
        tokio::time::sleep(Duration::from_millis(300)).await;
        attacher.attach_one(&mut s, Some(2));

        let (first, second) = {
            let signals = signals.lock().unwrap();
            (signals[0].clone(), signals[1].clone())
        };
        assert!(!first.is_current());
        assert!(second.is_current());

        // late callbacks from the first binding change nothing
        first.ready();
        first.error("late");
        assert_eq!(s.state(), StreamState::Connecting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(s.camera(), Some(2));
        assert_eq!(
            s.bound_url().unwrap().as_str(),
            "http://127.0.0.1:5000/video_feed/2"
        );
        assert_eq!(s.state(), StreamState::Live);
        assert_eq!(s.status().get(), "Live: camera 2");
    }

    #[test]
    fn test_replacement_sink_is_kept() {
        let sink = FakeSink {
            replace: true,
            ..FakeSink::default()
        };
        let bound = Arc::clone(&sink.bound);
        let mut s = slot("a", sink);
        let attacher = attacher();

        attacher.attach_one(&mut s, Some(0));
        attacher.attach_one(&mut s, Some(1));

        assert_eq!(bound.lock().unwrap().len(), 2);
        assert!(s.is_attached());
    }

    #[test]
    fn test_other_slots_undisturbed() {
        let mut a = slot("a", FakeSink::default());
        let mut b = slot("b", FakeSink::default());
        let attacher = attacher();
        attacher.attach_one(&mut a, Some(0));
        attacher.attach_one(&mut b, Some(1));
        let b_generation = b.generation();

        attacher.attach_one(&mut a, Some(5));

        assert_eq!(b.generation(), b_generation);
        assert_eq!(b.camera(), Some(1));
    }

    #[test]
    fn test_capture_frame_without_sink() {
        assert!(capture_frame(None, 80).is_none());

        let mut s = slot("a", FakeSink::default());
        s.detach();
        assert!(s.capture(80).is_none());
    }

    #[test]
    fn test_capture_frame_without_frame() {
        let sink = FakeSink::default();
        assert!(capture_frame(Some(&sink as &dyn StreamSink), 80).is_none());
    }

    #[test]
    fn test_capture_zero_sized_frame_uses_default_canvas() {
        let sink = FakeSink {
            frame: Some(DynamicImage::new_rgb8(0, 0)),
            ..FakeSink::default()
        };
        let snapshot = capture_frame(Some(&sink as &dyn StreamSink), 80).unwrap();
        assert_eq!((snapshot.width, snapshot.height), DEFAULT_CANVAS);
        assert!(!snapshot.jpeg.is_empty());
    }

    #[test]
    fn test_capture_keeps_intrinsic_size() {
        let sink = FakeSink {
            frame: Some(DynamicImage::new_rgb8(32, 16)),
            ..FakeSink::default()
        };
        let snapshot = capture_frame(Some(&sink as &dyn StreamSink), 80).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (32, 16));
        // JPEG SOI marker
        assert_eq!(&snapshot.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_snapshot_data_url() {
        let snapshot = encode_frame(&DynamicImage::new_rgb8(4, 4), 90).unwrap();
        assert!(snapshot.to_data_url().starts_with("data:image/jpeg;base64,/9j/"));
    }

    #[tokio::test]
    async fn test_snapshot_save() {
        let snapshot = encode_frame(&DynamicImage::new_rgb8(2, 2), 80).unwrap();
        let path = std::env::temp_dir().join(format!("siteguard-{}.jpg", std::process::id()));
        snapshot.save(&path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), snapshot.jpeg);
        std::fs::remove_file(&path).unwrap();

        let err = snapshot
            .save(path.join("missing-dir").join("x.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }

    #[test]
    fn test_stream_state_display() {
        assert_eq!(StreamState::Live.to_string(), "live");
        assert_eq!(StreamState::Connecting.to_string(), "connecting");
    }
}
