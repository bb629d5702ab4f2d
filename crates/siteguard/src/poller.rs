//! Detection pollers.
//!
//! One [`DetectionPoller`] runs per detection domain. After a settle delay
//! that gives the camera time to start, it checks the selected camera on a
//! fixed interval, presents an alert for every positive detection, and
//! throttles the alarm sound and the alert email with independent gates.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::{CameraAttacher, DisplaySlot};
use crate::client::{DetectionBackend, MAX_RETRY_AFTER};
use crate::config::Config;
use crate::detection::{interpret, Detection, Domain, Verdict};
use crate::error::Result;
use crate::presenter::AlertPresenter;
use crate::status::StatusLine;
use crate::throttle::ThrottleGate;

/// Lifecycle of a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Not running.
    Idle,
    /// Waiting for the camera to settle.
    CameraStarting,
    /// Checking on every interval.
    Polling,
}

/// Timing and side-effect settings of a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    /// Wait before the first check.
    pub settle_delay: Duration,
    /// Time between checks.
    pub poll_interval: Duration,
    /// Alarm sound cooldown.
    pub audio_cooldown: Duration,
    /// Alert email cooldown.
    pub email_cooldown: Duration,
    /// Whether detections request an email at all.
    pub email_enabled: bool,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PollerSettings {
    /// Read the poller section of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            poll_interval: config.poll_interval(),
            audio_cooldown: config.audio_cooldown(),
            email_cooldown: config.email_cooldown(),
            email_enabled: config.poller.email_enabled,
        }
    }
}

/// Changes the camera of a running poller from elsewhere.
#[derive(Debug, Clone)]
pub struct CameraSelector {
    domain: Domain,
    tx: Arc<watch::Sender<Option<u32>>>,
}

impl CameraSelector {
    /// Domain of the poller this selector drives.
    #[must_use]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Select `camera`. The last selection wins.
    pub fn select(&self, camera: Option<u32>) {
        self.tx.send_replace(camera);
    }
}

/// Polls one detection domain.
#[derive(Debug)]
pub struct DetectionPoller {
    domain: Domain,
    backend: Arc<dyn DetectionBackend>,
    presenter: AlertPresenter,
    settings: PollerSettings,
    audio_gate: ThrottleGate,
    email_gate: ThrottleGate,
    status: StatusLine,
    selection: Arc<watch::Sender<Option<u32>>>,
    camera: watch::Receiver<Option<u32>>,
    view: Option<(DisplaySlot, CameraAttacher)>,
    state: PollerState,
}

impl DetectionPoller {
    /// Create an idle poller watching camera 0.
    #[must_use]
    pub fn new(
        domain: Domain,
        backend: Arc<dyn DetectionBackend>,
        presenter: AlertPresenter,
        settings: PollerSettings,
    ) -> Self {
        let (tx, camera) = watch::channel(Some(0));
        Self {
            domain,
            backend,
            presenter,
            audio_gate: ThrottleGate::new("audio", settings.audio_cooldown),
            email_gate: ThrottleGate::new("email", settings.email_cooldown),
            settings,
            status: StatusLine::new(domain.as_str()),
            selection: Arc::new(tx),
            camera,
            view: None,
            state: PollerState::Idle,
        }
    }

    /// Start with `camera` selected. `None` means no camera is configured.
    #[must_use]
    pub fn with_camera(self, camera: Option<u32>) -> Self {
        self.selection.send_replace(camera);
        self
    }

    /// Show the selected camera in `slot` while polling.
    #[must_use]
    pub fn with_view(mut self, slot: DisplaySlot, attacher: CameraAttacher) -> Self {
        self.view = Some((slot, attacher));
        self
    }

    /// Domain being polled.
    #[must_use]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Status line of this poller.
    #[must_use]
    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Currently selected camera.
    #[must_use]
    pub fn camera(&self) -> Option<u32> {
        *self.camera.borrow()
    }

    /// The display slot, if one was given.
    #[must_use]
    pub fn view(&self) -> Option<&DisplaySlot> {
        self.view.as_ref().map(|(slot, _)| slot)
    }

    /// Gate throttling the alarm sound.
    #[must_use]
    pub fn audio_gate(&self) -> &ThrottleGate {
        &self.audio_gate
    }

    /// Gate throttling the alert email.
    #[must_use]
    pub fn email_gate(&self) -> &ThrottleGate {
        &self.email_gate
    }

    /// A handle for changing the camera while [`run`](Self::run) is active.
    #[must_use]
    pub fn selector(&self) -> CameraSelector {
        CameraSelector {
            domain: self.domain,
            tx: Arc::clone(&self.selection),
        }
    }

    /// Select `camera` and rebind this poller's display slot.
    pub fn select_camera(&mut self, camera: Option<u32>) {
        self.selection.send_replace(camera);
        self.rebind();
    }

    /// Poll until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        self.state = PollerState::CameraStarting;
        self.status.set("Starting camera...");
        self.rebind();
        info!(domain = %self.domain, camera = ?self.camera(), "Poller starting");

        let settled = tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.settings.settle_delay) => true,
        };

        if settled {
            self.state = PollerState::Polling;
            let period = self.settings.poll_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = self.camera.changed() => {
                        if changed.is_ok() {
                            self.rebind();
                        }
                    }
                    _ = interval.tick() => {
                        // failures already reported on the status line
                        let _ = self.tick(Instant::now()).await;
                    }
                }
            }
        }

        if let Some((slot, _)) = &mut self.view {
            slot.detach();
        }
        self.state = PollerState::Idle;
        self.status.set("Stopped");
        info!(domain = %self.domain, "Poller stopped");
    }

    /// Run one check at `now`.
    ///
    /// Returns `Ok(None)` when no camera is selected.
    ///
    /// # Errors
    ///
    /// Returns the backend error when the check itself failed. The status
    /// line is updated either way.
    pub async fn tick(&mut self, now: Instant) -> Result<Option<Verdict>> {
        let Some(camera) = self.camera() else {
            self.status.set("No camera configured");
            return Ok(None);
        };

        let body = match self.backend.check(self.domain, camera).await {
            Ok(body) => body,
            Err(e) => {
                warn!(domain = %self.domain, camera, error = %e, "Detection check failed");
                self.status.set(format!("Check failed: {e}"));
                return Err(e);
            }
        };

        let verdict = interpret(self.domain, &body);
        self.status.set(verdict.status());
        if let Verdict::Detected { detection, .. } = &verdict {
            self.on_detection(camera, detection, now).await;
        }
        Ok(Some(verdict))
    }

    async fn on_detection(&mut self, camera: u32, detection: &Detection, now: Instant) {
        self.presenter.present(detection.alert.clone());

        if self.audio_gate.try_fire(now) {
            self.presenter.sound_alarm();
        }

        if !self.settings.email_enabled || !self.email_gate.try_fire(now) {
            return;
        }

        let mut payload = detection.email.clone();
        payload.insert("camera_index".to_string(), json!(camera));
        match self
            .backend
            .send_alert_email(self.domain, Value::Object(payload))
            .await
        {
            Ok(receipt) => {
                let hold = receipt
                    .retry_after
                    .map(|wait| wait.min(MAX_RETRY_AFTER))
                    .and_then(|wait| now.checked_add(wait).map(|until| (wait, until)));
                if let Some((wait, until)) = hold {
                    self.email_gate.hold_until(until);
                    debug!(domain = %self.domain, wait_secs = wait.as_secs(), "Email gate held by backend");
                }
                if receipt.ok {
                    info!(domain = %self.domain, camera, "Alert email sent");
                } else {
                    debug!(
                        domain = %self.domain,
                        reason = receipt.reason.as_deref().unwrap_or("unspecified"),
                        "Alert email not sent"
                    );
                }
            }
            Err(e) => warn!(domain = %self.domain, error = %e, "Alert email request failed"),
        }
    }

    fn rebind(&mut self) {
        let camera = *self.camera.borrow_and_update();
        if let Some((slot, attacher)) = &mut self.view {
            attacher.attach_one(slot, camera);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::camera::tests::{attacher, FakeSink};
    use crate::client::EmailReceipt;
    use crate::error::Error;
    use crate::logging::init_test_logging;
    use crate::presenter::tests::RecordingLayer;
    use crate::presenter::AlertLayer;
    use crate::tone::ToneCue;

    #[derive(Debug, Default)]
    struct FakeBackend {
        script: Mutex<VecDeque<Result<Value>>>,
        repeat: Value,
        receipt: EmailReceipt,
        checks: Mutex<Vec<(Domain, u32)>>,
        emails: Mutex<Vec<(Domain, Value)>>,
    }

    impl FakeBackend {
        fn repeating(body: Value) -> Self {
            Self {
                repeat: body,
                ..Self::default()
            }
        }

        fn email_count(&self) -> usize {
            self.emails.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DetectionBackend for FakeBackend {
        async fn check(&self, domain: Domain, camera_index: u32) -> Result<Value> {
            self.checks.lock().unwrap().push((domain, camera_index));
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.repeat.clone()))
        }

        async fn send_alert_email(&self, domain: Domain, payload: Value) -> Result<EmailReceipt> {
            self.emails.lock().unwrap().push((domain, payload));
            Ok(self.receipt.clone())
        }
    }

    struct Harness {
        layer: Arc<RecordingLayer>,
        backend: Arc<FakeBackend>,
        poller: DetectionPoller,
    }

    fn harness(domain: Domain, backend: FakeBackend) -> Harness {
        init_test_logging();
        let layer = Arc::new(RecordingLayer::default());
        let backend = Arc::new(backend);
        let presenter = AlertPresenter::new(
            Arc::clone(&layer) as Arc<dyn AlertLayer>,
            Some(ToneCue::silent()),
            Duration::from_millis(4_200),
        );
        let poller = DetectionPoller::new(
            domain,
            Arc::clone(&backend) as Arc<dyn DetectionBackend>,
            presenter,
            PollerSettings::default(),
        );
        Harness {
            layer,
            backend,
            poller,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_smoke_alerts_and_emails() {
        let mut h = harness(
            Domain::Smoking,
            FakeBackend::repeating(json!({
                "ok": true,
                "fire_detected": true,
                "smoke_detected": true,
                "fire_confidence": 0.91,
                "smoke_confidence": 0.84
            })),
        );
        let now = Instant::now();

        let verdict = h.poller.tick(now).await.unwrap().unwrap();

        assert!(verdict.is_detection());
        assert!(h.poller.status().get().starts_with("CRITICAL"));
        assert_eq!(h.layer.titles(), vec!["Fire and Smoke Detected"]);
        let emails = h.backend.emails.lock().unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].0, Domain::Smoking);
        assert_eq!(emails[0].1["detection_type"], "fire_and_smoke");
        assert_eq!(emails[0].1["camera_index"], 0);
        assert!(!h.poller.audio_gate().is_open(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_face_leaves_gates_untouched() {
        let mut h = harness(
            Domain::Unauthorized,
            FakeBackend::repeating(json!({"ok": true, "unauthorized": true, "reason": "no_face"})),
        );
        let now = Instant::now();

        let verdict = h.poller.tick(now).await.unwrap().unwrap();

        assert!(!verdict.is_detection());
        assert!(h.poller.status().get().contains("no face"));
        assert!(h.layer.titles().is_empty());
        assert_eq!(h.backend.email_count(), 0);
        assert!(h.poller.audio_gate().is_open(now));
        assert!(h.poller.email_gate().is_open(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_side_effects_once_per_cooldown() {
        let mut h = harness(
            Domain::Ppe,
            FakeBackend::repeating(json!({"ok": true, "violation": true, "confidence": 0.2})),
        );
        let start = Instant::now();

        for i in 0..30u64 {
            h.poller.tick(start + Duration::from_secs(2 * i)).await.unwrap();
        }

        // every detection is presented, emails at 0s and 60s only
        assert_eq!(h.layer.titles().len(), 30);
        assert_eq!(h.backend.email_count(), 1);
        h.poller.tick(start + Duration::from_secs(60)).await.unwrap();
        assert_eq!(h.backend.email_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_errors_only_update_status() {
        let backend = FakeBackend::repeating(json!({"ok": false, "error": "model_not_loaded"}));
        backend
            .script
            .lock()
            .unwrap()
            .push_back(Ok(json!({"ok": false, "error": "camera_not_available"})));
        let mut h = harness(Domain::Restricted, backend);
        let now = Instant::now();

        h.poller.tick(now).await.unwrap();
        assert!(h.poller.status().get().contains("Camera not available"));
        h.poller.tick(now).await.unwrap();
        assert!(h.poller.status().get().contains("model not loaded"));

        assert!(h.layer.titles().is_empty());
        assert_eq!(h.backend.email_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_reports_status() {
        let backend = FakeBackend::repeating(json!({"ok": true, "intruder": false}));
        backend.script.lock().unwrap().push_back(Err(Error::HttpStatus {
            url: "http://backend/api/demo/restricted/check".to_string(),
            status: 502,
        }));
        let mut h = harness(Domain::Restricted, backend);

        let err = h.poller.tick(Instant::now()).await.unwrap_err();
        assert_eq!(err.http_status(), Some(502));
        assert!(h.poller.status().get().starts_with("Check failed"));

        h.poller.tick(Instant::now()).await.unwrap();
        assert_eq!(h.poller.status().get(), "Restricted area clear");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_retry_after_holds_email_gate() {
        let backend = FakeBackend {
            receipt: EmailReceipt {
                ok: false,
                reason: Some("rate_limited".to_string()),
                retry_after: Some(Duration::from_secs(120)),
                ..EmailReceipt::default()
            },
            ..FakeBackend::repeating(json!({"ok": true, "intruder": true}))
        };
        let mut h = harness(Domain::Restricted, backend);
        let start = Instant::now();

        h.poller.tick(start).await.unwrap();
        h.poller.tick(start + Duration::from_secs(60)).await.unwrap();
        assert_eq!(h.backend.email_count(), 1);

        h.poller.tick(start + Duration::from_secs(120)).await.unwrap();
        assert_eq!(h.backend.email_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_retry_after_is_capped() {
        let backend = FakeBackend {
            receipt: EmailReceipt {
                retry_after: Some(Duration::from_secs(u64::MAX)),
                ..EmailReceipt::default()
            },
            ..FakeBackend::repeating(json!({"ok": true, "intruder": true}))
        };
        let mut h = harness(Domain::Restricted, backend);
        let start = Instant::now();

        h.poller.tick(start).await.unwrap();
        h.poller.tick(start + Duration::from_secs(600)).await.unwrap();
        assert_eq!(h.backend.email_count(), 1);

        h.poller.tick(start + MAX_RETRY_AFTER).await.unwrap();
        assert_eq!(h.backend.email_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refusal_without_retry_after_keeps_cooldown() {
        let backend = FakeBackend {
            receipt: EmailReceipt {
                ok: false,
                reason: Some("cooldown".to_string()),
                ..EmailReceipt::default()
            },
            ..FakeBackend::repeating(json!({"ok": true, "intruder": true}))
        };
        let mut h = harness(Domain::Restricted, backend);
        let start = Instant::now();

        h.poller.tick(start).await.unwrap();
        h.poller.tick(start + Duration::from_secs(60)).await.unwrap();
        assert_eq!(h.backend.email_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_email_disabled() {
        let mut h = harness(
            Domain::Restricted,
            FakeBackend::repeating(json!({"ok": true, "intruder": true})),
        );
        h.poller.settings.email_enabled = false;

        h.poller.tick(Instant::now()).await.unwrap();
        assert_eq!(h.layer.titles().len(), 1);
        assert_eq!(h.backend.email_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_camera_configured() {
        let h = harness(Domain::Ppe, FakeBackend::default());
        let mut poller = h.poller.with_camera(None);

        assert!(poller.tick(Instant::now()).await.unwrap().is_none());
        assert_eq!(poller.status().get(), "No camera configured");
        assert!(h.backend.checks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_camera_rebinds_own_slot() {
        let h = harness(
            Domain::Ppe,
            FakeBackend::repeating(json!({"ok": true, "violation": false})),
        );
        let slot = DisplaySlot::new("ppe", Box::new(FakeSink::default()), StatusLine::new("ppe-cam"));
        let mut poller = h.poller.with_view(slot, attacher());

        poller.select_camera(Some(3));
        assert_eq!(poller.view().unwrap().camera(), Some(3));

        poller.tick(Instant::now()).await.unwrap();
        assert_eq!(h.backend.checks.lock().unwrap()[0], (Domain::Ppe, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_settles_then_polls_until_cancelled() {
        let h = harness(
            Domain::Ppe,
            FakeBackend::repeating(json!({"ok": true, "violation": false, "confidence": 0.9})),
        );
        let slot = DisplaySlot::new("ppe", Box::new(FakeSink::default()), StatusLine::new("ppe-cam"));
        let mut poller = h.poller.with_camera(Some(1)).with_view(slot, attacher());
        let selector = poller.selector();
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                poller.run(cancel).await;
                poller
            })
        };

        // settle 3 s, then checks at 5 s, 7 s, 9 s
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(h.backend.checks.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(7_000)).await;
        assert_eq!(h.backend.checks.lock().unwrap().len(), 3);

        selector.select(Some(4));
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(h.backend.checks.lock().unwrap().last(), Some(&(Domain::Ppe, 4)));

        cancel.cancel();
        let poller = task.await.unwrap();
        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(poller.status().get(), "Stopped");
        assert!(!poller.view().unwrap().is_attached());
        assert_eq!(selector.domain(), Domain::Ppe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_settle() {
        let h = harness(Domain::Ppe, FakeBackend::default());
        let mut poller = h.poller;
        let cancel = CancellationToken::new();
        cancel.cancel();

        poller.run(cancel).await;

        assert_eq!(poller.state(), PollerState::Idle);
        assert!(h.backend.checks.lock().unwrap().is_empty());
    }
}
