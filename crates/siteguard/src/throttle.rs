//! Cooldown gates for detection side effects.

use std::time::Duration;

use tokio::time::Instant;

/// Lets a side effect fire at most once per cooldown window.
///
/// The window is measured from the gate's own last firing, not from the
/// first detection of a burst.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    name: &'static str,
    cooldown: Duration,
    last_fired_at: Option<Instant>,
    held_until: Option<Instant>,
}

impl ThrottleGate {
    /// Create a gate that has never fired.
    #[must_use]
    pub fn new(name: &'static str, cooldown: Duration) -> Self {
        Self {
            name,
            cooldown,
            last_fired_at: None,
            held_until: None,
        }
    }

    /// Fire if the cooldown has elapsed, recording `now` as the last firing.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if !self.is_open(now) {
            return false;
        }
        self.last_fired_at = Some(now);
        self.held_until = None;
        true
    }

    /// Whether [`try_fire`](Self::try_fire) would succeed at `now`.
    #[must_use]
    pub fn is_open(&self, now: Instant) -> bool {
        if self.held_until.is_some_and(|until| now < until) {
            return false;
        }
        match self.last_fired_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
        }
    }

    /// Keep the gate closed until `until`, as instructed by the backend.
    ///
    /// Never shortens an existing hold.
    pub fn hold_until(&mut self, until: Instant) {
        if self.held_until.map_or(true, |current| until > current) {
            self.held_until = Some(until);
        }
    }

    /// Time left before the gate opens again.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        let cooldown_left = self.last_fired_at.map_or(Duration::ZERO, |last| {
            self.cooldown
                .saturating_sub(now.saturating_duration_since(last))
        });
        let hold_left = self
            .held_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
        cooldown_left.max(hold_left)
    }

    /// Gate name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured cooldown.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: Duration = Duration::from_secs(30);

    #[test]
    fn test_first_fire_is_allowed() {
        let mut gate = ThrottleGate::new("audio", C);
        assert!(gate.try_fire(Instant::now()));
    }

    #[test]
    fn test_burst_within_cooldown_fires_once() {
        let mut gate = ThrottleGate::new("audio", C);
        let start = Instant::now();

        let fired = (0..50)
            .map(|i| start + Duration::from_millis(i * 500))
            .filter(|t| gate.try_fire(*t))
            .count();

        assert_eq!(fired, 1);
    }

    #[test]
    fn test_fires_again_after_cooldown() {
        let mut gate = ThrottleGate::new("email", Duration::from_secs(60));
        let start = Instant::now();

        assert!(gate.try_fire(start));
        assert!(!gate.try_fire(start + Duration::from_secs(59)));
        assert!(gate.try_fire(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_window_keyed_on_last_fire() {
        let mut gate = ThrottleGate::new("audio", C);
        let start = Instant::now();

        assert!(gate.try_fire(start));
        assert!(gate.try_fire(start + Duration::from_secs(31)));
        // 30 s after the first detection, but only 19 s after the last fire
        assert!(!gate.try_fire(start + Duration::from_secs(50)));
        assert!(gate.try_fire(start + Duration::from_secs(61)));
    }

    #[test]
    fn test_hold_until_blocks() {
        let mut gate = ThrottleGate::new("email", Duration::from_secs(60));
        let start = Instant::now();

        gate.hold_until(start + Duration::from_secs(10));
        assert!(!gate.try_fire(start + Duration::from_secs(5)));
        assert!(gate.try_fire(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_hold_never_shortens() {
        let mut gate = ThrottleGate::new("email", Duration::from_secs(60));
        let start = Instant::now();

        gate.hold_until(start + Duration::from_secs(20));
        gate.hold_until(start + Duration::from_secs(5));
        assert!(!gate.is_open(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_remaining() {
        let mut gate = ThrottleGate::new("audio", C);
        let start = Instant::now();
        assert_eq!(gate.remaining(start), Duration::ZERO);

        gate.try_fire(start);
        assert_eq!(
            gate.remaining(start + Duration::from_secs(10)),
            Duration::from_secs(20)
        );

        gate.hold_until(start + Duration::from_secs(45));
        assert_eq!(
            gate.remaining(start + Duration::from_secs(10)),
            Duration::from_secs(35)
        );
    }

    #[test]
    fn test_gates_are_independent() {
        let mut audio = ThrottleGate::new("audio", C);
        let mut email = ThrottleGate::new("email", Duration::from_secs(60));
        let start = Instant::now();

        assert!(audio.try_fire(start));
        assert!(email.try_fire(start));
        assert!(audio.try_fire(start + C));
        assert!(!email.try_fire(start + C));
        assert_eq!(audio.name(), "audio");
        assert_eq!(email.cooldown(), Duration::from_secs(60));
    }
}
