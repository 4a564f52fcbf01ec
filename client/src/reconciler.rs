use std::time::Instant;

use crate::player::{MediaElement, PlayerError};
use crate::protocol::{PlaybackPhase, PlaybackSnapshot};

/// Slack allowed before a periodic snapshot forces the local position.
pub const PERIODIC_DRIFT_TOLERANCE_MS: u64 = 3_000;
/// Stricter slack for user-seek interception, which must feel immediate.
pub const SEEK_DRIFT_TOLERANCE_MS: u64 = 1_000;

/// Side effects a snapshot application asks the session to perform.
/// Returning them instead of performing them keeps every transition
/// observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Lifecycle notice for the chat feed.
    SystemChat(String),
    /// Start the deferred auto-leave timer. Emitted at most once.
    ArmEndTimer,
    /// Terminal: leave the room and navigate away immediately.
    LeaveNow,
    /// Unmuted autoplay was refused; show the manual-play affordance.
    AutoplayBlocked,
}

/// Last authoritative position, kept for seek interception between
/// snapshots. Extrapolates with wall time while the server says playing.
struct Authority {
    position_ms: u64,
    playing: bool,
    received_at: Instant,
}

impl Authority {
    fn expected_now_ms(&self) -> u64 {
        if self.playing {
            self.position_ms + self.received_at.elapsed().as_millis() as u64
        } else {
            self.position_ms
        }
    }
}

/// Keeps the local media element consistent with the authoritative
/// snapshot stream. Each snapshot is applied independently and
/// idempotently; phases only ever move forward.
pub struct Reconciler {
    player: Box<dyn MediaElement>,
    highest_phase: Option<PlaybackPhase>,
    end_timer_armed: bool,
    autoplay_blocked: bool,
    authority: Option<Authority>,
}

impl Reconciler {
    pub fn new(player: Box<dyn MediaElement>) -> Self {
        Self {
            player,
            highest_phase: None,
            end_timer_armed: false,
            autoplay_blocked: false,
            authority: None,
        }
    }

    pub fn phase(&self) -> Option<PlaybackPhase> {
        self.highest_phase
    }

    pub fn is_autoplay_blocked(&self) -> bool {
        self.autoplay_blocked
    }

    /// The owned element, for the user-controlled surface (volume, mute).
    pub fn media_mut(&mut self) -> &mut dyn MediaElement {
        self.player.as_mut()
    }

    /// Apply one authoritative snapshot. Returns the side effects the
    /// session must carry out.
    pub fn apply(&mut self, snapshot: &PlaybackSnapshot) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(prev) = self.highest_phase {
            if prev.is_terminal() {
                // CLOSED is sticky: nothing re-opens this session instance.
                return effects;
            }
            if snapshot.status < prev {
                tracing::debug!(?snapshot.status, ?prev, "dropping stale snapshot");
                return effects;
            }
        }

        let entered = self.highest_phase != Some(snapshot.status);
        self.authority = Some(Authority {
            position_ms: snapshot.position_ms,
            // The element is held paused outside PLAYING/ENDING, so the
            // authoritative position must not extrapolate there either.
            playing: snapshot.playing
                && snapshot.status != PlaybackPhase::Waiting
                && !snapshot.status.is_terminal(),
            received_at: Instant::now(),
        });

        match snapshot.status {
            PlaybackPhase::Waiting => {
                // Paused no matter what `playing` claims; the show has not
                // started for this room yet.
                self.player.pause();
            }
            PlaybackPhase::Playing => {
                if entered {
                    effects.push(Effect::SystemChat("The movie is starting.".to_string()));
                }
                self.reconcile_position(snapshot.position_ms);
                self.reconcile_rate();
                self.reconcile_play_state(snapshot.playing, &mut effects);
            }
            PlaybackPhase::Ending => {
                if entered {
                    effects.push(Effect::SystemChat(
                        "The movie has ended. This theater closes in 10 minutes.".to_string(),
                    ));
                }
                if !self.end_timer_armed {
                    self.end_timer_armed = true;
                    effects.push(Effect::ArmEndTimer);
                }
                self.reconcile_position(snapshot.position_ms);
                self.reconcile_rate();
                self.reconcile_play_state(snapshot.playing, &mut effects);
            }
            PlaybackPhase::Closed => {
                if entered {
                    effects.push(Effect::SystemChat("The theater has closed.".to_string()));
                }
                self.player.pause();
                effects.push(Effect::LeaveNow);
            }
        }

        self.highest_phase = Some(match self.highest_phase {
            Some(prev) => prev.max(snapshot.status),
            None => snapshot.status,
        });
        effects
    }

    /// One explicit user gesture recovers from an autoplay block:
    /// unmute, then retry play.
    pub fn resume_with_gesture(&mut self) -> bool {
        if !self.autoplay_blocked {
            return false;
        }
        self.player.set_muted(false);
        match self.player.play() {
            Ok(()) => {
                self.autoplay_blocked = false;
                true
            }
            Err(err) => {
                tracing::warn!(%err, "manual play retry failed");
                false
            }
        }
    }

    /// Seeking is not permitted; any user seek snaps back to the
    /// authoritative position unless it already is within the strict
    /// tolerance.
    pub fn intercept_seek(&mut self) {
        let Some(expected) = self.authority.as_ref().map(Authority::expected_now_ms) else {
            return;
        };
        let local = self.player.position_ms();
        if local.abs_diff(expected) > SEEK_DRIFT_TOLERANCE_MS {
            tracing::debug!(local, expected, "reverting user seek");
            self.player.set_position_ms(expected);
        }
    }

    /// Rate is pinned to 1.0; any change is reverted.
    pub fn intercept_rate(&mut self) {
        self.reconcile_rate();
    }

    fn reconcile_position(&mut self, authoritative_ms: u64) {
        let local = self.player.position_ms();
        if local.abs_diff(authoritative_ms) > PERIODIC_DRIFT_TOLERANCE_MS {
            tracing::debug!(local, authoritative_ms, "correcting playback drift");
            self.player.set_position_ms(authoritative_ms);
        }
    }

    fn reconcile_rate(&mut self) {
        if (self.player.playback_rate() - 1.0).abs() > f64::EPSILON {
            self.player.set_playback_rate(1.0);
        }
    }

    fn reconcile_play_state(&mut self, should_play: bool, effects: &mut Vec<Effect>) {
        if !should_play {
            self.player.pause();
            return;
        }
        match self.player.play() {
            Ok(()) => {}
            Err(PlayerError::AutoplayBlocked) => {
                if !self.autoplay_blocked {
                    self.autoplay_blocked = true;
                    effects.push(Effect::AutoplayBlocked);
                }
            }
            Err(err) => tracing::warn!(%err, "media element refused to play"),
        }
    }
}
