use std::time::Instant;

use crate::protocol::PlaybackInfo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayerError {
    /// The platform refused unmuted autoplay; one user gesture recovers.
    #[error("autoplay blocked, user gesture required")]
    AutoplayBlocked,
    #[error("playback failed: {0}")]
    Failed(String),
}

/// Seam between the reconciler and whatever actually decodes video.
///
/// The reconciler drives play/pause/position/rate through this trait and
/// never touches volume on its own; volume and mute belong to the user.
pub trait MediaElement: Send {
    fn play(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self);
    fn is_playing(&self) -> bool;
    fn position_ms(&self) -> u64;
    fn set_position_ms(&mut self, position_ms: u64);
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&mut self, rate: f64);
    fn set_muted(&mut self, muted: bool);
    fn set_volume(&mut self, volume: f64);
}

/// How the media source gets attached to the element. Decided once per
/// session from the playback info and never re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAttachment {
    /// Manifest URL on a platform with built-in HLS support.
    NativeHls,
    /// Manifest URL driven through the software HLS client.
    SoftwareHls,
    /// Plain progressive media URL.
    Progressive,
}

/// What the host platform can do, probed before attachment.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerCapabilities {
    pub native_hls: bool,
}

impl MediaAttachment {
    /// Ordered capability probe: native manifest support wins over the
    /// software client, and anything that is not a manifest plays as a
    /// progressive source.
    pub fn select(info: &PlaybackInfo, caps: &PlayerCapabilities) -> Self {
        if !is_manifest(info) {
            return MediaAttachment::Progressive;
        }
        if caps.native_hls {
            MediaAttachment::NativeHls
        } else {
            MediaAttachment::SoftwareHls
        }
    }
}

fn is_manifest(info: &PlaybackInfo) -> bool {
    if info.content_type.to_ascii_lowercase().contains("mpegurl") {
        return true;
    }
    let Some(url) = info.video_url.as_deref() else {
        return false;
    };
    // Suffix check on the path only; CDN URLs carry signed query strings.
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".m3u8")
}

/// Error classes reported by the software HLS client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsErrorKind {
    Network,
    Media,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsAction {
    /// Reload the manifest and keep going.
    ReloadManifest,
    /// Attempt in-place media recovery.
    RecoverMedia,
    /// Tear the adaptive client down.
    Detach,
}

const MAX_MANIFEST_RELOADS: u32 = 3;

/// Error policy for the software HLS client: bounded manifest reloads for
/// network errors, one in-place recovery for media errors, detach for
/// anything fatal.
#[derive(Debug, Default)]
pub struct HlsSupervisor {
    manifest_reloads: u32,
    media_recovery_spent: bool,
}

impl HlsSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error(&mut self, kind: HlsErrorKind) -> HlsAction {
        match kind {
            HlsErrorKind::Network => {
                if self.manifest_reloads < MAX_MANIFEST_RELOADS {
                    self.manifest_reloads += 1;
                    tracing::warn!(
                        reload = self.manifest_reloads,
                        "hls network error, reloading manifest"
                    );
                    HlsAction::ReloadManifest
                } else {
                    tracing::error!("hls network error budget exhausted, detaching");
                    HlsAction::Detach
                }
            }
            HlsErrorKind::Media => {
                if self.media_recovery_spent {
                    tracing::error!("repeated hls media error, detaching");
                    HlsAction::Detach
                } else {
                    self.media_recovery_spent = true;
                    tracing::warn!("hls media error, attempting in-place recovery");
                    HlsAction::RecoverMedia
                }
            }
            HlsErrorKind::Fatal => HlsAction::Detach,
        }
    }

    /// Playback came back; give the budget back.
    pub fn note_recovered(&mut self) {
        self.manifest_reloads = 0;
        self.media_recovery_spent = false;
    }
}

/// Wall-clock media element used by the headless binary and the tests:
/// position advances with real time while playing, nothing is decoded.
pub struct ClockPlayer {
    playing: bool,
    base_position_ms: u64,
    resumed_at: Option<Instant>,
    rate: f64,
    muted: bool,
    volume: f64,
    autoplay_blocked: bool,
}

impl ClockPlayer {
    pub fn new() -> Self {
        Self {
            playing: false,
            base_position_ms: 0,
            resumed_at: None,
            rate: 1.0,
            muted: false,
            volume: 1.0,
            autoplay_blocked: false,
        }
    }

    /// Emulate a platform that refuses unmuted autoplay. Unmuting counts
    /// as the user gesture and lifts the block.
    pub fn with_autoplay_blocked() -> Self {
        Self {
            autoplay_blocked: true,
            ..Self::new()
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn elapsed_ms(&self) -> u64 {
        match self.resumed_at {
            Some(at) if self.playing => (at.elapsed().as_millis() as f64 * self.rate) as u64,
            _ => 0,
        }
    }
}

impl Default for ClockPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaElement for ClockPlayer {
    fn play(&mut self) -> Result<(), PlayerError> {
        if self.autoplay_blocked {
            return Err(PlayerError::AutoplayBlocked);
        }
        if !self.playing {
            self.playing = true;
            self.resumed_at = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) {
        if self.playing {
            self.base_position_ms += self.elapsed_ms();
            self.playing = false;
            self.resumed_at = None;
        }
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn position_ms(&self) -> u64 {
        self.base_position_ms + self.elapsed_ms()
    }

    fn set_position_ms(&mut self, position_ms: u64) {
        self.base_position_ms = position_ms;
        if self.playing {
            self.resumed_at = Some(Instant::now());
        }
    }

    fn playback_rate(&self) -> f64 {
        self.rate
    }

    fn set_playback_rate(&mut self, rate: f64) {
        if self.playing {
            // Fold elapsed time in at the old rate first.
            self.base_position_ms += self.elapsed_ms();
            self.resumed_at = Some(Instant::now());
        }
        self.rate = rate;
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if !muted {
            // An unmute only ever comes from a user gesture.
            self.autoplay_blocked = false;
        }
    }

    fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
    }
}
