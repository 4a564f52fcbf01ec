use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Nickname reserved for client-injected lifecycle notices in the chat feed.
/// The server never produces it, so real senders cannot collide with it.
pub const SYSTEM_NICKNAME: &str = "[screening]";

/// Lifecycle stage of a screening room.
///
/// The variants are ordered: a room only ever moves forward through
/// `Waiting → Playing → Ending → Closed`, and the reconciler relies on this
/// ordering to drop stale snapshots that would regress the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackPhase {
    Waiting,
    Playing,
    Ending,
    Closed,
}

impl PlaybackPhase {
    pub fn is_terminal(self) -> bool {
        self == PlaybackPhase::Closed
    }
}

/// One authoritative playback-state push from the server.
///
/// Snapshots are not assumed ordered, gap-free, or deduplicated; each is
/// applied independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub status: PlaybackPhase,
    /// Server's play intent, carried separately from `status` for edge cases.
    pub playing: bool,
    /// Authoritative playback offset in milliseconds.
    pub position_ms: u64,
    /// Always 1.0 in this system; anything else is reverted locally.
    pub playback_rate: f64,
    /// Server wall clock at emission, reserved for latency compensation.
    pub server_time_ms: u64,
}

/// Chat broadcast received on the chat destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub schedule_id: u64,
    pub nickname: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<NaiveDateTime>,
}

impl ChatMessage {
    /// A client-side lifecycle notice, attributed to the reserved sender.
    pub fn system(schedule_id: u64, message: impl Into<String>) -> Self {
        Self {
            schedule_id,
            nickname: SYSTEM_NICKNAME.to_string(),
            message: message.into(),
            sent_at: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.nickname == SYSTEM_NICKNAME
    }
}

/// Outbound chat publication body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSend {
    pub message: String,
}

/// Playback metadata fetched once per session join. Immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    pub asset_id: u64,
    /// Direct media URL or an HLS manifest URL, distinguished by suffix.
    #[serde(default)]
    pub video_url: Option<String>,
    pub content_type: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Schedule metadata, used only for display. Not authoritative for playback.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInfo {
    pub schedule_item_id: u64,
    pub content_id: u64,
    pub content_title: String,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub status: PlaybackPhase,
}

/// Envelope every REST response is wrapped in. Both fields may be absent;
/// serde already maps missing `Option` fields to `None`, and an explicit
/// `default` would drag a `T: Default` bound into the derived impl.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub message: Option<String>,
    pub data: Option<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_one_way() {
        use PlaybackPhase::*;
        assert!(Waiting < Playing);
        assert!(Playing < Ending);
        assert!(Ending < Closed);
        assert!(Closed.is_terminal());
        assert!(!Ending.is_terminal());
    }

    #[test]
    fn snapshot_decodes_from_wire_names() {
        let json = r#"{
            "status": "PLAYING",
            "playing": true,
            "positionMs": 45000,
            "playbackRate": 1.0,
            "serverTimeMs": 1735000000000
        }"#;
        let snap: PlaybackSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.status, PlaybackPhase::Playing);
        assert!(snap.playing);
        assert_eq!(snap.position_ms, 45_000);
    }

    #[test]
    fn malformed_snapshot_is_an_error_not_a_panic() {
        assert!(serde_json::from_str::<PlaybackSnapshot>("{\"status\":\"LOST\"}").is_err());
        assert!(serde_json::from_str::<PlaybackSnapshot>("not json").is_err());
    }

    #[test]
    fn envelope_with_null_data() {
        let json = r#"{"message":"no asset attached","data":null}"#;
        let env: ApiEnvelope<PlaybackInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(env.message.as_deref(), Some("no asset attached"));
        assert!(env.data.is_none());
    }

    #[test]
    fn envelope_decodes_for_payloads_without_defaults() {
        // ScheduleInfo has no Default impl; the envelope must not need one.
        let env: ApiEnvelope<ScheduleInfo> = serde_json::from_str("{}").unwrap();
        assert!(env.message.is_none());
        assert!(env.data.is_none());
    }

    #[test]
    fn playback_info_without_url_is_decodable() {
        let json = r#"{"assetId":7,"contentType":"video/mp4"}"#;
        let info: PlaybackInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.asset_id, 7);
        assert!(info.video_url.is_none());
    }

    #[test]
    fn system_messages_use_the_reserved_sender() {
        let msg = ChatMessage::system(3, "the movie is starting");
        assert!(msg.is_system());
        let user = ChatMessage {
            schedule_id: 3,
            nickname: "mina".into(),
            message: "hi".into(),
            sent_at: None,
        };
        assert!(!user.is_system());
    }
}
