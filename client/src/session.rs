use std::time::Duration;

use tokio::sync::mpsc;

use crate::api::{ApiClient, ApiError};
use crate::chat::{compose_outbound, ChatFeed};
use crate::player::{MediaAttachment, MediaElement, PlayerCapabilities};
use crate::protocol::{PlaybackPhase, ScheduleInfo};
use crate::realtime::{RealtimeClient, RealtimeEvent};
use crate::reconciler::{Effect, Reconciler};

/// How long an ENDING room stays open before the client leaves on its own.
const END_TIMER: Duration = Duration::from_secs(10 * 60);
const VIEWER_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub schedule_id: u64,
    pub api_url: String,
    pub ws_url: String,
    pub bearer_token: Option<String>,
}

/// Input forwarded from whatever front end drives the session.
#[derive(Debug)]
pub enum UserInput {
    Chat(String),
    /// The explicit gesture that recovers from an autoplay block.
    Resume,
    Quit,
}

/// Tracks whether this viewer is registered in the room, so leave is
/// called exactly once and only after a successful enter.
#[derive(Debug, Default)]
pub struct Presence {
    entered: bool,
    left: bool,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_entered(&mut self) {
        self.entered = true;
    }

    /// True exactly once, and never before enter succeeded.
    pub fn should_leave(&mut self) -> bool {
        if self.entered && !self.left {
            self.left = true;
            true
        } else {
            false
        }
    }
}

/// Everything the front end renders besides video and chat.
#[derive(Debug, Default)]
pub struct ViewState {
    pub banner: Option<String>,
    /// None renders as "unknown", never as zero.
    pub viewer_count: Option<u64>,
    pub autoplay_overlay: bool,
    pub connection_error: Option<String>,
}

impl ViewState {
    pub fn viewer_count_label(&self) -> String {
        match self.viewer_count {
            Some(count) => count.to_string(),
            None => "unknown".to_string(),
        }
    }

    pub fn waiting_banner(schedule: Option<&ScheduleInfo>) -> String {
        match schedule {
            Some(info) => format!(
                "{} starts at {}.",
                info.content_title,
                info.start_at.format("%H:%M")
            ),
            None => "Waiting for the show to start.".to_string(),
        }
    }

    fn set_phase_banner(&mut self, phase: PlaybackPhase, schedule: Option<&ScheduleInfo>) {
        self.banner = match phase {
            PlaybackPhase::Waiting => Some(Self::waiting_banner(schedule)),
            PlaybackPhase::Playing => None,
            PlaybackPhase::Ending => {
                Some("The movie has ended. This theater closes in 10 minutes.".to_string())
            }
            PlaybackPhase::Closed => Some("The theater has closed.".to_string()),
        };
    }
}

#[derive(Debug, Default, PartialEq)]
struct EffectOutcome {
    leave_now: bool,
    arm_end_timer: bool,
}

fn apply_effects(effects: Vec<Effect>, feed: &mut ChatFeed, view: &mut ViewState) -> EffectOutcome {
    let mut outcome = EffectOutcome::default();
    for effect in effects {
        match effect {
            Effect::SystemChat(text) => feed.push_system(text),
            Effect::ArmEndTimer => outcome.arm_end_timer = true,
            Effect::LeaveNow => outcome.leave_now = true,
            Effect::AutoplayBlocked => view.autoplay_overlay = true,
        }
    }
    outcome
}

/// One viewing session: enter, attach media, follow the realtime state,
/// leave. Owns every collaborator for its lifetime.
pub struct TheaterSession {
    config: SessionConfig,
    api: ApiClient,
    realtime: Option<RealtimeClient>,
    reconciler: Reconciler,
    feed: ChatFeed,
    view: ViewState,
    presence: Presence,
    schedule: Option<ScheduleInfo>,
}

impl TheaterSession {
    pub fn new(config: SessionConfig, player: Box<dyn MediaElement>) -> Self {
        let api = ApiClient::new(config.api_url.clone(), config.bearer_token.clone());
        let feed = ChatFeed::new(config.schedule_id);
        Self {
            config,
            api,
            realtime: None,
            reconciler: Reconciler::new(player),
            feed,
            view: ViewState::default(),
            presence: Presence::new(),
            schedule: None,
        }
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn feed(&self) -> &ChatFeed {
        &self.feed
    }

    /// Run the session to completion. Teardown happens on every exit path:
    /// the realtime connection is deactivated before the leave call.
    pub async fn run(mut self, input: mpsc::UnboundedReceiver<UserInput>) -> anyhow::Result<()> {
        // Enter first. Until it succeeds there is nothing to tear down and
        // nothing to leave.
        self.api.enter(self.config.schedule_id).await?;
        self.presence.mark_entered();
        tracing::info!(schedule_id = self.config.schedule_id, "entered theater");

        let result = self.drive(input).await;
        self.teardown().await;
        result
    }

    async fn drive(&mut self, mut input: mpsc::UnboundedReceiver<UserInput>) -> anyhow::Result<()> {
        let info = self.api.playback_info(self.config.schedule_id).await?;

        // Display only; the session survives without it.
        match self.api.schedule(self.config.schedule_id).await {
            Ok(schedule) => self.schedule = Some(schedule),
            Err(err) => tracing::warn!(%err, "schedule lookup failed"),
        }
        self.view.banner = Some(ViewState::waiting_banner(self.schedule.as_ref()));

        // Attachment strategy is decided once and never re-evaluated.
        let caps = PlayerCapabilities::default();
        let attachment = MediaAttachment::select(&info, &caps);
        tracing::info!(?attachment, asset_id = info.asset_id, "attaching media");

        let (events_tx, mut events) = mpsc::unbounded_channel();
        self.realtime = Some(RealtimeClient::spawn(
            self.config.ws_url.clone(),
            self.config.bearer_token.clone(),
            self.config.schedule_id,
            events_tx,
        ));

        let mut viewer_poll = tokio::time::interval(VIEWER_POLL_INTERVAL);
        let mut end_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.handle_realtime(event, &mut end_deadline) {
                        break;
                    }
                }
                line = input.recv() => {
                    match line {
                        Some(UserInput::Chat(text)) => {
                            if let (Some(message), Some(realtime)) =
                                (compose_outbound(&text), self.realtime.as_ref())
                            {
                                realtime.send_chat(message);
                            }
                        }
                        Some(UserInput::Resume) => {
                            if self.reconciler.resume_with_gesture() {
                                self.view.autoplay_overlay = false;
                            }
                        }
                        Some(UserInput::Quit) | None => break,
                    }
                }
                _ = viewer_poll.tick() => {
                    self.view.viewer_count =
                        match self.api.viewer_count(self.config.schedule_id).await {
                            Ok(count) => Some(count),
                            Err(err) => {
                                tracing::debug!(%err, "viewer count poll failed");
                                None
                            }
                        };
                }
                _ = sleep_until_opt(end_deadline) => {
                    tracing::info!("theater close timer elapsed, leaving");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns true when the session must end.
    fn handle_realtime(
        &mut self,
        event: RealtimeEvent,
        end_deadline: &mut Option<tokio::time::Instant>,
    ) -> bool {
        match event {
            RealtimeEvent::Snapshot(snapshot) => {
                let effects = self.reconciler.apply(&snapshot);
                let outcome = apply_effects(effects, &mut self.feed, &mut self.view);
                if let Some(phase) = self.reconciler.phase() {
                    self.view.set_phase_banner(phase, self.schedule.as_ref());
                }
                if outcome.arm_end_timer {
                    *end_deadline = Some(tokio::time::Instant::now() + END_TIMER);
                }
                outcome.leave_now
            }
            RealtimeEvent::Chat(message) => {
                tracing::info!(nickname = %message.nickname, text = %message.message, "chat");
                self.feed.push(message);
                false
            }
            RealtimeEvent::ConnectionError(detail) => {
                // Non-fatal: keep last-known playback state on screen.
                self.view.connection_error = Some(detail);
                false
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(realtime) = self.realtime.take() {
            realtime.deactivate().await;
        }
        if self.presence.should_leave() {
            if let Err(err) = self.api.leave(self.config.schedule_id).await {
                // Best-effort; the room may already be gone server-side.
                tracing::warn!(%err, "leave request failed");
            } else {
                tracing::info!(schedule_id = self.config.schedule_id, "left theater");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn leave_is_gated_on_enter_and_fires_once() {
        let mut presence = Presence::new();
        assert!(!presence.should_leave(), "never entered");

        let mut presence = Presence::new();
        presence.mark_entered();
        assert!(presence.should_leave());
        assert!(!presence.should_leave(), "leave must fire exactly once");
    }

    #[test]
    fn viewer_count_errors_render_as_unknown() {
        let mut view = ViewState::default();
        assert_eq!(view.viewer_count_label(), "unknown");
        view.viewer_count = Some(12);
        assert_eq!(view.viewer_count_label(), "12");
        view.viewer_count = None;
        assert_eq!(view.viewer_count_label(), "unknown");
    }

    #[test]
    fn waiting_banner_formats_the_start_time() {
        let schedule = ScheduleInfo {
            schedule_item_id: 1,
            content_id: 2,
            content_title: "Paris, Texas".to_string(),
            start_at: NaiveDate::from_ymd_opt(2026, 3, 1)
                .unwrap()
                .and_hms_opt(20, 30, 0)
                .unwrap(),
            end_at: NaiveDate::from_ymd_opt(2026, 3, 1)
                .unwrap()
                .and_hms_opt(23, 0, 0)
                .unwrap(),
            status: PlaybackPhase::Waiting,
        };
        assert_eq!(
            ViewState::waiting_banner(Some(&schedule)),
            "Paris, Texas starts at 20:30."
        );
        assert_eq!(
            ViewState::waiting_banner(None),
            "Waiting for the show to start."
        );
    }

    #[test]
    fn effects_fan_out_to_feed_view_and_outcome() {
        let mut feed = ChatFeed::new(5);
        let mut view = ViewState::default();
        let outcome = apply_effects(
            vec![
                Effect::SystemChat("The movie is starting.".to_string()),
                Effect::AutoplayBlocked,
            ],
            &mut feed,
            &mut view,
        );
        assert_eq!(outcome, EffectOutcome::default());
        assert!(view.autoplay_overlay);
        assert_eq!(feed.messages().len(), 1);
        assert!(feed.last().is_some_and(|m| m.is_system()));

        let outcome = apply_effects(
            vec![Effect::ArmEndTimer, Effect::LeaveNow],
            &mut feed,
            &mut view,
        );
        assert!(outcome.arm_end_timer);
        assert!(outcome.leave_now);
    }
}
