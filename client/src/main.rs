mod api;
mod chat;
mod constants;
mod player;
mod protocol;
mod realtime;
mod reconciler;
mod session;
mod stomp;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use constants::{DEFAULT_API_URL, DEFAULT_WS_URL, VERSION};
use player::ClockPlayer;
use session::{SessionConfig, TheaterSession, UserInput};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screening_client=debug,info".into()),
        )
        .init();

    let config = parse_args(std::env::args().skip(1))?;
    tracing::info!(version = VERSION, schedule_id = config.schedule_id, "starting");

    let (input_tx, input_rx) = mpsc::unbounded_channel();

    // stdin drives chat; /resume retries blocked playback, /quit leaves.
    let stdin_tx = input_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let input = match line.trim() {
                "/quit" => UserInput::Quit,
                "/resume" => UserInput::Resume,
                _ => UserInput::Chat(line),
            };
            if stdin_tx.send(input).is_err() {
                break;
            }
        }
    });

    let ctrl_c_tx = input_tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(UserInput::Quit);
        }
    });

    let session = TheaterSession::new(config, Box::new(ClockPlayer::new()));
    session.run(input_rx).await
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<SessionConfig> {
    let mut schedule_id = None;
    let mut api_url = std::env::var("SCREENING_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
    let mut ws_url = std::env::var("SCREENING_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.into());
    let mut bearer_token = std::env::var("SCREENING_TOKEN").ok();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--server" => {
                api_url = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--server needs a URL"))?;
            }
            "--ws" => {
                ws_url = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--ws needs a URL"))?;
            }
            "--token" => {
                bearer_token = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--token needs a value"))?,
                );
            }
            other if schedule_id.is_none() => {
                schedule_id = Some(other.parse::<u64>().map_err(|_| {
                    anyhow::anyhow!("schedule id must be a number, got {other:?}")
                })?);
            }
            other => anyhow::bail!("unexpected argument {other:?}"),
        }
    }

    let schedule_id = schedule_id.ok_or_else(|| {
        anyhow::anyhow!("usage: screening-client <schedule-id> [--server URL] [--ws URL] [--token TOKEN]")
    })?;

    Ok(SessionConfig {
        schedule_id,
        api_url,
        ws_url,
        bearer_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings<'a>(args: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
        args.iter().map(|s| s.to_string())
    }

    #[test]
    fn schedule_id_is_required() {
        assert!(parse_args(strings(&[])).is_err());
        assert!(parse_args(strings(&["not-a-number"])).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse_args(strings(&[
            "17",
            "--server",
            "http://example.test/api",
            "--ws",
            "ws://example.test/ws",
            "--token",
            "abc",
        ]))
        .unwrap();
        assert_eq!(config.schedule_id, 17);
        assert_eq!(config.api_url, "http://example.test/api");
        assert_eq!(config.ws_url, "ws://example.test/ws");
        assert_eq!(config.bearer_token.as_deref(), Some("abc"));
    }

    #[test]
    fn extra_positionals_are_rejected() {
        assert!(parse_args(strings(&["17", "18"])).is_err());
    }
}
