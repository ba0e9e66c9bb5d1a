//! Per-socket state machine: Active until a close trigger fires, then
//! Draining (flush outbound, bounded), then Closed. The socket task owns
//! the socket; timers and the outbound queue are its only inputs besides
//! the client itself.

use crate::ws::close_code;
use crate::ws::dispatch::{self, SocketContext};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::{Instant, interval_at, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Outbound is given this long to flush once the socket enters Draining.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Placeholder deadline while no pong is outstanding.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainTrigger {
    ClientClose,
    LifecycleEvent,
    PongTimeout,
    Inactivity,
    TokenExpired,
    QueueClosed,
    SocketError,
}

impl DrainTrigger {
    fn close_code(self) -> u16 {
        match self {
            DrainTrigger::ClientClose
            | DrainTrigger::LifecycleEvent
            | DrainTrigger::PongTimeout
            | DrainTrigger::Inactivity
            | DrainTrigger::QueueClosed => close_code::NORMAL,
            DrainTrigger::TokenExpired => close_code::POLICY_VIOLATION,
            DrainTrigger::SocketError => close_code::INTERNAL_ERROR,
        }
    }
}

/// Drive an accepted, authenticated socket until it closes. Returns once
/// the close frame has been sent (or the peer is gone).
pub async fn run(ctx: &SocketContext, socket: WebSocket, token_exp: u64) {
    let config = ctx.state.config.clone();
    let (mut sender, mut receiver) = socket.split();

    let mut ping_timer = interval_at(
        Instant::now() + config.ping_interval(),
        config.ping_interval(),
    );
    let mut pong_deadline: Option<Instant> = None;
    let mut inactivity_deadline = Instant::now() + config.inactivity_timeout();

    let now_epoch = chrono::Utc::now().timestamp() as u64;
    let token_deadline = Instant::now() + Duration::from_secs(token_exp.saturating_sub(now_epoch));

    let trigger = loop {
        let pong_at = pong_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        inactivity_deadline = Instant::now() + config.inactivity_timeout();
                        pong_deadline = None;
                        if let Err(e) = ctx.state.sessions.touch(&ctx.session_id).await {
                            warn!(session_id = %ctx.session_id, error = %e, "Session touch failed");
                        }
                        dispatch::handle_frame(ctx, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        inactivity_deadline = Instant::now() + config.inactivity_timeout();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break DrainTrigger::SocketError;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        inactivity_deadline = Instant::now() + config.inactivity_timeout();
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        inactivity_deadline = Instant::now() + config.inactivity_timeout();
                        ctx.reply_error("invalid JSON");
                    }
                    Some(Ok(Message::Close(_))) => break DrainTrigger::ClientClose,
                    Some(Err(e)) => {
                        debug!(session_id = %ctx.session_id, error = %e, "Socket read error");
                        break DrainTrigger::SocketError;
                    }
                    None => break DrainTrigger::ClientClose,
                }
            }

            frame = ctx.queue.pop() => {
                match frame {
                    Some(frame) => {
                        let drain_after = frame.drain_after;
                        if sender.send(Message::Text(frame.payload)).await.is_err() {
                            break DrainTrigger::SocketError;
                        }
                        if drain_after {
                            break DrainTrigger::LifecycleEvent;
                        }
                    }
                    None => break DrainTrigger::QueueClosed,
                }
            }

            _ = ping_timer.tick() => {
                let ping = serde_json::json!({
                    "type": "ping",
                    "ts": chrono::Utc::now().timestamp_millis(),
                });
                if sender.send(Message::Text(ping.to_string())).await.is_err() {
                    break DrainTrigger::SocketError;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + config.pong_timeout());
                }
            }

            _ = sleep_until(pong_at) => {
                info!(session_id = %ctx.session_id, "Pong timeout");
                break DrainTrigger::PongTimeout;
            }

            _ = sleep_until(inactivity_deadline) => {
                info!(session_id = %ctx.session_id, "Inactivity timeout");
                break DrainTrigger::Inactivity;
            }

            _ = sleep_until(token_deadline) => {
                info!(session_id = %ctx.session_id, "Bearer token expired mid-connection");
                break DrainTrigger::TokenExpired;
            }
        }
    };

    debug!(
        session_id = %ctx.session_id,
        trigger = ?trigger,
        "Socket draining"
    );
    drain(ctx, &mut sender, trigger.close_code()).await;
    drop(receiver);
}

/// Draining: flush whatever is left in the outbound queue within the
/// deadline, then send the close frame.
async fn drain(ctx: &SocketContext, sender: &mut SplitSink<WebSocket, Message>, code: u16) {
    let deadline = Instant::now() + DRAIN_DEADLINE;

    while let Some(frame) = ctx.queue.try_pop() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(session_id = %ctx.session_id, "Drain deadline elapsed with frames pending");
            break;
        }
        match timeout(remaining, sender.send(Message::Text(frame.payload))).await {
            Ok(Ok(())) => {}
            _ => return,
        }
    }

    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_per_trigger() {
        assert_eq!(DrainTrigger::ClientClose.close_code(), 1000);
        assert_eq!(DrainTrigger::PongTimeout.close_code(), 1000);
        assert_eq!(DrainTrigger::Inactivity.close_code(), 1000);
        assert_eq!(DrainTrigger::LifecycleEvent.close_code(), 1000);
        assert_eq!(DrainTrigger::TokenExpired.close_code(), 1008);
        assert_eq!(DrainTrigger::SocketError.close_code(), 1011);
    }
}
