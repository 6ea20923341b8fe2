//! # Change Listeners
//!
//! Long-lived loops that turn change notifications into broadcasts.
//!
//! Each loop owns one listener on one channel. A loop exits with an error
//! when the listener is lost, a keepalive ping fails, or a payload does not
//! decode; it exits cleanly only on cancellation. Either way it closes every
//! streamer attached to its publisher on the way out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::entities::Streamable;
use crate::stream::{Event, Publisher, StreamError, StreamResult};

/// Opens listeners on named notification channels.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn listen(&self, channel: &str) -> StreamResult<Box<dyn ChangeListener>>;
}

/// One subscription to a notification channel.
#[async_trait]
pub trait ChangeListener: Send {
    /// Next payload, or `None` once the listener connection is lost
    async fn recv(&mut self) -> Option<String>;

    /// A payload that is already buffered, without waiting
    fn try_recv(&mut self) -> StreamResult<Option<String>>;

    /// Check the listener connection is still alive
    async fn ping(&mut self) -> StreamResult<()>;
}

/// Decode a notification payload holding one event or an array of events.
pub fn decode_events<T: DeserializeOwned>(channel: &str, payload: &str) -> StreamResult<Vec<Event<T>>> {
    let decode_error = |reason: String| StreamError::Decode {
        channel: channel.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(payload).map_err(|e| decode_error(e.to_string()))?;
    let events: Vec<Event<T>> = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|e| decode_error(e.to_string()))?,
        other => vec![serde_json::from_value(other).map_err(|e| decode_error(e.to_string()))?],
    };

    for event in &events {
        event.validate().map_err(|e| decode_error(e.to_string()))?;
    }
    Ok(events)
}

fn keepalive_timer(keepalive: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Listen on `T`'s channel and broadcast every change to `publisher`.
///
/// `ready` fires once the listener is established.
pub async fn publish_loop<T: Streamable>(
    token: CancellationToken,
    source: Arc<dyn ChangeSource>,
    publisher: Arc<Publisher<T>>,
    ready: oneshot::Sender<()>,
    keepalive: Duration,
) -> StreamResult<()> {
    let result = run_publish_loop(&token, source.as_ref(), &publisher, ready, keepalive).await;
    publisher.close_all_streamers();
    result
}

async fn run_publish_loop<T: Streamable>(
    token: &CancellationToken,
    source: &dyn ChangeSource,
    publisher: &Publisher<T>,
    ready: oneshot::Sender<()>,
    keepalive: Duration,
) -> StreamResult<()> {
    let channel = T::KIND.channel();
    let mut listener = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        listener = source.listen(channel) => listener?,
    };
    let _ = ready.send(());
    info!(channel, "listening for changes");

    let mut ticker = keepalive_timer(keepalive);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(channel, "publish loop cancelled");
                return Ok(());
            }
            _ = ticker.tick() => {
                listener.ping().await?;
            }
            payload = listener.recv() => {
                let Some(payload) = payload else {
                    return Err(StreamError::ListenerClosed(channel.to_string()));
                };
                let mut events = decode_events::<T>(channel, &payload)?;
                while let Some(payload) = listener.try_recv()? {
                    events.extend(decode_events::<T>(channel, &payload)?);
                }
                let stats = publisher.broadcast(&events);
                trace!(
                    channel,
                    events = events.len(),
                    woken = stats.woken,
                    delivered = stats.delivered,
                    "broadcast changes"
                );
            }
        }
    }
}

/// Listen for permission changes and bump `boot` on each one, which makes
/// every live connection drop and reconnect with fresh scopes.
///
/// `ready` fires once the listener is established.
pub async fn permission_loop(
    token: CancellationToken,
    source: Arc<dyn ChangeSource>,
    channel: &str,
    boot: &watch::Sender<u64>,
    ready: oneshot::Sender<()>,
    keepalive: Duration,
) -> StreamResult<()> {
    let mut listener = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        listener = source.listen(channel) => listener?,
    };
    info!(channel, "listening for permission changes");
    let _ = ready.send(());

    let mut ticker = keepalive_timer(keepalive);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                listener.ping().await?;
            }
            payload = listener.recv() => {
                if payload.is_none() {
                    return Err(StreamError::ListenerClosed(channel.to_string()));
                }
                while listener.try_recv()?.is_some() {}
                boot.send_modify(|version| *version += 1);
                info!(channel, version = *boot.borrow(), "permissions changed, booting streamers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::entities::TrialMsg;

    #[test]
    fn test_decode_single_event() {
        let events = decode_events::<TrialMsg>(
            "stream_trial_chan",
            r#"{"after": {"id": 1, "experiment_id": 1, "workspace_id": 1, "seq": 3}}"#,
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].after.as_ref().map(|t| t.seq), Some(3));
    }

    #[test]
    fn test_decode_event_array() {
        let events = decode_events::<TrialMsg>(
            "stream_trial_chan",
            r#"[
                {"after": {"id": 1, "experiment_id": 1, "workspace_id": 1, "seq": 3}},
                {"before": {"id": 2, "experiment_id": 1, "workspace_id": 1, "seq": 2}, "after": null}
            ]"#,
        )
        .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].after.is_none());
    }

    #[test]
    fn test_decode_errors() {
        let err = decode_events::<TrialMsg>("stream_trial_chan", "{").unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));

        let err = decode_events::<TrialMsg>("stream_trial_chan", "{}").unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));

        let err = decode_events::<TrialMsg>("stream_trial_chan", r#"{"after": {"id": "x"}}"#)
            .unwrap_err();
        assert_eq!(err.close_code(), 4511);
    }
}
