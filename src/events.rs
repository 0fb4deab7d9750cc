//!
//! Search event stream
//! -------------------
//! Typed events emitted by the search engine and delivered to exactly one
//! subscriber over a bounded channel. `progress` events are droppable when
//! the subscriber is slow; `path_found`, `complete` and `error` are not.
//! The HTTP layer turns the receiving end into an SSE body, injecting a
//! `keepalive` frame after 15 seconds of silence.

use axum::response::sse::Event as SseFrame;
use futures_util::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::error::AppError;
use crate::search::merge::MergedGraph;
use crate::title::Title;

/// Per-subscriber channel depth; overflow discards `progress` only.
pub const CHANNEL_DEPTH: usize = 64;

/// Silence interval after which a `keepalive` frame is emitted.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub record_id: Option<i64>,
    pub pages_checked: u64,
    pub elapsed_ms: u64,
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start {
        start: String,
        end: String,
        max_paths: usize,
        min_diversity: f64,
    },
    Resolving {
        message: String,
    },
    Resolved {
        start: Title,
        end: Title,
    },
    Progress {
        forward_depth: u32,
        backward_depth: u32,
        pages_checked: u64,
        pages_per_second: f64,
        elapsed_ms: u64,
    },
    PathFound {
        path: Vec<Title>,
        meeting_point: Title,
        length: usize,
        index: usize,
    },
    Complete {
        paths: Vec<Vec<Title>>,
        graph: MergedGraph,
        stats: SearchStats,
    },
    Error {
        kind: String,
        message: String,
    },
    #[serde(rename = "keepalive")]
    KeepAlive,
}

impl Event {
    pub fn error(err: &AppError) -> Self {
        Event::Error {
            kind: err.kind_str().to_string(),
            message: err.message().to_string(),
        }
    }
}

/// Sending half of a request's event channel, held by the search engine.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    pub fn channel() -> (EventSink, Receiver<Event>) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        (EventSink { tx }, rx)
    }

    /// Send a critical event, waiting for channel space. Returns false when
    /// the subscriber is gone; callers treat that as cancellation.
    pub async fn send(&self, ev: Event) -> bool {
        self.tx.send(ev).await.is_ok()
    }

    /// Send a droppable event. A full channel discards it; only a closed
    /// channel returns false.
    pub fn send_progress(&self, ev: Event) -> bool {
        match self.tx.try_send(ev) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn frame(ev: &Event) -> SseFrame {
    SseFrame::default().data(serde_json::to_string(ev).unwrap_or_default())
}

/// Turn the receiving end into an SSE frame stream. Ends when the sender is
/// dropped (after `complete` or `error`); quiet spells produce `keepalive`.
pub fn sse_frames(rx: Receiver<Event>) -> impl Stream<Item = Result<SseFrame, Infallible>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        match tokio::time::timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
            Ok(Some(ev)) => Some((Ok(frame(&ev)), rx)),
            Ok(None) => None,
            Err(_) => Some((Ok(frame(&Event::KeepAlive)), rx)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_are_snake_case() {
        let ev = Event::Resolving { message: "looking up".into() };
        let v = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(v["type"], "resolving");

        let ev = Event::PathFound {
            path: vec![],
            meeting_point: Title::normalize("B").expect("title"),
            length: 2,
            index: 0,
        };
        let v = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(v["type"], "path_found");

        let v = serde_json::to_value(&Event::KeepAlive).expect("serialize");
        assert_eq!(v["type"], "keepalive");
    }

    #[test]
    fn error_event_carries_kind_and_message() {
        let ev = Event::error(&AppError::no_path("frontier exhausted"));
        let v = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(v["type"], "error");
        assert_eq!(v["kind"], "no_path");
        assert_eq!(v["message"], "frontier exhausted");
    }

    #[tokio::test]
    async fn progress_overflow_is_dropped_not_fatal() {
        let (sink, mut rx) = EventSink::channel();
        for _ in 0..(CHANNEL_DEPTH + 10) {
            let ok = sink.send_progress(Event::Progress {
                forward_depth: 1,
                backward_depth: 1,
                pages_checked: 1,
                pages_per_second: 1.0,
                elapsed_ms: 1,
            });
            assert!(ok, "overflow must not report closure");
        }
        drop(sink);
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, CHANNEL_DEPTH);
    }

    #[tokio::test]
    async fn closed_channel_reports_cancellation() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.send(Event::KeepAlive).await);
        assert!(!sink.send_progress(Event::KeepAlive));
    }
}
