//! Per-stream session lifecycle and frame admission
//!
//! One session owns a stream end-to-end: registration, the notification
//! path, ordering/duplication checks, delivery, teardown. Push and pull
//! delivery share a single admission path; only the final hand-off differs.

use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::frame::envelope::FrameEnvelope;
use crate::frame::handle::{Frame, SlotReleaser};
use crate::frame::pool::FrameBuffer;
use crate::shm::cache::{RegionCache, RegionKey};
use crate::shm::region::RegionKind;
use crate::transport::SlotNotification;
use crate::{SlotIndex, StreamId};

/// Push-mode consumer. Called synchronously on the notification thread; the
/// frame and its payload are only guaranteed valid for the duration of the
/// call.
pub trait FrameListener: Send + Sync {
    fn on_new_frame(&self, stream: StreamId, frame: &Frame);
}

/// How accepted frames leave the session.
#[derive(Clone)]
pub enum DeliveryMode {
    /// Invoke the listener once per accepted frame.
    Push(Arc<dyn FrameListener>),
    /// Retain the latest accepted frame for `get_latest`/`return_frame`.
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Registering,
    Streaming,
}

enum Delivery {
    Push(Arc<dyn FrameListener>),
    Pull(Arc<FrameBuffer>),
}

pub(crate) struct StreamSession {
    stream: StreamId,
    cache: Arc<RegionCache>,
    releaser: Arc<dyn SlotReleaser>,
    degraded_after: u32,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    last_ordering_ts: u64,
    map_failures: u32,
    delivery: Delivery,
}

impl StreamSession {
    pub(crate) fn new(
        stream: StreamId,
        mode: DeliveryMode,
        cache: Arc<RegionCache>,
        releaser: Arc<dyn SlotReleaser>,
        degraded_after: u32,
    ) -> Arc<Self> {
        let delivery = match mode {
            DeliveryMode::Push(listener) => Delivery::Push(listener),
            DeliveryMode::Pull => Delivery::Pull(Arc::new(FrameBuffer::new(stream))),
        };
        Arc::new(Self {
            stream,
            cache,
            releaser,
            degraded_after,
            inner: Mutex::new(SessionInner {
                state: SessionState::Registering,
                last_ordering_ts: 0,
                map_failures: 0,
                delivery,
            }),
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// The notification channel is established; start admitting frames.
    pub(crate) fn mark_streaming(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SessionState::Streaming;
        info!("stream {} now streaming", self.stream);
    }

    /// The pull buffer, if the session was started in pull mode.
    pub(crate) fn pull_buffer(&self) -> Option<Arc<FrameBuffer>> {
        match &self.inner.lock().unwrap().delivery {
            Delivery::Pull(pool) => Some(pool.clone()),
            Delivery::Push(_) => None,
        }
    }

    /// Deregister: no further frames are delivered, the pull buffer drops
    /// its hold, and every cached mapping for the stream is evicted. Safe to
    /// call while a notification is in flight - the admission either
    /// completes first (and is invalidated here) or observes `Closed` and
    /// drops the frame.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Closed {
            return;
        }
        inner.state = SessionState::Closed;
        if let Delivery::Pull(pool) = &inner.delivery {
            pool.clear();
        }
        drop(inner);
        self.cache.invalidate_stream(self.stream);
        info!("stream {} closed", self.stream);
    }

    /// Admission algorithm, executed once per incoming notification on the
    /// transport's callback thread. Runs under the session lock end-to-end
    /// so two notifications for the same slot cannot race through
    /// validation. The notification's fds close on return; mappings held by
    /// the cache or an accepted frame outlive them.
    pub(crate) fn handle_notification(&self, notif: SlotNotification) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Streaming {
            debug!(
                "stream {} dropping slot {} notification in {:?} state",
                self.stream, notif.slot, inner.state
            );
            self.drop_slot(notif.slot, "not_streaming", false);
            return;
        }

        let image = self.cache.map(
            RegionKey {
                stream: self.stream,
                slot: notif.slot,
                kind: RegionKind::Image,
            },
            notif.image_fd.as_fd(),
            notif.image_len,
        );
        let meta = self.cache.map(
            RegionKey {
                stream: self.stream,
                slot: notif.slot,
                kind: RegionKind::Metadata,
            },
            notif.meta_fd.as_fd(),
            notif.meta_len,
        );
        let (Some(image), Some(meta)) = (image, meta) else {
            inner.map_failures += 1;
            if inner.map_failures == self.degraded_after {
                warn!(
                    "stream {} degraded: {} consecutive mapping failures",
                    self.stream, inner.map_failures
                );
            }
            self.drop_slot(notif.slot, "map_failure", false);
            return;
        };
        inner.map_failures = 0;

        // A malformed header right after a valid frame means the slot and
        // our cached mappings have desynchronized; evict the whole stream.
        let envelope = match FrameEnvelope::parse(meta.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "stream {} slot {}: malformed envelope ({}), clearing region cache",
                    self.stream, notif.slot, e
                );
                self.drop_slot(notif.slot, "malformed", true);
                return;
            }
        };
        if envelope.payload_len as usize > image.len() {
            warn!(
                "stream {} slot {}: payload {} exceeds mapped {} bytes, clearing region cache",
                self.stream,
                notif.slot,
                envelope.payload_len,
                image.len()
            );
            self.drop_slot(notif.slot, "malformed", true);
            return;
        }

        // A frame tagged for another stream is a stale mapping from a
        // recycled slot, not a routing error.
        if envelope.stream != self.stream {
            warn!(
                "stream {} slot {}: frame tagged for stream {}, clearing region cache",
                self.stream, notif.slot, envelope.stream
            );
            self.drop_slot(notif.slot, "stale_slot", true);
            return;
        }

        if envelope.ordering_ts > 0 && envelope.ordering_ts <= inner.last_ordering_ts {
            warn!(
                "stream {} slot {}: ts {} not after {}, clearing region cache",
                self.stream, notif.slot, envelope.ordering_ts, inner.last_ordering_ts
            );
            self.drop_slot(notif.slot, "out_of_order", true);
            return;
        }

        if envelope.ordering_ts > 0 {
            inner.last_ordering_ts = envelope.ordering_ts;
        }
        metrics::counter!("argus_frames_accepted").increment(1);
        debug!("stream {} accepted frame {}", self.stream, envelope);

        let frame = Frame::new(
            envelope,
            image,
            self.stream,
            notif.slot,
            self.releaser.clone(),
        );
        match &inner.delivery {
            Delivery::Push(listener) => {
                listener.on_new_frame(self.stream, &frame);
                frame.release();
            }
            Delivery::Pull(pool) => pool.push(frame),
        }
    }

    fn drop_slot(&self, slot: SlotIndex, reason: &'static str, invalidate: bool) {
        if invalidate {
            self.cache.invalidate_stream(self.stream);
        }
        metrics::counter!("argus_frames_dropped", "reason" => reason).increment(1);
        self.releaser.release_slot(self.stream, slot);
    }
}
