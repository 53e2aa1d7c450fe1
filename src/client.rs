//! Connection controller and public client surface
//!
//! `VisionClient` owns the single connection to the vision service, the
//! per-stream sessions, and the shared region cache. It is explicitly
//! constructed and takes its transport by injection; nothing here is a
//! process-wide singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::error::{Result, VisionError};
use crate::frame::handle::{FrameRef, SlotReleaser};
use crate::session::{DeliveryMode, SessionState, StreamSession};
use crate::shm::cache::RegionCache;
use crate::transport::{
    Intrinsics, NotificationSink, StreamProfile, VisionTransport,
};
use crate::{ClientConfig, SlotIndex, StreamId};

/// Connection-state callbacks. `on_unbind` fires only when the remote side
/// drops the connection; a local `disconnect` is silent.
pub trait BindStateListener: Send + Sync {
    fn on_bind(&self);
    fn on_unbind(&self, reason: &str);
}

pub struct VisionClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn VisionTransport>,
    cache: Arc<RegionCache>,
    connected: AtomicBool,
    sessions: Mutex<HashMap<StreamId, Arc<StreamSession>>>,
    listener: Mutex<Option<Arc<dyn BindStateListener>>>,
    releaser: Arc<dyn SlotReleaser>,
}

/// Releases slots over the control channel. Failures are logged rather than
/// surfaced - after a disconnect the producer reclaims its slots anyway.
struct SlotSender {
    transport: Arc<dyn VisionTransport>,
}

impl SlotReleaser for SlotSender {
    fn release_slot(&self, stream: StreamId, slot: SlotIndex) {
        if let Err(e) = self.transport.release_slot(stream, slot) {
            warn!("failed to release slot {} of stream {}: {}", slot, stream, e);
        }
    }
}

impl VisionClient {
    pub fn new(transport: Arc<dyn VisionTransport>, config: ClientConfig) -> Self {
        let releaser: Arc<dyn SlotReleaser> = Arc::new(SlotSender {
            transport: transport.clone(),
        });
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                cache: Arc::new(RegionCache::new()),
                connected: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                releaser,
            }),
        }
    }

    /// Connect to the service and register this client. Idempotent: when
    /// already connected, `on_bind` reports success without a new attempt.
    pub fn connect(&self, listener: Arc<dyn BindStateListener>) -> Result<()> {
        if self.inner.connected.load(Ordering::Acquire) {
            info!("connect: already connected");
            listener.on_bind();
            return Ok(());
        }
        *self.inner.listener.lock().unwrap() = Some(listener.clone());
        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.connect(Box::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_unbound(reason);
            }
        }))?;
        self.inner
            .transport
            .register_client(&self.inner.config.client_name)?;
        self.inner.connected.store(true, Ordering::Release);
        info!("connected to vision service as {}", self.inner.config.client_name);
        listener.on_bind();
        Ok(())
    }

    /// Unregister and tear the connection down. Every active session is
    /// closed, all cached mappings dropped, pending pull buffers cleared.
    pub fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            warn!("disconnect: not connected");
            return;
        }
        self.inner.teardown(true);
        if let Err(e) = self
            .inner
            .transport
            .unregister_client(&self.inner.config.client_name)
        {
            warn!("unregister client failed: {}", e);
        }
        self.inner.transport.disconnect();
        *self.inner.listener.lock().unwrap() = None;
        info!("disconnected from vision service");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Open `stream` and begin receiving frames in the given delivery mode.
    pub fn start_stream(&self, stream: StreamId, mode: DeliveryMode) -> Result<()> {
        self.ensure_connected()?;
        let session = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            if sessions.contains_key(&stream) {
                return Err(VisionError::DuplicateStream(stream));
            }
            let session = StreamSession::new(
                stream,
                mode,
                self.inner.cache.clone(),
                self.inner.releaser.clone(),
                self.inner.config.degraded_after_map_failures,
            );
            sessions.insert(stream, session.clone());
            session
        };
        let sink_session = session.clone();
        let sink: NotificationSink =
            Arc::new(move |notif| sink_session.handle_notification(notif));
        match self.inner.transport.start_image_transfer(stream, sink) {
            Ok(()) => {
                session.mark_streaming();
                Ok(())
            }
            Err(e) => {
                self.inner.sessions.lock().unwrap().remove(&stream);
                session.close();
                Err(e)
            }
        }
    }

    /// Stop `stream`: deregister the notification channel and drop every
    /// cached mapping for the stream. Stopping a stream that is not started
    /// is a no-op.
    pub fn stop_stream(&self, stream: StreamId) -> Result<()> {
        self.ensure_connected()?;
        let session = self.inner.sessions.lock().unwrap().remove(&stream);
        let Some(session) = session else {
            warn!("stop_stream: stream {} is not started", stream);
            return Ok(());
        };
        let stopped = self.inner.transport.stop_image_transfer(stream);
        session.close();
        stopped
    }

    /// The latest accepted frame for a pull-mode stream, retained for the
    /// caller. `Ok(None)` until the first frame arrives. The frame must be
    /// handed back through [`return_frame`] or its slot never recycles.
    ///
    /// [`return_frame`]: VisionClient::return_frame
    pub fn get_latest(&self, stream: StreamId) -> Result<Option<FrameRef>> {
        self.ensure_connected()?;
        let session = self.session(stream)?;
        let pool = session
            .pull_buffer()
            .ok_or(VisionError::NotBuffered(stream))?;
        Ok(pool.get_latest())
    }

    /// Return a frame obtained from [`get_latest`]. Valid even after the
    /// stream stopped or the connection dropped - the hold is still counted
    /// down so the slot flows back to the producer.
    ///
    /// [`get_latest`]: VisionClient::get_latest
    pub fn return_frame(&self, stream: StreamId, frame: &FrameRef) -> Result<()> {
        if frame.stream() != stream {
            return Err(VisionError::WrongStream {
                expected: stream,
                actual: frame.stream(),
            });
        }
        let session = self.inner.sessions.lock().unwrap().get(&stream).cloned();
        match session.and_then(|s| s.pull_buffer()) {
            Some(pool) => pool.return_frame(frame),
            None => {
                warn!("returning frame for stream {} with no active buffer", stream);
                frame.release();
                Ok(())
            }
        }
    }

    /// Calibrated intrinsics for `stream`, or `None` if the sensor has not
    /// been calibrated.
    pub fn intrinsics(&self, stream: StreamId) -> Result<Option<Intrinsics>> {
        self.ensure_connected()?;
        let intrinsics = self.inner.transport.intrinsics(stream)?;
        Ok(intrinsics.is_calibrated().then_some(intrinsics))
    }

    /// The stream profiles currently activated on the service.
    pub fn stream_profiles(&self) -> Result<Vec<StreamProfile>> {
        self.ensure_connected()?;
        self.inner.transport.stream_profiles()
    }

    /// Session state for `stream`, or `None` if no session exists.
    pub fn stream_state(&self, stream: StreamId) -> Option<SessionState> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&stream)
            .map(|s| s.state())
    }

    /// Number of live shared-memory mappings held by the region cache.
    pub fn mapped_region_count(&self) -> usize {
        self.inner.cache.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(VisionError::NotConnected)
        }
    }

    fn session(&self, stream: StreamId) -> Result<Arc<StreamSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&stream)
            .cloned()
            .ok_or(VisionError::UnknownStream(stream))
    }
}

impl ClientInner {
    /// The remote side dropped the connection: cascade to every session,
    /// then tell the listener.
    fn handle_unbound(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("vision service connection lost: {}", reason);
        self.teardown(false);
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_unbind(reason);
        }
    }

    /// Close every active session and drop all cached mappings. Stop
    /// messages are best-effort: a session that fails to stop remotely is
    /// still torn down locally.
    fn teardown(&self, send_stops: bool) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().drain().collect();
        for (stream, session) in sessions {
            if send_stops {
                if let Err(e) = self.transport.stop_image_transfer(stream) {
                    warn!("stop stream {} while disconnecting: {}", stream, e);
                }
            }
            session.close();
        }
        self.cache.invalidate_all();
    }
}
