//! In-process transport backed by memfd slots
//!
//! Stands in for the real process-boundary IPC in demos and tests. The
//! producer side writes each frame into a memfd-backed slot pair (image +
//! metadata), passes duplicated fds in the notification, and recycles a slot
//! only after the client releases it - the same slot discipline the real
//! service enforces. Notifications are delivered synchronously on the
//! producer's thread, which therefore plays the role of the dedicated IPC
//! callback thread.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use tracing::{debug, warn};

use crate::error::{Result, VisionError};
use crate::frame::envelope::{FrameEnvelope, ENVELOPE_LEN};
use crate::transport::{
    DisconnectHook, Intrinsics, NotificationSink, SlotNotification, StreamProfile,
    VisionTransport,
};
use crate::{SlotIndex, StreamId};

pub struct LoopbackTransport {
    inner: Arc<ServiceInner>,
}

/// Producer-side handle: publishes frames and simulates service failures.
pub struct LoopbackProducer {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    slot_count: usize,
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    connected: bool,
    on_disconnect: Option<DisconnectHook>,
    clients: Vec<String>,
    register_calls: usize,
    streams: HashMap<StreamId, StreamChannel>,
    profiles: Vec<StreamProfile>,
    intrinsics: HashMap<StreamId, Intrinsics>,
}

struct StreamChannel {
    sink: NotificationSink,
    slots: Vec<Option<Slot>>,
}

struct Slot {
    image: SlotFile,
    meta: SlotFile,
    in_flight: bool,
}

struct SlotFile {
    file: File,
    len: usize,
}

impl SlotFile {
    fn create(name: &str) -> io::Result<Self> {
        let name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "slot name"))?;
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(io::Error::from)?;
        Ok(Self {
            file: File::from(fd),
            len: 0,
        })
    }

    fn ensure(&mut self, len: usize) -> io::Result<()> {
        if len > self.len {
            self.file.set_len(len as u64)?;
            self.len = len;
        }
        Ok(())
    }
}

impl Slot {
    fn create(stream: StreamId, index: usize) -> io::Result<Self> {
        Ok(Self {
            image: SlotFile::create(&format!("argus-s{}-{}-image", stream, index))?,
            meta: SlotFile::create(&format!("argus-s{}-{}-meta", stream, index))?,
            in_flight: false,
        })
    }
}

impl LoopbackTransport {
    /// A fresh service with `slot_count` recyclable slots per stream.
    pub fn new(slot_count: usize) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                slot_count,
                state: Mutex::new(ServiceState::default()),
            }),
        }
    }

    pub fn producer(&self) -> LoopbackProducer {
        LoopbackProducer {
            inner: self.inner.clone(),
        }
    }
}

impl ServiceInner {
    fn ensure_connected(&self, state: &ServiceState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(VisionError::transport("service channel is down"))
        }
    }
}

impl VisionTransport for LoopbackTransport {
    fn connect(&self, on_disconnect: DisconnectHook) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.connected = true;
        state.on_disconnect = Some(on_disconnect);
        Ok(())
    }

    fn register_client(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.ensure_connected(&state)?;
        state.clients.push(name.to_owned());
        state.register_calls += 1;
        Ok(())
    }

    fn unregister_client(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.clients.retain(|c| c != name);
        Ok(())
    }

    fn start_image_transfer(&self, stream: StreamId, sink: NotificationSink) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.ensure_connected(&state)?;
        if state.streams.contains_key(&stream) {
            return Err(VisionError::transport(format!(
                "stream {} is already transferring",
                stream
            )));
        }
        let slots = (0..self.inner.slot_count).map(|_| None).collect();
        state.streams.insert(stream, StreamChannel { sink, slots });
        Ok(())
    }

    fn stop_image_transfer(&self, stream: StreamId) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.ensure_connected(&state)?;
        if state.streams.remove(&stream).is_none() {
            return Err(VisionError::transport(format!(
                "stream {} is not transferring",
                stream
            )));
        }
        Ok(())
    }

    fn release_slot(&self, stream: StreamId, slot: SlotIndex) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.ensure_connected(&state)?;
        let Some(channel) = state.streams.get_mut(&stream) else {
            // Stream already stopped; its slots were reclaimed wholesale.
            debug!("release for stopped stream {} slot {}", stream, slot);
            return Ok(());
        };
        match channel.slots.get_mut(slot as usize).and_then(Option::as_mut) {
            Some(slot) => slot.in_flight = false,
            None => warn!("release for unknown slot {} of stream {}", slot, stream),
        }
        Ok(())
    }

    fn intrinsics(&self, stream: StreamId) -> Result<Intrinsics> {
        let state = self.inner.state.lock().unwrap();
        self.inner.ensure_connected(&state)?;
        Ok(state.intrinsics.get(&stream).copied().unwrap_or_default())
    }

    fn stream_profiles(&self) -> Result<Vec<StreamProfile>> {
        let state = self.inner.state.lock().unwrap();
        self.inner.ensure_connected(&state)?;
        Ok(state.profiles.clone())
    }

    fn disconnect(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.connected = false;
        state.on_disconnect = None;
        state.streams.clear();
        state.clients.clear();
    }
}

impl LoopbackProducer {
    /// Write one frame into a free slot of `stream` and deliver the
    /// notification. Returns the slot used, or `None` when the stream has no
    /// listener or every slot is still in flight (the frame is dropped, as
    /// the real producer drops when the consumer falls behind).
    pub fn publish(
        &self,
        stream: StreamId,
        envelope: &FrameEnvelope,
        payload: &[u8],
    ) -> io::Result<Option<SlotIndex>> {
        self.publish_raw(stream, &envelope.encode(), payload)
    }

    /// Like [`publish`] but with caller-supplied metadata bytes, so tests
    /// can deliver truncated or mistagged envelopes.
    ///
    /// [`publish`]: LoopbackProducer::publish
    pub fn publish_raw(
        &self,
        stream: StreamId,
        meta: &[u8],
        payload: &[u8],
    ) -> io::Result<Option<SlotIndex>> {
        let (sink, notif, index) = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(channel) = state.streams.get_mut(&stream) else {
                debug!("publish on stream {} with no listener", stream);
                return Ok(None);
            };
            let free = channel
                .slots
                .iter()
                .position(|s| !matches!(s, Some(slot) if slot.in_flight));
            let Some(index) = free else {
                debug!("stream {} has no free slot, dropping frame", stream);
                return Ok(None);
            };
            let mut slot = match channel.slots[index].take() {
                Some(slot) => slot,
                None => Slot::create(stream, index)?,
            };
            slot.image.ensure(payload.len().max(1))?;
            slot.meta.ensure(meta.len().max(ENVELOPE_LEN))?;
            slot.image.file.write_all_at(payload, 0)?;
            slot.meta.file.write_all_at(meta, 0)?;
            slot.in_flight = true;
            let notif = SlotNotification {
                slot: index as SlotIndex,
                image_fd: OwnedFd::from(slot.image.file.try_clone()?),
                image_len: payload.len().max(1),
                meta_fd: OwnedFd::from(slot.meta.file.try_clone()?),
                meta_len: meta.len().max(1),
            };
            channel.slots[index] = Some(slot);
            (channel.sink.clone(), notif, index as SlotIndex)
        };
        // Deliver outside the lock: the admission path re-enters the service
        // through release_slot.
        sink(notif);
        Ok(Some(index))
    }

    /// Simulate the remote side dying: all service state is gone and the
    /// client's disconnect hook fires.
    pub fn drop_connection(&self, reason: &str) {
        let hook = {
            let mut state = self.inner.state.lock().unwrap();
            state.connected = false;
            state.streams.clear();
            state.clients.clear();
            state.on_disconnect.take()
        };
        if let Some(hook) = hook {
            hook(reason);
        }
    }

    pub fn set_intrinsics(&self, stream: StreamId, intrinsics: Intrinsics) {
        self.inner
            .state
            .lock()
            .unwrap()
            .intrinsics
            .insert(stream, intrinsics);
    }

    pub fn set_profiles(&self, profiles: Vec<StreamProfile>) {
        self.inner.state.lock().unwrap().profiles = profiles;
    }

    /// Slots of `stream` currently held by the client.
    pub fn in_flight(&self, stream: StreamId) -> usize {
        let state = self.inner.state.lock().unwrap();
        state
            .streams
            .get(&stream)
            .map(|channel| {
                channel
                    .slots
                    .iter()
                    .filter(|s| matches!(s, Some(slot) if slot.in_flight))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_transferring(&self, stream: StreamId) -> bool {
        self.inner.state.lock().unwrap().streams.contains_key(&stream)
    }

    pub fn registered_clients(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().clients.clone()
    }

    pub fn register_calls(&self) -> usize {
        self.inner.state.lock().unwrap().register_calls
    }
}
