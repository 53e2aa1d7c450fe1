//! Connection and control-channel seam to the vision service
//!
//! The process-boundary transport (binding, small control messages, handle
//! passing) is an external collaborator; this crate only depends on the
//! trait below. [`loopback`] provides an in-process implementation backed by
//! real memfd regions for demos and tests.

pub mod loopback;

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::error::Result;
use crate::frame::envelope::PixelFormat;
use crate::{SlotIndex, StreamId};

/// One per-frame notification: the slot index plus shared-memory handles for
/// the image payload and the metadata region. The fds are owned and closed
/// when the notification is dropped; mappings derived from them stay valid.
#[derive(Debug)]
pub struct SlotNotification {
    pub slot: SlotIndex,
    pub image_fd: OwnedFd,
    pub image_len: usize,
    pub meta_fd: OwnedFd,
    pub meta_len: usize,
}

/// Invoked once per frame on the transport's dedicated notification thread.
/// A slow sink backpressures the producer's delivery for that stream.
pub type NotificationSink = Arc<dyn Fn(SlotNotification) + Send + Sync>;

/// Fired when the remote side terminates the connection unexpectedly.
pub type DisconnectHook = Box<dyn Fn(&str) + Send + Sync>;

/// Pinhole intrinsics for one stream, as calibrated on the device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub model: DistortionModel,
    pub coeffs: [f32; 5],
}

impl Intrinsics {
    /// An all-zero reply means the sensor has not been calibrated.
    pub fn is_calibrated(&self) -> bool {
        self.width != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistortionModel {
    #[default]
    None,
    ModifiedBrownConrady,
    KannalaBrandt4,
}

/// One activated stream profile as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamProfile {
    pub stream: StreamId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

/// The request/response IPC primitive this core is built on.
pub trait VisionTransport: Send + Sync {
    /// Establish the channel. `on_disconnect` fires if the remote side drops
    /// the connection; it is never called for a local [`disconnect`].
    ///
    /// [`disconnect`]: VisionTransport::disconnect
    fn connect(&self, on_disconnect: DisconnectHook) -> Result<()>;

    fn register_client(&self, name: &str) -> Result<()>;

    fn unregister_client(&self, name: &str) -> Result<()>;

    /// Ask the service to start pushing frame notifications for `stream`
    /// into `sink`.
    fn start_image_transfer(&self, stream: StreamId, sink: NotificationSink) -> Result<()>;

    fn stop_image_transfer(&self, stream: StreamId) -> Result<()>;

    /// Hand a slot back to the producer for reuse.
    fn release_slot(&self, stream: StreamId, slot: SlotIndex) -> Result<()>;

    fn intrinsics(&self, stream: StreamId) -> Result<Intrinsics>;

    fn stream_profiles(&self) -> Result<Vec<StreamProfile>>;

    /// Tear the channel down. Idempotent.
    fn disconnect(&self);
}
