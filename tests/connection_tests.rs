//! Connection lifecycle: bind, cascade teardown, reconnect queries

use std::sync::{Arc, Mutex};

use argus::transport::loopback::{LoopbackProducer, LoopbackTransport};
use argus::{
    BindStateListener, ClientConfig, DeliveryMode, DistortionModel, FrameEnvelope, Intrinsics,
    PixelFormat, StreamId, StreamProfile, VisionClient, VisionError,
};

#[derive(Default)]
struct BindRecorder {
    bound: Mutex<u32>,
    unbound: Mutex<Vec<String>>,
}

impl BindStateListener for BindRecorder {
    fn on_bind(&self) {
        *self.bound.lock().unwrap() += 1;
    }

    fn on_unbind(&self, reason: &str) {
        self.unbound.lock().unwrap().push(reason.to_owned());
    }
}

fn client_pair() -> (VisionClient, LoopbackProducer) {
    let transport = Arc::new(LoopbackTransport::new(4));
    let producer = transport.producer();
    let client = VisionClient::new(transport, ClientConfig::default());
    (client, producer)
}

fn envelope(stream: StreamId, ordering_ts: u64) -> FrameEnvelope {
    FrameEnvelope {
        stream,
        format: PixelFormat::Gray8,
        width: 4,
        height: 2,
        payload_len: 8,
        platform_ts: 100,
        ordering_ts,
    }
}

const PAYLOAD: &[u8] = &[9, 9, 9, 9, 9, 9, 9, 9];

#[test]
fn operations_require_connection() {
    let (client, _producer) = client_pair();
    assert!(matches!(
        client.start_stream(StreamId::FISHEYE, DeliveryMode::Pull),
        Err(VisionError::NotConnected)
    ));
    assert!(matches!(
        client.get_latest(StreamId::FISHEYE),
        Err(VisionError::NotConnected)
    ));
    assert!(matches!(
        client.intrinsics(StreamId::FISHEYE),
        Err(VisionError::NotConnected)
    ));
    assert!(matches!(
        client.stream_profiles(),
        Err(VisionError::NotConnected)
    ));
}

#[test]
fn connect_is_idempotent() {
    let (client, producer) = client_pair();
    let listener = Arc::new(BindRecorder::default());
    client.connect(listener.clone()).unwrap();
    client.connect(listener.clone()).unwrap();

    // The second connect reports success without re-registering.
    assert_eq!(*listener.bound.lock().unwrap(), 2);
    assert_eq!(producer.register_calls(), 1);
    assert_eq!(producer.registered_clients(), vec!["argus".to_owned()]);
    assert!(client.is_connected());
}

#[test]
fn remote_drop_cascades_to_all_sessions() {
    let (client, producer) = client_pair();
    let listener = Arc::new(BindRecorder::default());
    client.connect(listener.clone()).unwrap();

    let fisheye = StreamId::FISHEYE;
    let depth = StreamId::DEPTH;
    client.start_stream(fisheye, DeliveryMode::Pull).unwrap();
    client.start_stream(depth, DeliveryMode::Pull).unwrap();
    producer.publish(fisheye, &envelope(fisheye, 1), PAYLOAD).unwrap();
    producer.publish(depth, &envelope(depth, 1), PAYLOAD).unwrap();
    assert!(client.mapped_region_count() > 0);

    producer.drop_connection("service crashed");

    assert_eq!(
        listener.unbound.lock().unwrap().as_slice(),
        &["service crashed".to_owned()]
    );
    assert!(!client.is_connected());
    assert_eq!(client.stream_state(fisheye), None);
    assert_eq!(client.stream_state(depth), None);
    assert_eq!(client.mapped_region_count(), 0);
    assert!(matches!(
        client.get_latest(fisheye),
        Err(VisionError::NotConnected)
    ));
    assert!(matches!(
        client.get_latest(depth),
        Err(VisionError::NotConnected)
    ));
}

#[test]
fn explicit_disconnect_is_silent_and_cascades() {
    let (client, producer) = client_pair();
    let listener = Arc::new(BindRecorder::default());
    client.connect(listener.clone()).unwrap();

    let stream = StreamId::FISHEYE;
    client.start_stream(stream, DeliveryMode::Pull).unwrap();
    producer.publish(stream, &envelope(stream, 1), PAYLOAD).unwrap();

    client.disconnect();

    // A local disconnect never fires on_unbind.
    assert!(listener.unbound.lock().unwrap().is_empty());
    assert!(!client.is_connected());
    assert_eq!(client.mapped_region_count(), 0);
    assert!(!producer.is_transferring(stream));
    assert!(producer.registered_clients().is_empty());
    assert!(matches!(
        client.get_latest(stream),
        Err(VisionError::NotConnected)
    ));
}

#[test]
fn frame_held_across_stop_can_still_be_returned() {
    let (client, producer) = client_pair();
    client.connect(Arc::new(BindRecorder::default())).unwrap();

    let stream = StreamId::FISHEYE;
    client.start_stream(stream, DeliveryMode::Pull).unwrap();
    producer.publish(stream, &envelope(stream, 1), PAYLOAD).unwrap();

    let frame = client.get_latest(stream).unwrap().unwrap();
    client.stop_stream(stream).unwrap();
    assert_eq!(client.stream_state(stream), None);
    assert!(matches!(
        client.get_latest(stream),
        Err(VisionError::UnknownStream(s)) if s == stream
    ));

    // The caller's hold is still counted down after teardown.
    client.return_frame(stream, &frame).unwrap();
}

#[test]
fn stopping_an_unstarted_stream_is_a_noop() {
    let (client, _producer) = client_pair();
    client.connect(Arc::new(BindRecorder::default())).unwrap();
    client.stop_stream(StreamId::COLOR).unwrap();
}

#[test]
fn intrinsics_follow_calibration_state() {
    let (client, producer) = client_pair();
    client.connect(Arc::new(BindRecorder::default())).unwrap();

    let calibrated = Intrinsics {
        width: 640,
        height: 480,
        fx: 382.5,
        fy: 382.5,
        cx: 320.1,
        cy: 239.7,
        model: DistortionModel::KannalaBrandt4,
        coeffs: [0.01, -0.002, 0.0, 0.0, 0.0],
    };
    producer.set_intrinsics(StreamId::FISHEYE, calibrated);

    assert_eq!(client.intrinsics(StreamId::FISHEYE).unwrap(), Some(calibrated));
    // An uncalibrated sensor reports an all-zero block, surfaced as None.
    assert_eq!(client.intrinsics(StreamId::DEPTH).unwrap(), None);
}

#[test]
fn stream_profiles_reflect_the_service() {
    let (client, producer) = client_pair();
    client.connect(Arc::new(BindRecorder::default())).unwrap();

    let profiles = vec![
        StreamProfile {
            stream: StreamId::FISHEYE,
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Gray8,
        },
        StreamProfile {
            stream: StreamId::DEPTH,
            width: 320,
            height: 240,
            fps: 15,
            format: PixelFormat::Depth16,
        },
    ];
    producer.set_profiles(profiles.clone());
    assert_eq!(client.stream_profiles().unwrap(), profiles);
}
