//! Argus pull-mode demo against the in-process loopback producer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use argus::transport::loopback::LoopbackTransport;
use argus::{
    BindStateListener, Config, DeliveryMode, FrameEnvelope, StreamId, VisionClient,
};
use color_eyre::Result;
use flume::bounded;
use tracing::{info, warn};

struct LogBindListener;

impl BindStateListener for LogBindListener {
    fn on_bind(&self) {
        info!("vision service bound");
    }

    fn on_unbind(&self, reason: &str) {
        warn!("vision service unbound: {}", reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("argus=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    // Load configuration
    let config = Config::load()?;
    let stream = StreamId::FISHEYE;

    // Wire the loopback service in place of the real IPC channel
    let transport = Arc::new(LoopbackTransport::new(config.producer.slot_count));
    let producer = transport.producer();
    let client = Arc::new(VisionClient::new(transport, config.client.clone()));

    client.connect(Arc::new(LogBindListener))?;
    client.start_stream(stream, DeliveryMode::Pull)?;

    // Synthetic producer: gradient frames at the configured rate
    let stop = Arc::new(AtomicBool::new(false));
    let producer_stop = stop.clone();
    let producer_cfg = config.producer.clone();
    let producer_handle = std::thread::spawn(move || {
        let frame_len = (producer_cfg.width * producer_cfg.height) as usize;
        let mut payload = vec![0u8; frame_len];
        let mut sequence: u64 = 0;
        while !producer_stop.load(Ordering::Acquire) {
            sequence += 1;
            for (i, px) in payload.iter_mut().enumerate() {
                *px = ((i as u64 + sequence) & 0xFF) as u8;
            }
            let envelope = FrameEnvelope {
                stream,
                format: producer_cfg.format,
                width: producer_cfg.width,
                height: producer_cfg.height,
                payload_len: frame_len as u32,
                platform_ts: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0),
                ordering_ts: sequence,
            };
            if let Err(e) = producer.publish(stream, &envelope, &payload) {
                warn!("publish failed: {}", e);
                break;
            }
            std::thread::sleep(Duration::from_millis(
                1000 / producer_cfg.fps.max(1) as u64,
            ));
        }
    });

    // Polling worker: pull the latest frame at the producer cadence and
    // hand a short summary to the main loop
    let (tx, rx) = bounded::<String>(8);
    let poll_client = client.clone();
    let poll_fps = config.producer.fps.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(1000 / poll_fps as u64));
        loop {
            ticker.tick().await;
            match poll_client.get_latest(stream) {
                Ok(Some(frame)) => {
                    let summary = format!(
                        "{} ({} bytes, {} holders)",
                        frame.envelope(),
                        frame.data().len(),
                        frame.ref_count()
                    );
                    if let Err(e) = poll_client.return_frame(stream, &frame) {
                        warn!("return frame: {}", e);
                    }
                    if tx.send_async(summary).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("get latest: {}", e);
                    break;
                }
            }
        }
    });

    info!(
        "streaming {} profiles={:?}",
        stream,
        client.stream_profiles().unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            summary = rx.recv_async() => match summary {
                Ok(summary) => info!("latest frame: {}", summary),
                Err(_) => break,
            },
        }
    }

    stop.store(true, Ordering::Release);
    let _ = producer_handle.join();
    client.stop_stream(stream)?;
    client.disconnect();

    info!("Argus shutting down");
    Ok(())
}
