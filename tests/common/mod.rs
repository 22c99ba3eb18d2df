//! Shared test utilities

use std::sync::Arc;
use std::time::Duration;

use buddy_gateway::StaticProfiles;
use buddy_gateway::audio::samples_to_pcm;
use buddy_gateway::config::Config;
use buddy_gateway::providers::ProviderSet;
use buddy_gateway::recorder::{Recorder, RecorderEvent};
use buddy_gateway::session::{Outbound, SessionManager};
use tokio::sync::mpsc;

/// One 20ms frame of loud constant-amplitude "speech" (16kHz s16le)
#[must_use]
pub fn speech_frame() -> Vec<u8> {
    samples_to_pcm(&vec![3000i16; 320])
}

/// One 20ms frame of silence
#[must_use]
pub fn silence_frame() -> Vec<u8> {
    vec![0u8; 640]
}

/// Build a manager around the given config/providers with a channel recorder
#[must_use]
pub fn manager_with(
    config: Config,
    providers: ProviderSet,
) -> (Arc<SessionManager>, mpsc::UnboundedReceiver<RecorderEvent>) {
    let (recorder, recorder_rx) = Recorder::channel();
    let manager = Arc::new(SessionManager::new(
        config,
        providers,
        Arc::new(StaticProfiles::new()),
        recorder,
    ));
    (manager, recorder_rx)
}

/// Feed `count` copies of a frame into a device's session
pub async fn feed_frames(manager: &SessionManager, device_sn: &str, frame: &[u8], count: usize) {
    for _ in 0..count {
        manager
            .route_frame(device_sn, frame.to_vec())
            .await
            .expect("route_frame failed");
    }
}

/// Receive the next outbound item, panicking after a generous timeout
pub async fn recv_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for outbound traffic")
        .expect("outbound channel closed")
}
