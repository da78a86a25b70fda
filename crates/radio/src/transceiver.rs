//! Boundary to the physical layer
//!
//! Outbound frames go through [`Transceiver::transmit`]. Inbound frames, timer
//! expiry and termination all arrive as [`StationEvent`]s on one queue, so a
//! station handles them strictly one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;

use crate::RadioError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    FrameReceived(Vec<u8>),
    TimeoutFired,
    ShutdownRequested,
}

#[async_trait]
pub trait Transceiver: Send + Sync {
    async fn transmit(&self, frame: &[u8], end_of_flow: bool) -> Result<(), RadioError>;

    /// Checked once before a station starts operating.
    async fn probe(&self) -> Result<(), RadioError> {
        Ok(())
    }

    /// Stops the transmit and receive paths.
    async fn stop(&self) {}
}

/// Upcall side of a station's event queue, held by the physical layer.
#[derive(Debug, Clone)]
pub struct StationHandle {
    events: mpsc::Sender<StationEvent>,
}

impl StationHandle {
    pub fn new(events: mpsc::Sender<StationEvent>) -> Self {
        Self { events }
    }

    /// Delivers one decoded physical frame. Returns false if the station is
    /// gone or its queue is full, in which case the frame is lost like any
    /// other frame on the air.
    pub fn on_receive(&self, frame: Vec<u8>) -> bool {
        match self.events.try_send(StationEvent::FrameReceived(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("station queue full, dropping received frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn request_shutdown(&self) {
        let _ = self.events.send(StationEvent::ShutdownRequested).await;
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

pub fn station_channel(capacity: usize) -> (StationHandle, mpsc::Receiver<StationEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (StationHandle::new(tx), rx)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub frame: Vec<u8>,
    pub end_of_flow: bool,
}

/// Transceiver that records every frame instead of putting it on the air.
/// It can be switched unavailable to exercise the overflow path.
#[derive(Debug)]
pub struct RecordingTransceiver {
    sent: Mutex<Vec<Transmission>>,
    available: AtomicBool,
    stopped: AtomicBool,
}

impl Default for RecordingTransceiver {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl RecordingTransceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Transmission> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<Transmission> {
        self.sent.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default()
    }
}

#[async_trait]
impl Transceiver for RecordingTransceiver {
    async fn transmit(&self, frame: &[u8], end_of_flow: bool) -> Result<(), RadioError> {
        if !self.available.load(Ordering::SeqCst) || self.is_stopped() {
            return Err(RadioError::Unavailable);
        }
        let mut sent = self.sent.lock().map_err(|_| RadioError::TransmissionFailed)?;
        sent.push(Transmission { frame: frame.to_vec(), end_of_flow });
        Ok(())
    }

    async fn probe(&self) -> Result<(), RadioError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RadioError::Unavailable)
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
