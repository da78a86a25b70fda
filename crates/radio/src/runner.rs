//! Single-threaded event loop driving one station
//!
//! Frames, timer expiry and shutdown requests are taken one at a time, so a
//! station's buffers and counters are never touched by two events at once.

use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::transceiver::StationEvent;
use crate::StationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested from outside.
    Terminated,
    /// Too many consecutive timeouts.
    LinkFailure,
    /// The configured transmission cap was reached.
    TransmissionLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(ExitReason),
}

#[async_trait]
pub trait Station: Send {
    async fn start(&mut self) -> Result<Flow, StationError>;

    async fn on_frame(&mut self, frame: &[u8]) -> Result<Flow, StationError>;

    async fn on_timeout(&mut self) -> Result<Flow, StationError>;

    /// Idempotent; returns the reason of the first call.
    async fn shutdown(&mut self, reason: ExitReason) -> ExitReason;

    /// When the armed timer fires, if any.
    fn deadline(&self) -> Option<Instant>;
}

pub async fn run<S>(station: &mut S, events: &mut mpsc::Receiver<StationEvent>) -> Result<ExitReason, StationError>
where
    S: Station + ?Sized,
{
    if let Flow::Stop(reason) = station.start().await? {
        return Ok(station.shutdown(reason).await);
    }

    loop {
        let event = match station.deadline() {
            Some(deadline) => tokio::select! {
                biased;
                event = events.recv() => event,
                _ = sleep_until(deadline) => Some(StationEvent::TimeoutFired),
            },
            None => events.recv().await,
        };

        let flow = match event {
            Some(StationEvent::FrameReceived(frame)) => station.on_frame(&frame).await,
            Some(StationEvent::TimeoutFired) => station.on_timeout().await,
            Some(StationEvent::ShutdownRequested) => Ok(Flow::Stop(ExitReason::Terminated)),
            None => {
                debug!("event queue closed");
                Ok(Flow::Stop(ExitReason::Terminated))
            }
        };

        match flow {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop(reason)) => return Ok(station.shutdown(reason).await),
            Err(e) => {
                error!("station failed: {}", e);
                station.shutdown(ExitReason::Terminated).await;
                return Err(e);
            }
        }
    }
}
