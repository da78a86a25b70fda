//! Simulated half-duplex broadcast medium for testing
//!
//! One queue serialises every transmission, so only one station is on the air
//! at a time. Each frame is delayed by its airtime plus latency, then handed to
//! every other attached station with independent loss and random bit errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution, Normal};
use relaying_core::NodeId;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;

use crate::transceiver::{StationHandle, Transceiver};
use crate::{MediumConfig, RadioError};

const QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Relay,
    Node(NodeId),
}

impl Endpoint {
    fn is_node(self) -> bool {
        matches!(self, Endpoint::Node(_))
    }
}

struct AirFrame {
    from: Endpoint,
    frame: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MediumStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub bits_flipped: u64,
}

pub struct SimulatedMedium {
    stations: Arc<RwLock<HashMap<Endpoint, StationHandle>>>,
    config: MediumConfig,
    stats: Arc<Mutex<MediumStats>>,
    queue: mpsc::Sender<AirFrame>,
}

impl SimulatedMedium {
    /// Creates the medium and spawns the task that plays frames onto the air.
    /// Must be called from within a tokio runtime.
    pub fn new(config: MediumConfig) -> Arc<Self> {
        let stations = Arc::new(RwLock::new(HashMap::<Endpoint, StationHandle>::new()));
        let stats = Arc::new(Mutex::new(MediumStats::default()));
        let (queue, mut air_rx) = mpsc::channel::<AirFrame>(QUEUE_DEPTH);

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let jitter = if config.latency_jitter.is_zero() {
            None
        } else {
            Normal::new(0.0, config.latency_jitter.as_secs_f64()).ok()
        };
        info!("simulated medium up: {:?}", config);

        let task_stations = stations.clone();
        let task_stats = stats.clone();
        let task_config = config.clone();
        tokio::spawn(async move {
            while let Some(air) = air_rx.recv().await {
                let airtime = Duration::from_secs_f64(
                    (air.frame.len() * 8) as f64 / task_config.bandwidth_bps.max(1) as f64,
                );
                let mut delay = airtime.as_secs_f64() + task_config.latency.as_secs_f64();
                if let Some(normal) = &jitter {
                    delay += normal.sample(&mut rng);
                }
                sleep(Duration::from_secs_f64(delay.max(0.0))).await;

                if air.frame.is_empty() {
                    debug!("{:?} signalled end of flow", air.from);
                    continue;
                }

                let stations = task_stations.read().await;
                let mut stats = task_stats.lock().await;
                for (&to, handle) in stations.iter() {
                    if to == air.from {
                        continue;
                    }
                    let loss = if air.from.is_node() && to.is_node() {
                        match task_config.direct_link_loss {
                            Some(loss) => loss,
                            None => continue,
                        }
                    } else {
                        task_config.packet_loss
                    };
                    if rng.random::<f32>() < loss {
                        stats.frames_dropped += 1;
                        trace!("frame from {:?} to {:?} lost", air.from, to);
                        continue;
                    }

                    let mut frame = air.frame.clone();
                    stats.bits_flipped += flip_bits(&mut frame, task_config.bit_error_rate, &mut rng);
                    if handle.on_receive(frame) {
                        stats.frames_delivered += 1;
                    } else {
                        stats.frames_dropped += 1;
                    }
                }
            }
            debug!("simulated medium queue closed");
        });

        Arc::new(Self { stations, config, stats, queue })
    }

    /// Connects a station's event queue to the medium.
    pub async fn attach(self: &Arc<Self>, endpoint: Endpoint, handle: StationHandle) -> SimulatedTransceiver {
        self.stations.write().await.insert(endpoint, handle);
        SimulatedTransceiver {
            endpoint,
            medium: Arc::clone(self),
            stopped: AtomicBool::new(false),
        }
    }

    async fn detach(&self, endpoint: Endpoint) {
        self.stations.write().await.remove(&endpoint);
    }

    pub async fn get_stats(&self) -> MediumStats {
        *self.stats.lock().await
    }

    async fn send(&self, from: Endpoint, frame: &[u8]) -> Result<(), RadioError> {
        if frame.len() > self.config.mtu {
            return Err(RadioError::PacketTooLarge);
        }
        match self.queue.try_send(AirFrame { from, frame: frame.to_vec() }) {
            Ok(()) => {
                let mut stats = self.stats.lock().await;
                stats.frames_sent += 1;
                stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("medium queue full, {:?} cannot transmit", from);
                Err(RadioError::TransmissionFailed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RadioError::Unavailable),
        }
    }
}

fn flip_bits(frame: &mut [u8], bit_error_rate: f64, rng: &mut StdRng) -> u64 {
    if bit_error_rate <= 0.0 || frame.is_empty() {
        return 0;
    }
    let bits = frame.len() * 8;
    let Ok(binomial) = Binomial::new(bits as u64, bit_error_rate.min(1.0)) else {
        return 0;
    };
    let errors = binomial.sample(rng);
    for _ in 0..errors {
        let bit = rng.random_range(0..bits);
        frame[bit / 8] ^= 1 << (bit % 8);
    }
    errors
}

/// One station's attachment point to a [`SimulatedMedium`].
pub struct SimulatedTransceiver {
    endpoint: Endpoint,
    medium: Arc<SimulatedMedium>,
    stopped: AtomicBool,
}

impl SimulatedTransceiver {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

#[async_trait]
impl Transceiver for SimulatedTransceiver {
    async fn transmit(&self, frame: &[u8], end_of_flow: bool) -> Result<(), RadioError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RadioError::Unavailable);
        }
        trace!("{:?} transmitting {} bytes (end of flow: {})", self.endpoint, frame.len(), end_of_flow);
        self.medium.send(self.endpoint, frame).await
    }

    async fn probe(&self) -> Result<(), RadioError> {
        if self.stopped.load(Ordering::SeqCst) || self.medium.queue.is_closed() {
            Err(RadioError::Unavailable)
        } else {
            Ok(())
        }
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.medium.detach(self.endpoint).await;
        }
    }
}
