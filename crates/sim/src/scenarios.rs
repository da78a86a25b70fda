//! End-to-end relaying sessions over the simulated medium

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use relaying_core::{ChannelCode, NodeId};
use relaying_radio::data::{MemorySink, RandomSource};
use relaying_radio::{
    run, station_channel, Endpoint, ExitReason, LogObserver, MediumConfig, MediumStats, Mode, Node, Relay,
    SimulatedMedium, Station, StationConfig, StationError, StationEvent, StationHandle, StatsReport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: Mode,
    pub channel_code: ChannelCode,
    pub burst_size: usize,
    pub direct_link: bool,
    pub timeout: Duration,
    pub duration: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::NetworkCoded,
            channel_code: ChannelCode::ReedSolomon,
            burst_size: 1,
            direct_link: false,
            timeout: Duration::from_secs(1),
            duration: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub id: NodeId,
    pub exit: ExitReason,
    pub report: StatsReport,
    pub payloads_delivered: usize,
    pub bytes_delivered: usize,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub relay_exit: ExitReason,
    pub relay_report: StatsReport,
    pub nodes: Vec<NodeOutcome>,
    pub medium: MediumStats,
}

impl SessionOutcome {
    /// Application bytes delivered to both nodes per second of session.
    pub fn goodput_bps(&self) -> f64 {
        let bytes: usize = self.nodes.iter().map(|n| n.bytes_delivered).sum();
        if self.relay_report.elapsed_secs <= 0.0 {
            return 0.0;
        }
        (bytes * 8) as f64 / self.relay_report.elapsed_secs
    }

    /// Share of relay frames that arrived with a valid CRC.
    pub fn relay_frame_success(&self) -> f64 {
        if self.relay_report.frames_received == 0 {
            return 0.0;
        }
        self.relay_report.frames_received_ok as f64 / self.relay_report.frames_received as f64
    }
}

type Finished<S> = JoinHandle<Result<(ExitReason, S), StationError>>;

fn spawn_station<S>(mut station: S, mut events: mpsc::Receiver<StationEvent>) -> Finished<S>
where
    S: Station + 'static,
{
    tokio::spawn(async move {
        let exit = run(&mut station, &mut events).await?;
        Ok((exit, station))
    })
}

/// Runs a relay and both nodes over one medium for `session.duration`, then
/// asks every station to shut down and collects their final counters.
pub async fn run_session(medium_config: MediumConfig, session: &SessionConfig) -> Result<SessionOutcome> {
    info!("session {:?} over {:?}", session, medium_config);
    let medium = SimulatedMedium::new(medium_config);
    let mut handles: Vec<StationHandle> = Vec::new();

    let (relay_handle, relay_events) = station_channel(1024);
    let relay_radio = medium.attach(Endpoint::Relay, relay_handle.clone()).await;
    handles.push(relay_handle);

    let mut nodes = Vec::new();
    let mut sinks = Vec::new();
    for id in [NodeId::A, NodeId::B] {
        let (handle, events) = station_channel(1024);
        let radio = medium.attach(Endpoint::Node(id), handle.clone()).await;
        handles.push(handle);

        let config = StationConfig {
            channel_code: session.channel_code,
            burst_size: session.burst_size,
            direct_link: session.direct_link,
            ..StationConfig::node(id, session.mode)
        };
        let sink = MemorySink::new();
        let node = Node::new(config, Arc::new(radio), Box::new(RandomSource), Box::new(sink.clone()))?
            .with_observer(Arc::new(LogObserver { name: format!("node {}", id) }));
        nodes.push((id, spawn_station(node, events)));
        sinks.push(sink);
    }

    let config = StationConfig {
        channel_code: session.channel_code,
        timeout: session.timeout,
        ..StationConfig::relay(session.mode)
    };
    let relay = Relay::new(config, Arc::new(relay_radio))?
        .with_observer(Arc::new(LogObserver { name: "relay".into() }));
    let relay = spawn_station(relay, relay_events);

    tokio::time::sleep(session.duration).await;
    debug!("session time is up, stopping stations");
    for handle in &handles {
        handle.request_shutdown().await;
    }

    let (relay_exit, relay) = relay.await.context("relay task panicked")??;
    let relay_report = relay.core().snapshot(relay.timeouts_total());

    let mut outcomes = Vec::new();
    for ((id, task), sink) in nodes.into_iter().zip(sinks) {
        let (exit, node) = task.await.with_context(|| format!("node {} task panicked", id))??;
        outcomes.push(NodeOutcome {
            id,
            exit,
            report: node.core().snapshot(0),
            payloads_delivered: sink.payloads().len(),
            bytes_delivered: sink.total_bytes(),
        });
    }

    Ok(SessionOutcome {
        relay_exit,
        relay_report,
        nodes: outcomes,
        medium: medium.get_stats().await,
    })
}

/// Runs the same medium once per forwarding mode.
pub async fn mode_comparison(medium_config: MediumConfig, duration: Duration) -> Result<Vec<(Mode, SessionOutcome)>> {
    let mut results = Vec::new();
    for mode in [Mode::OneWay, Mode::TwoWay, Mode::NetworkCoded] {
        let session = SessionConfig { mode, duration, ..Default::default() };
        results.push((mode, run_session(medium_config.clone(), &session).await?));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lossless_network_coding_delivers_both_ways() {
        let medium = MediumConfig { packet_loss: 0.0, seed: Some(3), ..Default::default() };
        let session = SessionConfig { duration: Duration::from_secs(1), ..Default::default() };
        let outcome = run_session(medium, &session).await.unwrap();

        assert_eq!(outcome.relay_exit, ExitReason::Terminated);
        assert_eq!(outcome.relay_report.timeouts, 0);
        assert!((outcome.relay_frame_success() - 1.0).abs() < f64::EPSILON);
        for node in &outcome.nodes {
            assert_eq!(node.exit, ExitReason::Terminated);
            assert!(node.payloads_delivered > 0);
            assert_eq!(node.bytes_delivered, node.payloads_delivered * 213);
        }
        assert!(outcome.goodput_bps() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_way_only_feeds_b() {
        let medium = MediumConfig { packet_loss: 0.0, seed: Some(4), ..Default::default() };
        let session = SessionConfig { mode: Mode::OneWay, duration: Duration::from_secs(1), ..Default::default() };
        let outcome = run_session(medium, &session).await.unwrap();

        let a = outcome.nodes.iter().find(|n| n.id == NodeId::A).unwrap();
        let b = outcome.nodes.iter().find(|n| n.id == NodeId::B).unwrap();
        assert_eq!(a.payloads_delivered, 0);
        assert!(b.payloads_delivered > 0);
        assert_eq!(b.report.frames_transmitted, 0);
    }
}
