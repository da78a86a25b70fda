use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use relaying_core::NodeId;
use relaying_radio::data::{ConstantSource, MemorySink};
use relaying_radio::{
    run, station_channel, ChannelObserver, Endpoint, ExitReason, MediumConfig, Mode, Node, Relay,
    SimulatedMedium, Station, StationConfig, StationError, StationEvent, StationHandle, StatsReport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Finished<S> = JoinHandle<Result<(ExitReason, S), StationError>>;

fn spawn_station<S>(mut station: S, mut events: mpsc::Receiver<StationEvent>) -> Finished<S>
where
    S: Station + 'static,
{
    tokio::spawn(async move {
        let reason = run(&mut station, &mut events).await?;
        Ok((reason, station))
    })
}

struct Session {
    handles: Vec<StationHandle>,
    relay: Finished<Relay>,
    nodes: Vec<Finished<Node>>,
    sinks: Vec<(NodeId, MemorySink)>,
}

async fn start_session(medium: MediumConfig, mode: Mode, burst_size: usize) -> Result<Session> {
    let _ = env_logger::builder().is_test(true).try_init();
    let medium = SimulatedMedium::new(medium);
    let mut handles = Vec::new();

    // attach everyone before the relay sends its first request
    let (handle, relay_events) = station_channel(1024);
    let relay_radio = medium.attach(Endpoint::Relay, handle.clone()).await;
    handles.push(handle);

    let mut nodes = Vec::new();
    let mut sinks = Vec::new();
    for id in [NodeId::A, NodeId::B] {
        let (handle, events) = station_channel(1024);
        let radio = medium.attach(Endpoint::Node(id), handle.clone()).await;
        handles.push(handle);
        let sink = MemorySink::new();
        let config = StationConfig {
            burst_size,
            grace_period: Duration::ZERO,
            ..StationConfig::node(id, mode)
        };
        let byte = id.to_string().as_bytes()[0];
        let node = Node::new(config, Arc::new(radio), Box::new(ConstantSource::new(byte)), Box::new(sink.clone()))?;
        nodes.push(spawn_station(node, events));
        sinks.push((id, sink));
    }

    let config = StationConfig { grace_period: Duration::ZERO, ..StationConfig::relay(mode) };
    let relay = spawn_station(Relay::new(config, Arc::new(relay_radio))?, relay_events);

    Ok(Session { handles, relay, nodes, sinks })
}

impl Session {
    async fn stop(self) -> Result<(ExitReason, Relay, Vec<(NodeId, MemorySink)>)> {
        for handle in &self.handles {
            handle.request_shutdown().await;
        }
        let (reason, relay) = self.relay.await??;
        for node in self.nodes {
            let (node_reason, _) = node.await??;
            assert_eq!(node_reason, ExitReason::Terminated);
        }
        Ok((reason, relay, self.sinks))
    }
}

fn assert_sink_from_peer(id: NodeId, sink: &MemorySink) {
    let peer_byte = id.other().to_string().as_bytes()[0];
    let payloads = sink.payloads();
    assert!(!payloads.is_empty(), "node {} received nothing", id);
    for payload in payloads {
        assert_eq!(payload.len(), 213);
        assert!(payload.iter().all(|&b| b == peer_byte), "node {} got corrupted data", id);
    }
}

#[tokio::test(start_paused = true)]
async fn network_coded_session_exchanges_data() -> Result<()> {
    let medium = MediumConfig { packet_loss: 0.0, seed: Some(1), ..Default::default() };
    let session = start_session(medium, Mode::NetworkCoded, 1).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let (reason, relay, sinks) = session.stop().await?;
    assert_eq!(reason, ExitReason::Terminated);
    assert_eq!(relay.timeouts_total(), 0);
    for (id, sink) in &sinks {
        assert_sink_from_peer(*id, sink);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn two_way_session_survives_loss_and_bit_errors() -> Result<()> {
    let medium = MediumConfig {
        packet_loss: 0.1,
        bit_error_rate: 1e-4,
        latency_jitter: Duration::from_millis(2),
        seed: Some(42),
        ..Default::default()
    };
    let session = start_session(medium, Mode::TwoWay, 3).await?;
    tokio::time::sleep(Duration::from_secs(20)).await;

    let (reason, relay, sinks) = session.stop().await?;
    assert_eq!(reason, ExitReason::Terminated);
    assert!(relay.core().counters().frames_received_ok > 0);
    for (id, sink) in &sinks {
        assert_sink_from_peer(*id, sink);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn relay_alone_declares_link_failure() -> Result<()> {
    let medium = SimulatedMedium::new(MediumConfig { packet_loss: 0.0, ..Default::default() });
    let (handle, mut events) = station_channel(16);
    let radio = medium.attach(Endpoint::Relay, handle).await;
    let (observer, mut reports) = ChannelObserver::channel();
    let config = StationConfig { grace_period: Duration::ZERO, ..StationConfig::relay(Mode::TwoWay) };
    let mut relay = Relay::new(config, Arc::new(radio))?.with_observer(Arc::new(observer));

    let reason = tokio_test::assert_ok!(run(&mut relay, &mut events).await);
    assert_eq!(reason, ExitReason::LinkFailure);
    assert_eq!(relay.timeouts_total(), 10);

    let mut last = None;
    while let Ok(text) = reports.try_recv() {
        last = StatsReport::parse_lossy(&text);
    }
    let last = last.expect("final report");
    assert_eq!(last.timeouts, 10);
    // one initial request, nine re-requests and the end-of-flow marker
    assert_eq!(last.frames_transmitted, 11);
    assert!(last.elapsed_secs >= 10.0);
    Ok(())
}
