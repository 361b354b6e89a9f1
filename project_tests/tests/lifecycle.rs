use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lib_common::core::{ChannelRegistry, HeartbeatMonitor, Orchestrator, PipelineSettings};
use lib_common::delivery::DeliveryPipeline;
use lib_common::ingestors::HandlerChain;
use lib_common::upstream::Difference;
use lib_common::DeliveryTarget;
use project_tests::{item, new_message, wait_until, FakeCatalog, FakeTransport, RecordingSink};

fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        poll_interval: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(60),
        batch_window: Duration::from_secs(30),
        batch_check_interval: Duration::from_secs(1),
        resubscribe_delay: Duration::from_secs(1),
        ..PipelineSettings::default()
    }
}

async fn orchestrator(transport: &Arc<FakeTransport>, sink: &Arc<RecordingSink>) -> Orchestrator {
    let catalog = FakeCatalog::new().with_channel(1, "@alpha");
    let registry = Arc::new(ChannelRegistry::new());
    registry.register_all(&["@alpha"], &catalog, transport.as_ref()).await;
    let pipeline = Arc::new(DeliveryPipeline::new(sink.clone(), vec![DeliveryTarget::primary("chat-a")]));
    Orchestrator::new(transport.clone(), registry, HandlerChain::new(), pipeline, fast_settings())
}

#[tokio::test]
async fn heartbeat_pings_only_when_connected() {
    let transport = FakeTransport::new();
    let monitor = HeartbeatMonitor::new(transport.clone(), Duration::from_secs(840));

    assert!(monitor.beat().await);
    assert_eq!(transport.pings(), 1);

    transport.set_connected(false);
    assert!(!monitor.beat().await);
    assert_eq!(transport.pings(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_first_probe_waits_one_interval() {
    let transport = FakeTransport::new();
    let monitor = HeartbeatMonitor::new(transport.clone(), Duration::from_secs(60));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(monitor.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(transport.pings(), 0);
    tokio::time::sleep(Duration::from_secs(62)).await;
    assert_eq!(transport.pings(), 2);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn live_and_reconciled_events_end_up_in_one_digest() {
    let transport = FakeTransport::with_state(10);
    let sink = Arc::new(RecordingSink::new());
    let mut orchestrator = orchestrator(&transport, &sink).await;
    transport.script(1, Ok(Difference::Page { items: vec![item(11, "missed")], cursor: 11 }));

    orchestrator.start();
    assert!(orchestrator.is_running());
    assert_eq!(orchestrator.chain().names().last(), Some(&"aggregator"));

    assert!(wait_until(Duration::from_secs(2), || transport.subscribe_calls() == 1).await);
    assert!(transport.push(new_message(1, 12, "pushed")).await);

    assert!(wait_until(Duration::from_secs(40), || !sink.sent().is_empty()).await);
    let digest = &sink.sent()[0].text;
    assert!(digest.contains("@alpha: missed"));
    assert!(digest.contains("@alpha: pushed"));

    orchestrator.shutdown().await;
    assert!(!orchestrator.is_running());
    assert_eq!(transport.disconnects(), 1);
}

#[tokio::test]
async fn start_twice_is_a_no_op_and_shutdown_stops_everything() {
    let transport = FakeTransport::new();
    let sink = Arc::new(RecordingSink::new());
    let mut orchestrator = orchestrator(&transport, &sink).await;

    orchestrator.start();
    orchestrator.start();
    assert!(wait_until(Duration::from_secs(2), || transport.subscribe_calls() == 1).await);

    orchestrator.shutdown().await;
    assert!(!orchestrator.is_running());
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(transport.subscribe_calls(), 1);
}

#[tokio::test]
async fn wait_for_disconnect_resolves_when_upstream_closes() {
    let transport = FakeTransport::new();
    let sink = Arc::new(RecordingSink::new());
    let orchestrator = orchestrator(&transport, &sink).await;

    let closer = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close();
    });

    tokio::time::timeout(Duration::from_secs(2), orchestrator.wait_for_disconnect())
        .await
        .unwrap();
}
