use std::sync::Arc;
use std::time::Duration;

use lib_common::core::{Aggregator, BatchTimer};
use lib_common::delivery::{DeliveryPipeline, MessageFormat, SummarizerError, SummaryOutcome, TargetOutcome};
use lib_common::ingestors::EventHandler;
use lib_common::{Batch, DeliveryTarget};
use project_tests::{event, identity, RecordingSink, ScriptedSummarizer, SummaryScript};

fn targets() -> Vec<DeliveryTarget> {
    vec![DeliveryTarget::primary("chat-a"), DeliveryTarget::secondary("chat-b")]
}

fn three_event_batch() -> Batch {
    let a = identity(1, "alpha");
    let b = identity(2, "beta");
    Batch::from(vec![event(&a, 1, "e1"), event(&b, 7, "e2"), event(&a, 2, "e3")])
}

#[tokio::test]
async fn digest_lists_events_in_arrival_order() {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = DeliveryPipeline::new(sink.clone(), targets());

    let report = pipeline.deliver_batch(three_event_batch()).await;

    assert!(report.digest.is_complete_success());
    assert_eq!(report.summary, SummaryOutcome::Disabled);

    let sent = sink.sent_to("chat-a");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].format, MessageFormat::Rich);
    let text = &sent[0].text;
    assert!(text.starts_with("<b>Batched 3 messages:</b>"));
    let first = text.find("1. @alpha: e1").unwrap();
    let second = text.find("2. @beta: e2").unwrap();
    let third = text.find("3. @alpha: e3").unwrap();
    assert!(first < second && second < third);
}

#[tokio::test]
async fn formatting_rejection_retries_plain_once_for_that_target_only() {
    let sink = Arc::new(RecordingSink::new().rejecting_rich("chat-b"));
    let pipeline = DeliveryPipeline::new(sink.clone(), targets());

    let report = pipeline.deliver_batch(three_event_batch()).await;

    assert_eq!(report.digest.outcome_for("chat-a"), Some(&TargetOutcome::Delivered));
    assert_eq!(report.digest.outcome_for("chat-b"), Some(&TargetOutcome::DeliveredPlain));
    assert!(report.digest.is_partial());
    assert_eq!(report.digest.failed(), 0);

    assert_eq!(sink.sent_to("chat-a").len(), 1);
    let retried = sink.sent_to("chat-b");
    assert_eq!(retried.len(), 2);
    assert_eq!(retried[0].format, MessageFormat::Rich);
    assert_eq!(retried[1].format, MessageFormat::Plain);
    assert!(retried[1].text.starts_with("📢 @BATCH\n\nBatched 3 messages:"));
    assert!(!retried[1].text.contains("<b>"));
}

#[tokio::test]
async fn failed_fallback_is_not_retried_again() {
    let sink = Arc::new(RecordingSink::new().rejecting_all("chat-b"));
    let pipeline = DeliveryPipeline::new(sink.clone(), targets());

    let report = pipeline.deliver_batch(three_event_batch()).await;

    assert!(matches!(report.digest.outcome_for("chat-b"), Some(TargetOutcome::Failed(_))));
    assert_eq!(report.digest.outcome_for("chat-a"), Some(&TargetOutcome::Delivered));
    assert_eq!(sink.sent_to("chat-b").len(), 2);
    assert!(report.digest.is_partial());
    assert!(!report.digest.all_failed());
}

#[tokio::test]
async fn summary_follows_digest_with_normalized_markup() {
    let sink = Arc::new(RecordingSink::new());
    let summarizer = Arc::new(ScriptedSummarizer::new(SummaryScript::Reply(
        "\\#Markets\n**BTC** up  \n".to_string(),
    )));
    let pipeline =
        DeliveryPipeline::new(sink.clone(), targets()).with_summarizer(summarizer.clone(), Duration::from_secs(5));

    let report = pipeline.deliver_batch(three_event_batch()).await;

    assert!(matches!(&report.summary, SummaryOutcome::Delivered(r) if r.is_complete_success()));
    assert_eq!(summarizer.calls(), 1);
    assert_eq!(summarizer.seen_sizes(), vec![3]);

    let sent = sink.sent_to("chat-a");
    assert_eq!(sent.len(), 2);
    assert!(sent[0].text.starts_with("<b>Batched"));
    assert_eq!(sent[1].text, "#Markets\n<b>BTC</b> up");
}

#[tokio::test(start_paused = true)]
async fn summarizer_timeout_keeps_the_digest() {
    let sink = Arc::new(RecordingSink::new());
    let summarizer = Arc::new(ScriptedSummarizer::new(SummaryScript::Hang).observing(sink.clone()));
    let pipeline =
        DeliveryPipeline::new(sink.clone(), targets()).with_summarizer(summarizer.clone(), Duration::from_secs(5));

    let report = pipeline.deliver_batch(three_event_batch()).await;

    assert!(report.digest.is_complete_success());
    assert_eq!(report.summary, SummaryOutcome::Skipped(SummarizerError::Timeout(Duration::from_secs(5))));
    // Both digests were out before the summarizer was even asked.
    assert_eq!(summarizer.sends_at_call(), vec![targets().len()]);
    assert_eq!(sink.sent().len(), 2);
}

#[tokio::test]
async fn failed_or_empty_summary_sends_nothing_extra() {
    for (script, expected) in [
        (SummaryScript::Fail("quota".into()), SummarizerError::Failed("quota".into())),
        (SummaryScript::Reply("   ".into()), SummarizerError::Empty),
    ] {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = DeliveryPipeline::new(sink.clone(), targets())
            .with_summarizer(Arc::new(ScriptedSummarizer::new(script)), Duration::from_secs(5));

        let report = pipeline.deliver_batch(three_event_batch()).await;

        assert_eq!(report.summary, SummaryOutcome::Skipped(expected));
        assert_eq!(sink.sent().len(), 2);
    }
}

#[tokio::test]
async fn no_targets_is_a_quiet_no_op() {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = DeliveryPipeline::new(sink.clone(), Vec::new());

    let report = pipeline.deliver_batch(three_event_batch()).await;

    assert!(report.digest.results.is_empty());
    assert!(!report.digest.all_failed());
    assert!(sink.sent().is_empty());
}

#[tokio::test]
async fn startup_notice_reaches_every_target() {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = DeliveryPipeline::new(sink.clone(), targets());

    let report = pipeline.send_startup_notice().await;

    assert_eq!(report.delivered(), 2);
    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.text.starts_with("🤖 Relay is working!")));
}

#[tokio::test(start_paused = true)]
async fn batch_timer_waits_for_the_window_and_skips_empty_batches() {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = Arc::new(DeliveryPipeline::new(sink.clone(), vec![DeliveryTarget::primary("chat-a")]));
    let aggregator = Arc::new(Aggregator::new());
    let mut timer = BatchTimer::new(
        aggregator.clone(),
        pipeline,
        Duration::from_secs(300),
        Duration::from_secs(10),
    );
    let alpha = identity(1, "alpha");

    aggregator.handle(&event(&alpha, 1, "early")).unwrap();
    tokio::time::advance(Duration::from_secs(100)).await;
    assert!(timer.tick().await.is_none());
    assert_eq!(aggregator.len(), 1);

    tokio::time::advance(Duration::from_secs(200)).await;
    let report = timer.tick().await.unwrap();
    assert_eq!(report.digest.delivered(), 1);
    assert!(aggregator.is_empty());
    assert_eq!(sink.sent().len(), 1);

    // Nothing collected: the window elapses without a send.
    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(timer.tick().await.is_none());
    assert_eq!(sink.sent().len(), 1);

    // The clock was not reset, so the next event goes out on the next check.
    aggregator.handle(&event(&alpha, 2, "late")).unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(timer.tick().await.is_some());
    assert_eq!(sink.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn appended_events_reach_the_digest_in_arrival_order() {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = Arc::new(DeliveryPipeline::new(sink.clone(), targets()));
    let aggregator = Arc::new(Aggregator::new());
    let mut timer = BatchTimer::new(
        aggregator.clone(),
        pipeline,
        Duration::from_secs(300),
        Duration::from_secs(10),
    );
    let alpha = identity(1, "alpha");
    let beta = identity(2, "beta");

    aggregator.handle(&event(&alpha, 1, "e1")).unwrap();
    aggregator.handle(&event(&beta, 7, "e2")).unwrap();
    aggregator.handle(&event(&alpha, 2, "e3")).unwrap();
    tokio::time::advance(Duration::from_secs(300)).await;

    let report = timer.tick().await.unwrap();
    assert!(report.digest.is_complete_success());
    assert!(aggregator.is_empty());

    for target in ["chat-a", "chat-b"] {
        let sent = sink.sent_to(target);
        assert_eq!(sent.len(), 1);
        let text = &sent[0].text;
        assert!(text.starts_with("<b>Batched 3 messages:</b>"));
        let first = text.find("1. @alpha: e1").unwrap();
        let second = text.find("2. @beta: e2").unwrap();
        let third = text.find("3. @alpha: e3").unwrap();
        assert!(first < second && second < third);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_delivery_does_not_push_back_the_next_window() {
    let sink = Arc::new(RecordingSink::new());
    let summarizer = Arc::new(ScriptedSummarizer::new(SummaryScript::Slow(
        Duration::from_secs(50),
        "summary".into(),
    )));
    let pipeline = Arc::new(
        DeliveryPipeline::new(sink.clone(), vec![DeliveryTarget::primary("chat-a")])
            .with_summarizer(summarizer, Duration::from_secs(120)),
    );
    let aggregator = Arc::new(Aggregator::new());
    let mut timer = BatchTimer::new(
        aggregator.clone(),
        pipeline,
        Duration::from_secs(300),
        Duration::from_secs(10),
    );
    let alpha = identity(1, "alpha");
    let start = tokio::time::Instant::now();

    aggregator.handle(&event(&alpha, 1, "first")).unwrap();
    tokio::time::advance(Duration::from_secs(300)).await;
    assert!(timer.tick().await.is_some());
    assert!(start.elapsed() >= Duration::from_secs(350));
    assert_eq!(sink.sent().len(), 2);

    // 300s after the first batch closed, 250s after its delivery finished.
    aggregator.handle(&event(&alpha, 2, "second")).unwrap();
    tokio::time::advance(Duration::from_secs(250)).await;
    let report = timer.tick().await.unwrap();
    assert_eq!(report.digest.delivered(), 1);
}
