use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use lib_common::delivery::telegram_bot::BotApiSink;
use lib_common::delivery::{DeliveryPipeline, MessageFormat, Sink, SinkError, TargetOutcome};
use lib_common::DeliveryTarget;

const OK: (u16, &str) = (200, r#"{"ok":true,"result":{}}"#);
const PARSE_ERROR: (u16, &str) =
    (400, r#"{"ok":false,"error_code":400,"description":"Bad Request: can't parse entities"}"#);
const FORBIDDEN: (u16, &str) = (403, r#"{"ok":false,"error_code":403,"description":"Forbidden"}"#);

/// One request the local bot API received.
#[derive(Debug, Clone)]
struct Received {
    path: String,
    body: Value,
}

/// Minimal HTTP/1.1 server answering `sendMessage` calls from a reply
/// script; once the script is used up every call gets `200`.
struct LocalBotApi {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
}

impl LocalBotApi {
    async fn start(replies: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));

        let log = received.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                let replies = replies.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_request(stream).await {
                        let (mut stream, received) = request;
                        log.lock().unwrap().push(received);
                        let (status, body) = replies.lock().unwrap().pop_front().unwrap_or(OK);
                        let reason = if status == 200 { "OK" } else { "Error" };
                        let response = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            reason,
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    }
                });
            }
        });

        Self { addr, received }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn read_request(mut stream: TcpStream) -> Option<(TcpStream, Received)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head.split_whitespace().nth(1)?.to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = serde_json::from_slice(&buf[header_end..header_end + content_length]).unwrap_or(Value::Null);
    Some((stream, Received { path, body }))
}

fn two_part_text() -> String {
    format!("{}\n{}", "A".repeat(3000), "B".repeat(3000))
}

fn text_of(received: &Received) -> &str {
    received.body["text"].as_str().unwrap()
}

#[tokio::test]
async fn sink_reports_how_much_was_posted_before_a_rejection() {
    let api = LocalBotApi::start(vec![OK, PARSE_ERROR]).await;
    let sink = BotApiSink::new(&api.url(), "TOKEN").unwrap();
    let text = two_part_text();

    let result = sink.deliver(&DeliveryTarget::primary("42"), &text, MessageFormat::Rich).await;

    match result {
        Err(SinkError::FormattingRejected { delivered, reason }) => {
            assert_eq!(delivered, 3001);
            assert!(reason.contains("parse entities"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    let received = api.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].path, "/botTOKEN/sendMessage");
    assert_eq!(received[0].body["chat_id"], "42");
    assert_eq!(received[0].body["parse_mode"], "HTML");
}

#[tokio::test]
async fn plain_retry_resumes_after_the_parts_already_posted() {
    let api = LocalBotApi::start(vec![OK, PARSE_ERROR, OK]).await;
    let sink = Arc::new(BotApiSink::new(&api.url(), "TOKEN").unwrap());
    let pipeline = DeliveryPipeline::new(sink, vec![DeliveryTarget::primary("42")]);

    let report = pipeline.broadcast(&two_part_text(), "SUMMARY").await;

    assert_eq!(report.outcome_for("42"), Some(&TargetOutcome::DeliveredPlain));
    let received = api.received();
    assert_eq!(received.len(), 3);
    assert_eq!(received.iter().filter(|r| text_of(r).contains("AAAA")).count(), 1);
    assert_eq!(text_of(&received[2]), format!("📢 @SUMMARY\n\n{}", "B".repeat(3000)));
    assert!(received[2].body.get("parse_mode").is_none());
}

#[tokio::test]
async fn rejected_first_part_retries_the_whole_text() {
    let api = LocalBotApi::start(vec![PARSE_ERROR]).await;
    let sink = Arc::new(BotApiSink::new(&api.url(), "TOKEN").unwrap());
    let pipeline = DeliveryPipeline::new(sink, vec![DeliveryTarget::primary("42")]);

    let report = pipeline.broadcast("<b>broken & short", "BATCH").await;

    assert_eq!(report.outcome_for("42"), Some(&TargetOutcome::DeliveredPlain));
    let received = api.received();
    assert_eq!(received.len(), 2);
    assert_eq!(text_of(&received[1]), "📢 @BATCH\n\nbroken & short");
}

#[tokio::test]
async fn other_rejections_are_not_retried() {
    let api = LocalBotApi::start(vec![FORBIDDEN]).await;
    let sink = Arc::new(BotApiSink::new(&api.url(), "TOKEN").unwrap());
    let pipeline = DeliveryPipeline::new(sink, vec![DeliveryTarget::primary("42")]);

    let report = pipeline.broadcast("hello", "BATCH").await;

    assert!(matches!(report.outcome_for("42"), Some(TargetOutcome::Failed(_))));
    assert_eq!(api.received().len(), 1);
}
