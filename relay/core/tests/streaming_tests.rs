//! End-to-end tests for the relay pipeline
//!
//! These tests drive a scripted engine through the full path a browser
//! request takes: chat service, relay, streaming session, decoder and store.
//! Tests cover:
//! - A complete exchange streamed and recorded
//! - Stalled engines ending a response through the idle timeout
//! - Stop requests and preemption leaving no assistant message behind
//! - Stored order matching conversation order
//! - Export of recorded conversations
//! - Configuration files feeding the streaming layer

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use tempfile::{NamedTempFile, TempDir};

use relay_core::config::load_config_from_path;
use relay_core::{
    ChatService, ConversationStore, Relay, ScriptedEngine, ScriptedReply, Sender, SessionOutcome,
    SessionState, StreamingConfig,
};

fn fast_config() -> StreamingConfig {
    StreamingConfig {
        initial_timeout_ms: 500,
        idle_timeout_ms: 50,
        drain_timeout_ms: Some(10),
        end_marker: None,
    }
}

struct Harness {
    _dir: TempDir,
    store: ConversationStore,
    chat: ChatService,
    prompts: Arc<parking_lot::Mutex<Vec<String>>>,
}

async fn harness(replies: Vec<ScriptedReply>, config: StreamingConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(dir.path().join("relay.db")).unwrap();
    let engine = ScriptedEngine::with_replies(replies);
    let prompts = engine.prompts();
    let relay = Arc::new(Relay::new(engine, config));
    relay.start().await.unwrap();
    Harness {
        chat: ChatService::new(store.clone(), relay),
        store,
        prompts,
        _dir: dir,
    }
}

// =============================================================================
// Complete exchange
// =============================================================================

/// "hello" against an engine answering `hi\n` then stalling
#[tokio::test]
async fn test_hello_exchange_streams_and_persists() {
    let h = harness(vec![ScriptedReply::bytes("hi\n")], fast_config()).await;

    let reply = h.chat.send_message("hello").await.unwrap();
    let handle = reply.handle.clone();
    let chars: Vec<String> = reply.stream.map(|c| c.to_string()).collect().await;
    assert_eq!(chars, vec!["h", "i", "\n"]);
    assert_eq!(handle.state(), SessionState::Completed);
    reply.persisted.await.unwrap().unwrap();

    let messages = h.store.list_messages(reply.discussion_id).unwrap();
    let recorded: Vec<(Sender, &str)> = messages
        .iter()
        .map(|m| (m.sender, m.content.as_str()))
        .collect();
    assert_eq!(
        recorded,
        vec![(Sender::User, "hello"), (Sender::Assistant, "hi\n")]
    );
    assert_eq!(*h.prompts.lock(), vec!["hello"]);
}

/// Joined stream output equals the recorded answer, multibyte text included
#[tokio::test]
async fn test_streamed_text_matches_recorded_text() {
    let answer = "Olá, 世界!\nÇa va? 🦀";
    let bytes = answer.as_bytes();
    let reply = ScriptedReply::bytes(bytes[..5].to_vec())
        .then(Duration::from_millis(5), bytes[5..9].to_vec())
        .then(Duration::from_millis(5), bytes[9..].to_vec());
    let h = harness(vec![reply], fast_config()).await;

    let reply = h.chat.send_message("greet me").await.unwrap();
    let streamed: String = reply.stream.collect().await;
    reply.persisted.await.unwrap().unwrap();

    let messages = h.store.list_messages(reply.discussion_id).unwrap();
    assert_eq!(streamed, answer);
    assert_eq!(messages[1].content, streamed);
}

/// Invalid bytes are dropped without holding back the text after them
#[tokio::test]
async fn test_corrupt_bytes_do_not_block_text() {
    let h = harness(
        vec![ScriptedReply::bytes(b"a\xff\xc3b\xe2\x82c".to_vec())],
        fast_config(),
    )
    .await;

    let reply = h.chat.send_message("x").await.unwrap();
    let streamed: String = reply.stream.collect().await;
    assert_eq!(streamed, "abc");
}

// =============================================================================
// Idle timeout
// =============================================================================

/// An engine that never answers ends the response after the startup timeout
#[tokio::test]
async fn test_silent_engine_completes_empty() {
    let config = StreamingConfig {
        initial_timeout_ms: 100,
        ..fast_config()
    };
    let h = harness(Vec::new(), config).await;

    let reply = h.chat.send_message("anyone?").await.unwrap();
    let streamed: String = tokio::time::timeout(Duration::from_secs(2), reply.stream.collect())
        .await
        .unwrap();
    assert_eq!(streamed, "");

    reply.persisted.await.unwrap().unwrap();
    let messages = h.store.list_messages(reply.discussion_id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "");
}

/// A pause shorter than the idle timeout keeps the response open
#[tokio::test]
async fn test_short_pause_does_not_end_response() {
    let config = StreamingConfig {
        idle_timeout_ms: 200,
        ..fast_config()
    };
    let reply = ScriptedReply::bytes("one").then(Duration::from_millis(50), " two");
    let h = harness(vec![reply], config).await;

    let reply = h.chat.send_message("count").await.unwrap();
    let streamed: String = reply.stream.collect().await;
    assert_eq!(streamed, "one two");
}

// =============================================================================
// Cancellation
// =============================================================================

/// Stopping mid-stream keeps what was sent and records no answer
#[tokio::test]
async fn test_stop_mid_stream_records_no_answer() {
    let config = StreamingConfig {
        idle_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = harness(vec![ScriptedReply::bytes("abc")], config).await;

    let mut reply = h.chat.send_message("go").await.unwrap();
    assert_eq!(reply.stream.next().await, Some('a'));
    assert!(h.chat.stop());
    assert_eq!(reply.stream.next().await, None);
    assert_eq!(reply.persisted.await.unwrap().unwrap(), None);

    let messages = h.store.list_messages(reply.discussion_id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, Sender::User);
}

/// A second message preempts the first; only the second answer is recorded
#[tokio::test]
async fn test_second_message_preempts_first() {
    let config = StreamingConfig {
        initial_timeout_ms: 5_000,
        idle_timeout_ms: 5_000,
        drain_timeout_ms: Some(10),
        end_marker: Some('\u{4}'),
    };
    let h = harness(
        vec![
            ScriptedReply::bytes("long answer"),
            ScriptedReply::bytes("short\u{4}"),
        ],
        config,
    )
    .await;

    let first = h.chat.send_message("first").await.unwrap();
    let first_handle = first.handle.clone();
    let mut first_stream = first.stream;
    assert_eq!(first_stream.next().await, Some('l'));
    let drained = tokio::spawn(async move { first_stream.collect::<String>().await });

    let second = h.chat.send_message("second").await.unwrap();
    drained.await.unwrap();
    assert!(first_handle.is_cancelled());
    assert_eq!(first.persisted.await.unwrap().unwrap(), None);

    let streamed: String = second.stream.collect().await;
    assert_eq!(streamed, "short");
    second.persisted.await.unwrap().unwrap();

    assert_eq!(first.discussion_id, second.discussion_id);
    let contents: Vec<String> = h
        .store
        .list_messages(second.discussion_id)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first", "second", "short"]);
}

/// Messages sent right after the previous stream ends are recorded in order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_back_to_back_messages_keep_order() {
    const ROUNDS: usize = 20;
    let replies = (0..ROUNDS).map(|n| ScriptedReply::bytes(format!("answer {n}")));
    let h = harness(replies.collect(), fast_config()).await;

    let mut last = None;
    for n in 0..ROUNDS {
        let mut reply = h.chat.send_message(&format!("question {n}")).await.unwrap();
        let _: String = reply.stream.by_ref().collect().await;
        last = Some(reply);
    }
    let last = last.unwrap();
    last.persisted.await.unwrap().unwrap();

    let contents: Vec<String> = h
        .store
        .list_messages(last.discussion_id)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    let expected: Vec<String> = (0..ROUNDS)
        .flat_map(|n| [format!("question {n}"), format!("answer {n}")])
        .collect();
    assert_eq!(contents, expected);
}

/// Dropping the stream (client disconnect) counts as cancellation
#[tokio::test]
async fn test_dropped_stream_is_cancelled() {
    let config = StreamingConfig {
        idle_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = harness(vec![ScriptedReply::bytes("abc")], config).await;

    let relay = Arc::clone(h.chat.relay());
    let mut submission = relay.submit("direct").await.unwrap();
    assert_eq!(submission.stream.next().await, Some('a'));
    drop(submission.stream);

    assert!(matches!(
        submission.outcome.await.unwrap(),
        SessionOutcome::Cancelled { partial } if partial == "a"
    ));
}

// =============================================================================
// Export and configuration
// =============================================================================

#[tokio::test]
async fn test_export_after_exchange() {
    let h = harness(vec![ScriptedReply::bytes("hello")], fast_config()).await;

    let reply = h.chat.send_message("hi").await.unwrap();
    let _: String = reply.stream.collect().await;
    reply.persisted.await.unwrap().unwrap();

    let exported = serde_json::to_string(&h.chat.export().await.unwrap()).unwrap();
    assert_eq!(
        exported,
        r#"[{"id":1,"messages":[{"sender":"user","content":"hi"},{"sender":"assistant","content":"hello"}]}]"#
    );
}

#[tokio::test]
async fn test_config_file_end_marker_reaches_session() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[streaming]
initial_timeout_ms = 5000
idle_timeout_ms = 5000
drain_timeout_ms = 10
end_marker = "\u000c"
"#
    )
    .unwrap();
    let config = load_config_from_path(file.path()).unwrap();
    assert_eq!(config.streaming.end_marker, Some('\u{c}'));

    let h = harness(vec![ScriptedReply::bytes("fin\u{c}")], config.streaming).await;
    let reply = h.chat.send_message("end?").await.unwrap();
    let streamed: String = tokio::time::timeout(Duration::from_secs(1), reply.stream.collect())
        .await
        .unwrap();
    assert_eq!(streamed, "fin");
}
