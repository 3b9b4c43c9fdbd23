//! End-to-end tests that bind a real socket and speak the wire protocol.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::codec::{encode_pdu, Decoder, PduFormat};
use crate::protocol::DAEMON_VERSION;

use super::{run, ServerContext};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    ctx: Arc<ServerContext>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _base: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let base = tempfile::tempdir().unwrap();
        let ctx = ServerContext::new(base.path().join("sock"), base.path().join("state.json"));
        let handle = tokio::spawn(run(ctx.clone()));
        for _ in 0..200 {
            if ctx.sockname.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        TestServer { ctx, handle, _base: base }
    }

    async fn client(&self) -> TestClient {
        let stream = UnixStream::connect(&self.ctx.sockname).await.unwrap();
        let (reader, writer) = stream.into_split();
        TestClient { reader: BufReader::new(reader), writer }
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn send(&mut self, request: Value) {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a response")
            .unwrap();
        assert!(n > 0, "server closed the connection");
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn roundtrip(&mut self, request: Value) -> Value {
        self.send(request).await;
        self.recv().await
    }

    async fn expect_silence(&mut self, window: Duration) {
        let mut line = String::new();
        let read = tokio::time::timeout(window, self.reader.read_line(&mut line)).await;
        assert!(read.is_err(), "unexpected message: {}", line.trim());
    }
}

fn ticks_of(resp: &Value) -> u32 {
    resp["clock"]
        .as_str()
        .expect("response carries a clock")
        .rsplit(':')
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

fn file_names(resp: &Value) -> Vec<String> {
    resp["files"]
        .as_array()
        .expect("response carries files")
        .iter()
        .map(|f| f["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn empty_request_reports_error_and_session_survives() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let resp = client.roundtrip(json!([])).await;
    assert_eq!(resp["version"], DAEMON_VERSION);
    assert_eq!(
        resp["error"],
        "invalid command (expected an array with some elements!)"
    );

    // The session is still usable.
    let resp = client.roundtrip(json!(["version"])).await;
    assert_eq!(resp["version"], DAEMON_VERSION);
    assert!(resp.get("error").is_none());
}

#[tokio::test]
async fn unknown_command_and_bad_element_zero() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let resp = client.roundtrip(json!(["foo"])).await;
    assert_eq!(resp["error"], "unknown command foo");

    let resp = client.roundtrip(json!([42])).await;
    assert_eq!(
        resp["error"],
        "invalid command: expected element 0 to be the command name"
    );
}

#[tokio::test]
async fn watch_then_find_returns_known_files() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("a.txt"), b"a").unwrap();
    std::fs::create_dir(tree.path().join("sub")).unwrap();
    std::fs::write(tree.path().join("sub/b.rs"), b"b").unwrap();

    let root_arg = tree.path().to_str().unwrap();
    let watched = client.roundtrip(json!(["watch", root_arg])).await;
    assert!(watched.get("error").is_none(), "{}", watched);
    let root_path = watched["root"].as_str().unwrap().to_string();
    let k = ticks_of(&watched);

    let found = client.roundtrip(json!(["find", root_arg])).await;
    assert_eq!(file_names(&found), vec!["a.txt", "sub/b.rs"]);
    assert!(ticks_of(&found) >= k);
    for file in found["files"].as_array().unwrap() {
        assert_eq!(file["exists"], true);
        assert!(file["size"].is_u64());
        assert!(file["oclock"].as_str().unwrap().starts_with("c:"));
    }

    // Trailing patterns narrow the result.
    let found = client.roundtrip(json!(["find", root_arg, "*.rs"])).await;
    assert_eq!(file_names(&found), vec!["sub/b.rs"]);

    let listed = client.roundtrip(json!(["watch-list"])).await;
    assert_eq!(listed["roots"], json!([root_path]));
}

#[tokio::test]
async fn cursor_since_round_trip() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("one.txt"), b"1").unwrap();

    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;

    let first = client.roundtrip(json!(["since", root_arg, "n:foo"])).await;
    assert_eq!(first["is_fresh_instance"], true);
    assert_eq!(file_names(&first), vec!["one.txt"]);
    let k1 = ticks_of(&first);

    // Immediate repeat with no filesystem change: empty set, newer clock.
    let second = client.roundtrip(json!(["since", root_arg, "n:foo"])).await;
    assert_eq!(second["is_fresh_instance"], false);
    assert!(file_names(&second).is_empty());
    let k2 = ticks_of(&second);
    assert!(k2 > k1, "cursor promotion must advance the clock: {} vs {}", k2, k1);
}

#[tokio::test]
async fn identity_clockspec_bumps_and_returns_empty() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("x"), b"x").unwrap();

    let root_arg = tree.path().to_str().unwrap();
    let watched = client.roundtrip(json!(["watch", root_arg])).await;
    let current = ticks_of(&watched);

    let spec = format!("c:{}:{}", std::process::id(), current);
    let resp = client.roundtrip(json!(["since", root_arg, spec])).await;
    assert_eq!(resp["is_fresh_instance"], false);
    assert!(file_names(&resp).is_empty());
    assert_eq!(ticks_of(&resp), current + 1);
}

#[tokio::test]
async fn foreign_pid_is_fresh_instance() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("seen.txt"), b"s").unwrap();

    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;

    let foreign = format!("c:{}:5", std::process::id().wrapping_add(917));
    let resp = client.roundtrip(json!(["since", root_arg, foreign])).await;
    assert_eq!(resp["is_fresh_instance"], true);
    assert_eq!(file_names(&resp), vec!["seen.txt"]);
}

#[tokio::test]
async fn since_with_timestamp_matches_on_wall_clock() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("now.txt"), b"n").unwrap();

    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;

    let resp = client.roundtrip(json!(["since", root_arg, 0])).await;
    assert_eq!(file_names(&resp), vec!["now.txt"]);
    assert_eq!(resp["is_fresh_instance"], false);

    // A cutoff far in the future matches nothing.
    let resp = client.roundtrip(json!(["since", root_arg, 4_000_000_000i64])).await;
    assert!(file_names(&resp).is_empty());
}

#[tokio::test]
async fn bad_clockspec_is_reported_and_session_survives() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;

    let resp = client.roundtrip(json!(["since", root_arg, "gibberish"])).await;
    assert!(resp["error"].as_str().unwrap().contains("invalid clockspec"));

    let resp = client.roundtrip(json!(["clock", root_arg])).await;
    assert!(resp["clock"].as_str().is_some());
}

#[tokio::test]
async fn unresolved_root_carries_resolver_message() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let resp = client.roundtrip(json!(["find", "/no/such/tree"])).await;
    let error = resp["error"].as_str().unwrap();
    assert!(error.starts_with("unable to resolve root /no/such/tree:"));

    let resp = client.roundtrip(json!(["find", 17])).await;
    assert_eq!(
        resp["error"],
        "invalid value for argument 1, expected a string naming the root dir"
    );

    let resp = client.roundtrip(json!(["find"])).await;
    assert_eq!(resp["error"], "wrong number of arguments");
}

#[tokio::test]
async fn subscription_delivers_changes_until_unsubscribed() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("base.txt"), b"b").unwrap();

    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;

    let ack = client.roundtrip(json!(["subscribe", root_arg, "s1", null])).await;
    assert_eq!(ack["subscribe"], "s1");

    // The initial result is immediate and marked fresh.
    let initial = client.recv().await;
    assert_eq!(initial["subscription"], "s1");
    assert_eq!(initial["is_fresh_instance"], true);
    assert_eq!(file_names(&initial), vec!["base.txt"]);

    // Filesystem activity produces an unsolicited notification.
    std::fs::write(tree.path().join("fresh.txt"), b"f").unwrap();
    let notification = client.recv().await;
    assert_eq!(notification["subscription"], "s1");
    assert_eq!(notification["is_fresh_instance"], false);
    assert_eq!(file_names(&notification), vec!["fresh.txt"]);
    assert!(notification["clock"].as_str().unwrap().starts_with("c:"));

    let resp = client.roundtrip(json!(["unsubscribe", root_arg, "s1"])).await;
    assert_eq!(resp["unsubscribe"], "s1");
    assert_eq!(resp["deleted"], true);

    // Further changes no longer reach this session.
    std::fs::write(tree.path().join("after.txt"), b"a").unwrap();
    client.expect_silence(Duration::from_millis(700)).await;
}

#[tokio::test]
async fn subscription_notifications_arrive_in_tick_order() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();

    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;
    client.roundtrip(json!(["subscribe", root_arg, "ordered", null])).await;
    let _initial = client.recv().await;

    let mut last_ticks = 0;
    for i in 0..3 {
        std::fs::write(tree.path().join(format!("f{}.txt", i)), b"x").unwrap();
        let notification = client.recv().await;
        let ticks = ticks_of(&notification);
        assert!(ticks > last_ticks, "notifications must advance: {} vs {}", ticks, last_ticks);
        last_ticks = ticks;
        // Wait out the debounce window so each write is its own batch.
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::test]
async fn log_level_filters_broadcast_logs() {
    let server = TestServer::start().await;
    let mut listener = server.client().await;
    let mut talker = server.client().await;

    let resp = listener.roundtrip(json!(["log-level", "debug"])).await;
    assert_eq!(resp["log_level"], "debug");

    let resp = talker.roundtrip(json!(["log", "error", "subsystem on fire"])).await;
    assert_eq!(resp["logged"], true);

    let log_line = listener.recv().await;
    assert_eq!(log_line["log"], "subsystem on fire");
    assert_eq!(log_line["version"], DAEMON_VERSION);

    // The talker never opted in, so it only saw its own ack.
    talker.expect_silence(Duration::from_millis(300)).await;

    // Dropping back to off silences the listener too.
    listener.roundtrip(json!(["log-level", "off"])).await;
    talker.roundtrip(json!(["log", "error", "again"])).await;
    listener.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn binary_requests_get_binary_replies() {
    let server = TestServer::start().await;
    let mut stream = UnixStream::connect(&server.ctx.sockname).await.unwrap();

    stream
        .write_all(&encode_pdu(PduFormat::Binary, &json!(["version"])))
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(RECV_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    assert!(n > 0);
    assert_eq!(buf[0], 0x00, "reply must mirror the binary encoding");

    let mut decoder = Decoder::new();
    decoder.feed(&buf[..n]);
    let (format, resp) = decoder.next_pdu().unwrap().unwrap();
    assert_eq!(format, PduFormat::Binary);
    assert_eq!(resp["version"], DAEMON_VERSION);
}

#[tokio::test]
async fn decode_error_terminates_the_session() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .writer
        .write_all(b"this is not a request\n")
        .await
        .unwrap();

    let resp = client.recv().await;
    assert!(resp["error"].as_str().unwrap().contains("invalid pdu"));

    // The server hangs up after reporting the malformed frame.
    let mut line = String::new();
    let n = tokio::time::timeout(RECV_TIMEOUT, client.reader.read_line(&mut line))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn watch_del_releases_the_root() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    let root_arg = tree.path().to_str().unwrap();

    let watched = client.roundtrip(json!(["watch", root_arg])).await;
    let root_path = watched["root"].as_str().unwrap().to_string();

    let resp = client.roundtrip(json!(["watch-del", root_arg])).await;
    assert_eq!(resp["watch-del"], true);
    assert_eq!(resp["root"], root_path);

    let listed = client.roundtrip(json!(["watch-list"])).await;
    assert_eq!(listed["roots"], json!([]));

    let resp = client.roundtrip(json!(["find", root_arg])).await;
    assert!(resp["error"].as_str().unwrap().contains("is not watched"));
}

#[tokio::test]
async fn trigger_lifecycle_over_the_wire() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    let root_arg = tree.path().to_str().unwrap();
    client.roundtrip(json!(["watch", root_arg])).await;

    let resp = client
        .roundtrip(json!(["trigger", root_arg, "build", "*.c", "--", "true"]))
        .await;
    assert_eq!(resp["triggerid"], "build");

    let listed = client.roundtrip(json!(["trigger-list", root_arg])).await;
    let triggers = listed["triggers"].as_array().unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0]["name"], "build");
    assert_eq!(triggers[0]["patterns"], json!(["*.c"]));

    let resp = client.roundtrip(json!(["trigger-del", root_arg, "build"])).await;
    assert_eq!(resp["deleted"], true);
    let resp = client.roundtrip(json!(["trigger-del", root_arg, "build"])).await;
    assert_eq!(resp["deleted"], false);
}

#[tokio::test]
async fn server_identity_commands() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let resp = client.roundtrip(json!(["get-pid"])).await;
    assert_eq!(resp["pid"], json!(std::process::id()));

    let resp = client.roundtrip(json!(["get-sockname"])).await;
    assert_eq!(
        resp["sockname"].as_str().unwrap(),
        server.ctx.sockname.display().to_string()
    );
}

#[tokio::test]
async fn shutdown_server_stops_the_listener() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let tree = tempfile::tempdir().unwrap();
    client.roundtrip(json!(["watch", tree.path().to_str().unwrap()])).await;

    let resp = client.roundtrip(json!(["shutdown-server"])).await;
    assert_eq!(resp["shutdown-server"], true);

    let result = tokio::time::timeout(RECV_TIMEOUT, server.handle)
        .await
        .expect("server should exit promptly")
        .unwrap();
    assert!(result.is_ok());
    assert!(!server.ctx.sockname.exists(), "socket file must be removed");
    assert!(server.ctx.roots.all().is_empty(), "roots must be released");
}
