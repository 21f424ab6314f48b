//! End-to-end tests driving a broker over in-memory connections.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};

use rpcswitch_broker::{Broker, BrokerOptions, Policy, StaticTokenBackend};

/// The policy used by most tests here.
const POLICY: &str = r#"
    [acl]
    admins = ["carol"]
    workers = ["wrk"]

    [method2acl]
    "demo.*" = "public"
    "demo.sensitive" = "admins"

    [backend2acl]
    "back.*" = "workers"

    [backendfilter]
    "back.sharded" = "region"

    [methods]
    "demo.echo" = { backend = "back.echo", doc = "echo the params back" }
    "demo.sensitive" = "back."
    "demo.sharded" = "back.sharded"
"#;

/// Build a broker with the test policy and auth tables.
fn test_broker(opts: BrokerOptions) -> Arc<Broker> {
    let policy = Policy::load_str(POLICY).unwrap();
    let auth = StaticTokenBackend::single_method(
        "password",
        [
            ("alice", "sesame"),
            ("bob", "hunter2"),
            ("carol", "admin"),
            ("wrk", "workwork"),
        ],
    );
    Broker::new(policy, Arc::new(auth), opts)
}

/// One in-memory peer talking to the broker.
struct Peer {
    /// Peer-side reader, line framed.
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    /// Peer-side writer.
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    /// Connect a new peer to `broker`.
    fn connect(broker: &Arc<Broker>, from: &str) -> Peer {
        let (peer_io, switch_io) = tokio::io::duplex(64 * 1024);
        let conn = broker.new_connection(from.to_owned());
        let (sr, sw) = tokio::io::split(switch_io);
        tokio::spawn(conn.run(sr.compat(), sw.compat_write()));
        let (pr, pw) = tokio::io::split(peer_io);
        Peer {
            lines: BufReader::new(pr).lines(),
            writer: pw,
        }
    }

    /// Send one frame.
    async fn send(&mut self, frame: Value) {
        let mut text = frame.to_string();
        text.push('\n');
        self.writer.write_all(text.as_bytes()).await.unwrap();
    }

    /// Receive one frame, with a test timeout.
    async fn recv(&mut self) -> Value {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed unexpectedly");
        serde_json::from_str(&line).unwrap()
    }

    /// Expect the switch side to close the connection.
    async fn expect_eof(&mut self) {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(line, None);
    }

    /// Expect no frame to arrive for a little while.
    async fn expect_silence(&mut self) {
        let got = timeout(Duration::from_millis(300), self.lines.next_line()).await;
        assert!(got.is_err(), "unexpected frame: {:?}", got);
    }

    /// Authenticate as `who`.
    async fn hello(&mut self, who: &str, token: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": "hello",
            "method": "rpcswitch.hello",
            "params": {"method": "password", "who": who, "token": token},
        }))
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["result"][0], true, "hello failed: {}", reply);
    }

    /// Announce a backend, returning the assigned worker id.
    async fn announce(&mut self, method: &str, filter: Option<Value>) -> u64 {
        let mut params = json!({"method": method});
        if let Some(filter) = filter {
            params["filter"] = filter;
        }
        self.send(json!({
            "jsonrpc": "2.0",
            "id": "announce",
            "method": "rpcswitch.announce",
            "params": params,
        }))
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["result"]["msg"], "success", "announce failed: {}", reply);
        reply["result"]["worker_id"].as_u64().unwrap()
    }
}

/// Connect and authenticate a worker serving `backend`.
async fn worker(broker: &Arc<Broker>, backend: &str, filter: Option<Value>) -> Peer {
    let mut w = Peer::connect(broker, "test:worker");
    w.hello("wrk", "workwork").await;
    w.announce(backend, filter).await;
    w
}

#[tokio::test]
async fn hello_announce_call_happy_path() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.echo", None).await;

    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "demo.echo", "params": {"x": 1}}))
        .await;

    // The worker sees the rewritten request with untouched params.
    let fwd = w.recv().await;
    assert_eq!(fwd["method"], "back.echo");
    assert_eq!(fwd["params"], json!({"x": 1}));
    assert_eq!(fwd["id"], 1);
    assert_eq!(fwd["rpcswitch"]["vcookie"], "eatme");
    assert_eq!(fwd["rpcswitch"]["who"], "bob");
    let vci = fwd["rpcswitch"]["vci"].as_str().unwrap().to_owned();
    assert!(!vci.is_empty());

    // The worker answers on the same channel; the client gets the result.
    w.send(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {"ok": true},
        "rpcswitch": {"vcookie": "eatme", "vci": vci},
    }))
    .await;
    let reply = c.recv().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"], json!({"ok": true}));

    // The call shows up in the stats.
    c.send(json!({"jsonrpc": "2.0", "id": 2, "method": "rpcswitch.get_stats", "params": {}}))
        .await;
    let stats = c.recv().await;
    assert_eq!(stats["result"]["methods"]["demo.echo"], 1);
    assert_eq!(stats["result"]["workers"], 1);
    assert!(stats["result"]["chunks"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn acl_denial_reaches_no_worker() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.sensitive", None).await;

    // alice is not in the admins ACL.
    let mut c = Peer::connect(&broker, "test:client");
    c.hello("alice", "sesame").await;
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "demo.sensitive", "params": {}}))
        .await;
    let reply = c.recv().await;
    assert_eq!(reply["error"]["code"], -32009);

    // carol is.
    let mut admin = Peer::connect(&broker, "test:admin");
    admin.hello("carol", "admin").await;
    admin
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "demo.sensitive", "params": {}}))
        .await;
    let fwd = w.recv().await;
    assert_eq!(fwd["method"], "back.sensitive");
    assert_eq!(fwd["rpcswitch"]["who"], "carol");
}

#[tokio::test]
async fn no_worker_registered() {
    let broker = test_broker(BrokerOptions::default());
    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "demo.echo", "params": {}}))
        .await;
    let reply = c.recv().await;
    assert_eq!(reply["error"]["code"], -32003);
}

#[tokio::test]
async fn unknown_method_and_bad_state() {
    let broker = test_broker(BrokerOptions::default());
    let mut c = Peer::connect(&broker, "test:client");

    // Anything but hello is rejected before authentication.
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "rpcswitch.get_stats", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32002);
    c.send(json!({"jsonrpc": "2.0", "id": 2, "method": "demo.echo", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32002);

    // An unrecognized name in the reserved namespace is method-not-found,
    // not a state error, even before authentication.
    c.send(json!({"jsonrpc": "2.0", "id": 3, "method": "rpcswitch.bogus", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32601);

    c.hello("bob", "hunter2").await;
    c.send(json!({"jsonrpc": "2.0", "id": 4, "method": "nowhere.nothing", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32601);
    c.send(json!({"jsonrpc": "2.0", "id": 5, "method": "rpcswitch.bogus", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32601);
}

#[tokio::test]
async fn failed_hello_closes_connection() {
    let broker = test_broker(BrokerOptions::default());
    let mut c = Peer::connect(&broker, "test:client");
    c.send(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "rpcswitch.hello",
        "params": {"method": "password", "who": "bob", "token": "wrong"},
    }))
    .await;
    let reply = c.recv().await;
    assert_eq!(reply["result"][0], false);
    c.expect_eof().await;
}

#[tokio::test]
async fn filtered_dispatch() {
    let broker = test_broker(BrokerOptions::default());
    let mut eu = worker(&broker, "back.sharded", Some(json!({"region": "eu"}))).await;
    let mut us = worker(&broker, "back.sharded", Some(json!({"region": "us"}))).await;

    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;

    // Routed by the region parameter.
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "demo.sharded",
                  "params": {"region": "us", "x": 1}}))
        .await;
    let fwd = us.recv().await;
    assert_eq!(fwd["params"]["region"], "us");
    eu.expect_silence().await;

    // Missing filter parameter.
    c.send(json!({"jsonrpc": "2.0", "id": 2, "method": "demo.sharded", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32010);

    // No worker for that bucket.
    c.send(json!({"jsonrpc": "2.0", "id": 3, "method": "demo.sharded",
                  "params": {"region": "apac"}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32003);
}

#[tokio::test]
async fn announce_filter_shape_is_enforced() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = Peer::connect(&broker, "test:worker");
    w.hello("wrk", "workwork").await;

    // A filtered backend needs a filter...
    w.send(json!({"jsonrpc": "2.0", "id": 1, "method": "rpcswitch.announce",
                  "params": {"method": "back.sharded"}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32010);

    // ...with exactly the declared key...
    w.send(json!({"jsonrpc": "2.0", "id": 2, "method": "rpcswitch.announce",
                  "params": {"method": "back.sharded", "filter": {"zone": "eu"}}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32010);

    // ...and a scalar value.
    w.send(json!({"jsonrpc": "2.0", "id": 3, "method": "rpcswitch.announce",
                  "params": {"method": "back.sharded", "filter": {"region": ["eu"]}}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32010);

    // An unfiltered backend refuses any filter.
    w.send(json!({"jsonrpc": "2.0", "id": 4, "method": "rpcswitch.announce",
                  "params": {"method": "back.echo", "filter": {"region": "eu"}}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32010);

    // Announcing outside the allowed ACL fails closed.
    let mut outsider = Peer::connect(&broker, "test:outsider");
    outsider.hello("bob", "hunter2").await;
    outsider
        .send(json!({"jsonrpc": "2.0", "id": 5, "method": "rpcswitch.announce",
                     "params": {"method": "back.echo"}}))
        .await;
    assert_eq!(outsider.recv().await["error"]["code"], -32008);
}

#[tokio::test]
async fn round_robin_and_least_loaded() {
    let broker = test_broker(BrokerOptions::default());
    let mut w1 = worker(&broker, "back.echo", None).await;
    let mut w2 = worker(&broker, "back.echo", None).await;
    let mut w3 = worker(&broker, "back.echo", None).await;

    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;

    // Three calls with equal refcounts: one per worker.
    for id in 1..=3 {
        c.send(json!({"jsonrpc": "2.0", "id": id, "method": "demo.echo", "params": {"n": id}}))
            .await;
    }
    // With equal refcounts the calls spread one per worker, and nobody
    // answers, so every worker now has one call in flight.
    let mut seen = Vec::new();
    for w in [&mut w1, &mut w2, &mut w3] {
        let fwd = w.recv().await;
        assert_eq!(fwd["method"], "back.echo");
        seen.push(fwd["id"].as_i64().unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);

    // A fourth call lands somewhere, putting that worker at two in flight.
    c.send(json!({"jsonrpc": "2.0", "id": 10, "method": "demo.echo", "params": {}}))
        .await;
    let (most_loaded, fwd) = recv_one(&mut w1, &mut w2, &mut w3).await;
    assert_eq!(fwd["method"], "back.echo");

    // The next two calls prefer the less loaded workers.
    c.send(json!({"jsonrpc": "2.0", "id": 11, "method": "demo.echo", "params": {}}))
        .await;
    c.send(json!({"jsonrpc": "2.0", "id": 12, "method": "demo.echo", "params": {}}))
        .await;
    for _ in 0..2 {
        let (idx, fwd) = recv_one(&mut w1, &mut w2, &mut w3).await;
        assert_eq!(fwd["method"], "back.echo");
        assert_ne!(idx, most_loaded, "a call landed on the most loaded worker");
    }
}

/// Receive the next forwarded frame from whichever of three workers gets
/// it, returning which one.
async fn recv_one(w1: &mut Peer, w2: &mut Peer, w3: &mut Peer) -> (usize, Value) {
    let deadline = Duration::from_secs(5);
    tokio::select! {
        line = w1.lines.next_line() => {
            (0, serde_json::from_str(&line.unwrap().unwrap()).unwrap())
        }
        line = w2.lines.next_line() => {
            (1, serde_json::from_str(&line.unwrap().unwrap()).unwrap())
        }
        line = w3.lines.next_line() => {
            (2, serde_json::from_str(&line.unwrap().unwrap()).unwrap())
        }
        () = tokio::time::sleep(deadline) => panic!("no worker received the call"),
    }
}

#[tokio::test]
async fn worker_disconnect_mid_call() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.echo", None).await;

    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;
    c.send(json!({"jsonrpc": "2.0", "id": 7, "method": "demo.echo", "params": {}}))
        .await;
    let fwd = w.recv().await;
    let vci = fwd["rpcswitch"]["vci"].as_str().unwrap().to_owned();

    // The worker goes away without answering.
    drop(w);

    // One synthesized error for the outstanding request...
    let gone = c.recv().await;
    assert_eq!(gone["id"], 7);
    assert_eq!(gone["error"]["code"], -32006);
    assert_eq!(gone["rpcswitch"]["vci"], vci.as_str());

    // ...then exactly one channel_gone notification.
    let note = c.recv().await;
    assert_eq!(note["method"], "rpcswitch.channel_gone");
    assert_eq!(note["params"]["channel"], vci.as_str());

    // Nothing further follows for that channel.
    c.expect_silence().await;
}

#[tokio::test]
async fn nested_request_from_worker() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.echo", None).await;

    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "demo.echo", "params": {}}))
        .await;
    let fwd = w.recv().await;
    let vci = fwd["rpcswitch"]["vci"].as_str().unwrap().to_owned();

    // The worker asks the client something over the same channel.
    w.send(json!({"jsonrpc": "2.0", "id": 99, "method": "progress.confirm",
                  "params": {"pct": 50},
                  "rpcswitch": {"vcookie": "eatme", "vci": vci}}))
        .await;
    let nested = c.recv().await;
    assert_eq!(nested["method"], "progress.confirm");
    assert_eq!(nested["id"], 99);

    // The client answers; the worker sees it.
    c.send(json!({"jsonrpc": "2.0", "id": 99, "result": true,
                  "rpcswitch": {"vcookie": "eatme", "vci": vci}}))
        .await;
    let answer = w.recv().await;
    assert_eq!(answer["id"], 99);
    assert_eq!(answer["result"], true);

    // Unknown channels are rejected; bad cookies are a channel error.
    w.send(json!({"jsonrpc": "2.0", "id": 100, "method": "x.y", "params": {},
                  "rpcswitch": {"vcookie": "eatme", "vci": "nonesuch"}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32005);
    w.send(json!({"jsonrpc": "2.0", "id": 101, "method": "x.y", "params": {},
                  "rpcswitch": {"vcookie": "spitout", "vci": vci}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32004);
}

#[tokio::test]
async fn ping_pong_keeps_worker_alive() {
    let opts = {
        let mut o = BrokerOptions::default();
        o.ping_interval = Duration::from_millis(100);
        o.pong_timeout = Duration::from_millis(400);
        o
    };
    let broker = test_broker(opts);
    let mut w = worker(&broker, "back.echo", None).await;

    // Answer two probes; the connection stays up.
    for _ in 0..2 {
        let ping = w.recv().await;
        assert_eq!(ping["method"], "rpcswitch.ping");
        let id = ping["id"].clone();
        w.send(json!({"jsonrpc": "2.0", "id": id, "result": "pong?"}))
            .await;
    }

    // An incoming ping gets the canonical answer.
    w.send(json!({"jsonrpc": "2.0", "id": "my-ping", "method": "rpcswitch.ping", "params": {}}))
        .await;
    loop {
        let frame = w.recv().await;
        if frame["id"] == "my-ping" {
            assert_eq!(frame["result"], "pong?");
            break;
        }
        // A probe may interleave; answer it and keep looking.
        assert_eq!(frame["method"], "rpcswitch.ping");
        let id = frame["id"].clone();
        w.send(json!({"jsonrpc": "2.0", "id": id, "result": "pong?"}))
            .await;
    }
}

#[tokio::test]
async fn unanswered_ping_disconnects() {
    let opts = {
        let mut o = BrokerOptions::default();
        o.ping_interval = Duration::from_millis(100);
        o.pong_timeout = Duration::from_millis(200);
        o
    };
    let broker = test_broker(opts);
    let mut w = worker(&broker, "back.echo", None).await;

    let ping = w.recv().await;
    assert_eq!(ping["method"], "rpcswitch.ping");
    // Saying nothing: the deadline passes and the switch hangs up.
    w.expect_eof().await;
}

#[tokio::test]
async fn withdraw_removes_worker() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.echo", None).await;
    w.send(json!({"jsonrpc": "2.0", "id": 1, "method": "rpcswitch.withdraw",
                  "params": {"method": "back.echo"}}))
        .await;
    assert_eq!(w.recv().await["result"], true);

    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;
    c.send(json!({"jsonrpc": "2.0", "id": 2, "method": "demo.echo", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32003);

    // Withdrawing twice is an error.
    w.send(json!({"jsonrpc": "2.0", "id": 3, "method": "rpcswitch.withdraw",
                  "params": {"method": "back.echo"}}))
        .await;
    assert_eq!(w.recv().await["error"]["code"], -32010);
}

#[tokio::test]
async fn worker_ids_are_unique_and_increasing() {
    let broker = test_broker(BrokerOptions::default());
    let mut w1 = worker(&broker, "back.echo", None).await;
    let w2_id = {
        let mut w2 = Peer::connect(&broker, "test:worker2");
        w2.hello("wrk", "workwork").await;
        w2.announce("back.echo", None).await
    };
    // A second announce on the same connection keeps the id.
    let again = w1.announce("back.sensitive", None).await;
    w1.send(json!({"jsonrpc": "2.0", "id": 9, "method": "rpcswitch.get_clients", "params": {}}))
        .await;
    let clients = w1.recv().await;
    let ids: Vec<u64> = clients["result"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["worker_id"].as_u64())
        .collect();
    assert!(w2_id > 0);
    assert_eq!(again, ids[0]);
    assert!(ids.windows(2).all(|p| p[0] < p[1]));
}

#[tokio::test]
async fn introspection_shapes() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.sharded", Some(json!({"region": "eu"}))).await;

    w.send(json!({"jsonrpc": "2.0", "id": 1, "method": "rpcswitch.get_methods", "params": {}}))
        .await;
    let methods = w.recv().await;
    assert_eq!(methods["result"]["demo.echo"], "echo the params back");
    assert!(methods["result"].as_object().unwrap().contains_key("demo.sharded"));

    w.send(json!({"jsonrpc": "2.0", "id": 2, "method": "rpcswitch.get_method_details",
                  "params": {"method": "demo.sharded"}}))
        .await;
    let details = w.recv().await;
    assert_eq!(details["result"]["backend"], "back.sharded");
    assert_eq!(details["result"]["filter"], "region");
    assert_eq!(details["result"]["workers"][0]["filter"]["region"], "eu");

    w.send(json!({"jsonrpc": "2.0", "id": 3, "method": "rpcswitch.get_workers", "params": {}}))
        .await;
    let workers = w.recv().await;
    assert_eq!(workers["result"]["back.sharded"][0]["workername"], "wrk");
}

#[tokio::test]
async fn policy_reload_applies_to_new_calls() {
    let broker = test_broker(BrokerOptions::default());
    let mut w = worker(&broker, "back.echo", None).await;
    let mut c = Peer::connect(&broker, "test:client");
    c.hello("bob", "hunter2").await;

    // demo.extra does not exist yet.
    c.send(json!({"jsonrpc": "2.0", "id": 1, "method": "demo.extra", "params": {}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32601);

    let amended = format!(
        "{}\n{}",
        POLICY, r#""demo.extra" = { backend = "back.echo" }"#
    );
    broker.reload_policy(Policy::load_str(&amended).unwrap());

    // The same call now routes to the worker announced before the reload.
    c.send(json!({"jsonrpc": "2.0", "id": 2, "method": "demo.extra", "params": {}}))
        .await;
    let fwd = w.recv().await;
    assert_eq!(fwd["method"], "back.echo");
    assert_eq!(fwd["id"], 2);
}

#[tokio::test]
async fn malformed_frames() {
    let broker = test_broker(BrokerOptions::default());
    let mut c = Peer::connect(&broker, "test:client");

    // A non-object frame is an invalid request, and fatal.
    c.send(json!([1, 2, 3])).await;
    assert_eq!(c.recv().await["error"]["code"], -32600);
    c.expect_eof().await;

    // Unparseable bytes get a parse error before the close.
    let mut c = Peer::connect(&broker, "test:client");
    c.writer.write_all(b"this is not json\n").await.unwrap();
    assert_eq!(c.recv().await["error"]["code"], -32700);
    c.expect_eof().await;

    // An internal method without an id is answered with not-notification.
    let mut c = Peer::connect(&broker, "test:client");
    c.send(json!({"jsonrpc": "2.0", "method": "rpcswitch.hello",
                  "params": {"method": "password", "who": "bob", "token": "hunter2"}}))
        .await;
    assert_eq!(c.recv().await["error"]["code"], -32000);
}
