//! Exercises the full discovery -> auth -> label -> broadcast -> request ->
//! request_many -> peer-gone lifecycle over real loopback sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use portbus::{Config, Envelope, Error, Peer};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn spawn_master(secret: &str, host: &str) -> Peer {
    let peer = Peer::connect(Config::new(secret).host(host).unwrap()).await.unwrap();
    settle().await;
    peer
}

async fn spawn_worker(secret: &str, host: &str) -> Peer {
    let peer = Peer::connect(Config::new(secret).url(format!("ws://{host}/nextcord-ipc")).unwrap()).await.unwrap();
    settle().await;
    peer
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_reaches_every_other_connection_and_the_master() {
    let master = spawn_master("s3cr3t", "127.0.0.1:48201").await;
    let worker_a = spawn_worker("s3cr3t", "127.0.0.1:48201").await;
    let worker_b = spawn_worker("s3cr3t", "127.0.0.1:48201").await;

    let seen_master = Arc::new(Mutex::new(Vec::<Envelope>::new()));
    let seen_b = Arc::new(Mutex::new(Vec::<Envelope>::new()));
    {
        let seen_master = seen_master.clone();
        master.on("receive", move |e| seen_master.lock().unwrap().push(e.clone()));
    }
    {
        let seen_b = seen_b.clone();
        worker_b.on("receive", move |e| seen_b.lock().unwrap().push(e.clone()));
    }

    worker_a.send_message("ping", serde_json::json!({ "n": 1 })).await.unwrap();
    settle().await;

    assert_eq!(seen_master.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap()[0].kind, "ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn label_addressed_request_gets_a_reply_from_the_labelled_worker() {
    let _master = spawn_master("s3cr3t", "127.0.0.1:48211").await;
    let requester = spawn_worker("s3cr3t", "127.0.0.1:48211").await;
    let echoer = spawn_worker("s3cr3t", "127.0.0.1:48211").await;

    echoer.set_labels(vec!["echo".to_string()]).await.unwrap();
    settle().await;

    let echoer_clone = echoer.clone();
    echoer.on("ping", move |envelope| {
        let echoer = echoer_clone.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            echoer.reply(&envelope, serde_json::json!({ "pong": true })).await.unwrap();
        });
    });

    let reply = requester
        .request("ping", serde_json::json!({}), Some("echo"), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply.data["pong"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_many_collects_a_reply_from_every_labelled_connection() {
    let _master = spawn_master("s3cr3t", "127.0.0.1:48221").await;
    let requester = spawn_worker("s3cr3t", "127.0.0.1:48221").await;
    let worker_a = spawn_worker("s3cr3t", "127.0.0.1:48221").await;
    let worker_b = spawn_worker("s3cr3t", "127.0.0.1:48221").await;

    worker_a.set_labels(vec!["collector".to_string()]).await.unwrap();
    worker_b.set_labels(vec!["collector".to_string()]).await.unwrap();
    settle().await;

    for w in [&worker_a, &worker_b] {
        let w2 = w.clone();
        w.on("sum", move |envelope| {
            let w2 = w2.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                w2.reply(&envelope, serde_json::json!({ "got_it": true })).await.unwrap();
            });
        });
    }

    let replies = requester
        .request_many("sum", serde_json::json!({}), "collector", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_many_from_the_master_resolves_early_when_a_worker_disconnects() {
    let master = spawn_master("s3cr3t", "127.0.0.1:48231").await;
    let worker_a = spawn_worker("s3cr3t", "127.0.0.1:48231").await;
    let worker_b = spawn_worker("s3cr3t", "127.0.0.1:48231").await;

    worker_a.set_labels(vec!["flaky".to_string()]).await.unwrap();
    worker_b.set_labels(vec!["flaky".to_string()]).await.unwrap();
    settle().await;

    let wb = worker_b.clone();
    worker_b.on("ask", move |envelope| {
        let wb = wb.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            wb.reply(&envelope, serde_json::json!({ "ok": true })).await.unwrap();
        });
    });
    drop(worker_a);
    settle().await;

    let replies = master
        .request_many("ask", serde_json::json!({}), "flaky", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_response_request_fails_when_the_only_target_disappears() {
    let _master = spawn_master("s3cr3t", "127.0.0.1:48241").await;
    let requester = spawn_worker("s3cr3t", "127.0.0.1:48241").await;
    let target = spawn_worker("s3cr3t", "127.0.0.1:48241").await;
    target.set_labels(vec!["lonely".to_string()]).await.unwrap();
    settle().await;

    drop(target);
    settle().await;

    let result = requester.request("ask", serde_json::json!({}), Some("lonely"), Some(Duration::from_secs(2))).await;
    assert!(matches!(result, Err(Error::PeerGone)));
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_secrets_are_rejected_during_the_handshake() {
    let _master = spawn_master("s3cr3t", "127.0.0.1:48251").await;
    let result = Peer::connect(Config::new("wrong-secret").url("ws://127.0.0.1:48251/nextcord-ipc").unwrap()).await;
    assert!(matches!(result, Err(Error::AuthRejected(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_discovery_elects_one_master_and_the_rest_join_as_workers() {
    let range = 48261..48264u16;
    let first = Peer::connect(Config::new("s3cr3t").with_port_range(range.clone())).await.unwrap();
    settle().await;
    let second = Peer::connect(Config::new("s3cr3t").with_port_range(range)).await.unwrap();
    settle().await;

    let seen = Arc::new(Mutex::new(Vec::<Envelope>::new()));
    {
        let seen = seen.clone();
        first.on("receive", move |e| seen.lock().unwrap().push(e.clone()));
    }
    second.send_message("hello", serde_json::json!({})).await.unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}
