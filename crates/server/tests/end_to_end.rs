//! Real server on a loopback port, real client over a real socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use robe_client::{ClientConfig, Credentials, ReconnectConfig, RetryConfig, RobeClient};
use robe_server::tasks::{builtin::register_builtin_tasks, TaskContext, TaskRegistry};
use robe_server::{AppState, ServerConfig, SOCKET_PATH};
use robe_shared::{events, Auth, SignatureAuth, TaskError};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const TASK_TIMEOUT: Duration = Duration::from_millis(300);

struct Harness {
    url: String,
    auth: Arc<SignatureAuth>,
    secret_calls: Arc<AtomicUsize>,
}

async fn start_server() -> Harness {
    let secret_calls = Arc::new(AtomicUsize::new(0));

    let registry = TaskRegistry::new();
    register_builtin_tasks(&registry);
    registry.register("echo", false, |ctx: TaskContext| {
        ctx.arg::<i64>("x").map(|x| x * 2)
    });
    registry.register("slow", false, |_| {
        std::thread::sleep(Duration::from_secs(2));
        Ok::<_, TaskError>("too late")
    });
    let calls = Arc::clone(&secret_calls);
    registry.register("secret", true, move |ctx: TaskContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, TaskError>(ctx.user_id.unwrap_or_default())
    });

    let config = ServerConfig {
        task_timeout: TASK_TIMEOUT,
        ..ServerConfig::default()
    };
    let auth = Arc::new(SignatureAuth::from_seed([7u8; 32]));
    let state = AppState::with_auth(&config, registry, auth.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(robe_server::serve(listener, state));

    Harness {
        url: format!("ws://{}{}", addr, SOCKET_PATH),
        auth,
        secret_calls,
    }
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        url: url.to_string(),
        reconnect: ReconnectConfig {
            reconnect_interval: Duration::from_millis(20),
            ..ReconnectConfig::default()
        },
        retry: RetryConfig {
            max_attempts: 20,
            base_delay: Duration::from_millis(10),
        },
    }
}

async fn connected_client(url: &str) -> RobeClient {
    let client = RobeClient::connect(&client_config(url)).unwrap();
    let pong = tokio::time::timeout(
        Duration::from_secs(5),
        client.tasks().perform("ping", &(), false),
    )
    .await
    .unwrap();
    assert_eq!(pong, Ok(json!("pong")));
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_resolves_with_doubled_argument() {
    let server = start_server().await;
    let client = RobeClient::connect(&client_config(&server.url)).unwrap();

    // Sent before the socket is up: the send is retried until it goes out.
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.tasks().perform("echo", &json!({"x": 1}), false),
    )
    .await
    .unwrap();

    assert_eq!(result, Ok(json!(2)));
    assert_eq!(client.tasks().pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_are_correlated() {
    let server = start_server().await;
    let client = connected_client(&server.url).await;

    let promises: Vec<_> = (0..20)
        .map(|x| client.tasks().perform("echo", &json!({ "x": x }), false))
        .collect();
    for (x, promise) in promises.into_iter().enumerate() {
        let value = tokio::time::timeout(Duration::from_secs(5), promise)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, json!(x as i64 * 2));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_task_rejects_with_timeout() {
    let server = start_server().await;
    let client = connected_client(&server.url).await;

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.tasks().perform("slow", &(), false),
    )
    .await
    .unwrap();

    let error = outcome.unwrap_err();
    assert!(error.is_timeout(), "expected a timeout, got {:?}", error);
    assert!(started.elapsed() < TASK_TIMEOUT + Duration::from_millis(700));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tampered_signature_is_unauthorized() {
    let server = start_server().await;
    let client = connected_client(&server.url).await.with_credentials(Credentials {
        user_id: "alice".into(),
        signature: server.auth.signature_for("mallory"),
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.tasks().perform("secret", &(), true),
    )
    .await
    .unwrap();

    let error = outcome.unwrap_err();
    assert!(matches!(error, TaskError::Unauthorized { .. }));
    assert!(error.to_string().contains("unauthorized"));
    assert_eq!(server.secret_calls.load(Ordering::SeqCst), 0);

    client.tasks().set_credentials(Some(Credentials {
        user_id: "alice".into(),
        signature: server.auth.signature_for("alice"),
    }));
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.tasks().perform("secret", &(), true),
    )
    .await
    .unwrap();
    assert_eq!(outcome, Ok(json!("alice")));
    assert_eq!(server.secret_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_task_is_rejected() {
    let server = start_server().await;
    let client = connected_client(&server.url).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.tasks().perform("nope", &(), false),
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        Err(TaskError::UnknownTask {
            task: "nope".into()
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_channel_events_fan_out_to_subscribers() {
    let server = start_server().await;
    let alice = connected_client(&server.url).await;
    let bob = connected_client(&server.url).await;

    let (acks_tx, mut acks_rx) = mpsc::unbounded_channel::<&'static str>();
    let (said_tx, mut said_rx) = mpsc::unbounded_channel::<Value>();

    let alice_room = alice.channels().open_channel("room").unwrap();
    let tx = acks_tx.clone();
    alice_room.on(events::SUBSCRIBED, move |_| {
        let _ = tx.send("alice");
    });

    let bob_room = bob.channels().open_channel("room").unwrap();
    let tx = acks_tx.clone();
    bob_room.on(events::SUBSCRIBED, move |_| {
        let _ = tx.send("bob");
    });
    bob_room.on("say", move |content| {
        let _ = said_tx.send(content.clone());
    });

    let mut acked = Vec::new();
    while acked.len() < 2 {
        let who = tokio::time::timeout(Duration::from_secs(5), acks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        acked.push(who);
    }

    alice_room.send("say", json!({"text": "hi bob"})).unwrap();
    let heard = tokio::time::timeout(Duration::from_secs(5), said_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(heard, json!({"text": "hi bob"}));
}
