//! Pairing tests against a live agent instance on loopback

use l4proxy_proto::{write_token, ClientEvent, EventKind, Token};
use l4proxy_relay::{AgentInstance, InstanceConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn start_instance(
    pending_timeout: Option<Duration>,
) -> (AgentInstance, mpsc::Receiver<ClientEvent>) {
    let config = InstanceConfig {
        name: "test-client".to_string(),
        display_name: "test".to_string(),
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        pending_timeout,
        ..Default::default()
    };
    let (instance, mut events) = AgentInstance::bind(config, CancellationToken::new())
        .await
        .unwrap();
    instance.start().unwrap();

    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    match first.kind() {
        EventKind::Assigned { public_address } => {
            assert_eq!(public_address, instance.public_address());
        }
        other => panic!("Expected public address first, got {:?}", other),
    }

    (instance, events)
}

async fn next_token(events: &mut mpsc::Receiver<ClientEvent>, internal: &str) -> Token {
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    match event.kind() {
        EventKind::NewUser {
            token,
            internal_address,
        } => {
            assert_eq!(internal_address, internal);
            token.parse().unwrap()
        }
        other => panic!("Expected new user, got {:?}", other),
    }
}

async fn dial_back(instance: &AgentInstance, token: Token) -> TcpStream {
    let mut stream = TcpStream::connect(instance.internal_bind_addr()).await.unwrap();
    write_token(&mut stream, token).await.unwrap();
    stream
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

async fn wait_until_empty(instance: &AgentInstance) {
    timeout(WAIT, async {
        while instance.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions were not removed");
}

#[tokio::test]
async fn test_user_and_callback_are_spliced() {
    let (instance, mut events) = start_instance(None).await;

    let mut user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;
    assert_eq!(token, Token::new(1));

    let mut agent = dial_back(&instance, token).await;

    user.write_all(b"hello agent").await.unwrap();
    let mut buf = [0u8; 11];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello agent");

    agent.write_all(b"hello user").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(WAIT, user.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello user");

    assert_eq!(instance.users(), vec![user.local_addr().unwrap()]);

    // Either side closing tears down the session and frees the token
    drop(user);
    assert_closed(&mut agent).await;
    wait_until_empty(&instance).await;

    instance.close().await;
}

#[tokio::test]
async fn test_fragmented_token_still_matches() {
    let (instance, mut events) = start_instance(None).await;

    let mut user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;

    let encoded = token.encode();
    let mut agent = TcpStream::connect(instance.internal_bind_addr()).await.unwrap();
    agent.set_nodelay(true).unwrap();
    for chunk in encoded.chunks(3) {
        agent.write_all(chunk).await.unwrap();
        agent.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    agent.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    timeout(WAIT, user.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"x");

    instance.close().await;
}

#[tokio::test]
async fn test_unknown_token_is_closed() {
    let (instance, mut events) = start_instance(None).await;

    let _user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;

    let mut stranger = dial_back(&instance, Token::new(token.value() + 100)).await;
    assert_closed(&mut stranger).await;

    // The real session is still waiting
    assert_eq!(instance.session_count(), 1);
    instance.close().await;
}

#[tokio::test]
async fn test_duplicate_callback_is_rejected() {
    let (instance, mut events) = start_instance(None).await;

    let mut user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;

    let mut first = dial_back(&instance, token).await;
    first.write_all(b"a").await.unwrap();
    let mut buf = [0u8; 1];
    timeout(WAIT, user.read_exact(&mut buf)).await.unwrap().unwrap();

    let mut second = dial_back(&instance, token).await;
    assert_closed(&mut second).await;

    // The first pairing is unaffected
    user.write_all(b"b").await.unwrap();
    timeout(WAIT, first.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"b");

    instance.close().await;
}

#[tokio::test]
async fn test_concurrent_users_get_distinct_tokens() {
    let (instance, mut events) = start_instance(None).await;

    let mut user1 = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token1 = next_token(&mut events, instance.internal_address()).await;
    let mut user2 = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token2 = next_token(&mut events, instance.internal_address()).await;
    assert!(token2 > token1);

    // Dial back in reverse order
    let mut agent2 = dial_back(&instance, token2).await;
    let mut agent1 = dial_back(&instance, token1).await;

    user1.write_all(b"1").await.unwrap();
    user2.write_all(b"2").await.unwrap();

    let mut buf = [0u8; 1];
    timeout(WAIT, agent1.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"1");
    timeout(WAIT, agent2.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"2");

    assert_eq!(instance.users().len(), 2);
    instance.close().await;
}

#[tokio::test]
async fn test_pending_user_expires() {
    let (instance, mut events) = start_instance(Some(Duration::from_millis(100))).await;

    let mut user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;

    assert_closed(&mut user).await;
    wait_until_empty(&instance).await;

    // A late callback finds nothing to pair with
    let mut late = dial_back(&instance, token).await;
    assert_closed(&mut late).await;

    instance.close().await;
}

#[tokio::test]
async fn test_user_hangup_leaves_no_pending_session() {
    let (instance, mut events) = start_instance(None).await;

    let user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;
    assert_eq!(instance.users(), vec![user.local_addr().unwrap()]);

    drop(user);
    wait_until_empty(&instance).await;
    assert!(instance.users().is_empty());

    // The token is gone, so a late callback is refused
    let mut late = dial_back(&instance, token).await;
    assert_closed(&mut late).await;

    instance.close().await;
}

#[tokio::test]
async fn test_bytes_sent_before_callback_are_delivered() {
    let (instance, mut events) = start_instance(None).await;

    let mut user = TcpStream::connect(instance.public_bind_addr()).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;
    user.write_all(b"SSH-2.0-client\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut agent = dial_back(&instance, token).await;
    let mut buf = [0u8; 16];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"SSH-2.0-client\r\n");

    agent.write_all(b"ok").await.unwrap();
    let mut reply = [0u8; 2];
    timeout(WAIT, user.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply, b"ok");

    instance.close().await;
}

#[tokio::test]
async fn test_callback_pairs_during_user_burst() {
    let (instance, mut events) = start_instance(None).await;
    let public = instance.public_bind_addr();

    let mut first = TcpStream::connect(public).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;

    let drainer = tokio::spawn(async move { while events.recv().await.is_some() {} });
    let burst = tokio::spawn(async move {
        let mut users = Vec::new();
        for _ in 0..64 {
            if let Ok(user) = TcpStream::connect(public).await {
                users.push(user);
            }
        }
        users
    });

    let mut agent = dial_back(&instance, token).await;
    agent.write_all(b"first").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, first.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"first");

    let users = timeout(WAIT, burst).await.unwrap().unwrap();
    instance.close().await;
    drop(users);
    timeout(WAIT, drainer).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_tears_down_everything() {
    let (instance, mut events) = start_instance(None).await;
    let public = instance.public_bind_addr();

    let mut pending_user = TcpStream::connect(public).await.unwrap();
    let _ = next_token(&mut events, instance.internal_address()).await;

    let mut active_user = TcpStream::connect(public).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;
    let mut agent = dial_back(&instance, token).await;
    agent.write_all(b"z").await.unwrap();
    let mut buf = [0u8; 1];
    timeout(WAIT, active_user.read_exact(&mut buf)).await.unwrap().unwrap();

    timeout(WAIT, instance.close()).await.unwrap();

    assert_closed(&mut pending_user).await;
    assert_closed(&mut active_user).await;
    assert_closed(&mut agent).await;
    assert_eq!(instance.session_count(), 0);
    assert!(TcpStream::connect(public).await.is_err());
}

#[tokio::test]
async fn test_parent_cancellation_stops_instance() {
    let parent = CancellationToken::new();
    let config = InstanceConfig {
        name: "child".to_string(),
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..Default::default()
    };
    let (instance, mut events) = AgentInstance::bind(config, parent.child_token())
        .await
        .unwrap();
    instance.start().unwrap();
    let _ = events.recv().await;

    parent.cancel();
    timeout(WAIT, instance.cancelled()).await.unwrap();
    assert!(instance.is_closed());
    instance.close().await;
}

#[tokio::test]
async fn test_drain_lets_active_relay_finish() {
    let (instance, mut events) = start_instance(None).await;
    let public = instance.public_bind_addr();

    let mut pending_user = TcpStream::connect(public).await.unwrap();
    let _ = next_token(&mut events, instance.internal_address()).await;

    let mut active_user = TcpStream::connect(public).await.unwrap();
    let token = next_token(&mut events, instance.internal_address()).await;
    let mut agent = dial_back(&instance, token).await;
    agent.write_all(b"!").await.unwrap();
    let mut ack = [0u8; 1];
    timeout(WAIT, active_user.read_exact(&mut ack)).await.unwrap().unwrap();

    let instance = std::sync::Arc::new(instance);
    let draining = {
        let instance = instance.clone();
        tokio::spawn(async move { instance.drain().await })
    };

    // Pending users are dropped and no new users are accepted
    assert_closed(&mut pending_user).await;
    timeout(WAIT, instance.cancelled()).await.unwrap();

    // The active pair still relays
    active_user.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"still here");
    assert!(!draining.is_finished());

    drop(active_user);
    timeout(WAIT, draining).await.unwrap().unwrap();
    assert_closed(&mut agent).await;
    wait_until_empty(&instance).await;
}
