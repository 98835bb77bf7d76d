//! ControlClient against a scripted server built from the raw protocol pieces

use std::time::Duration;

use tcptunnel_client::{ClientConfig, ClientError, ClientEvent, ClientExit, ControlClient};
use tcptunnel_proto::{
    decode_fields, method_of, verify, ControlChannel, ControlMessage, Fields, CONNECTED_GREETING,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn fake_server() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn config(port: u16) -> ClientConfig {
    ClientConfig::builder()
        .server("127.0.0.1", port)
        .name("A")
        .secret("x")
        .verify_timeout(Duration::from_millis(500))
        .heartbeat_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

async fn next_fields(channel: &mut ControlChannel) -> Option<Fields> {
    let frame = timeout(WAIT, channel.recv_frame()).await.unwrap().unwrap()?;
    Some(decode_fields(&frame).unwrap())
}

/// Accept the client and check its handshake
async fn accept_handshake(listener: &TcpListener) -> ControlChannel {
    let (stream, _) = listener.accept().await.unwrap();
    let mut channel = ControlChannel::new(stream).unwrap();
    let hello = next_fields(&mut channel).await.unwrap();
    assert!(verify("x", &hello).is_valid());
    assert_eq!(method_of(&hello), Some("verify"));
    assert_eq!(hello["name"], "A");
    channel
}

fn greeting() -> ControlMessage {
    ControlMessage::Message {
        message: CONNECTED_GREETING.to_string(),
    }
}

#[tokio::test]
async fn test_conflict_ends_client() {
    let (listener, port) = fake_server().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let client = ControlClient::connect(config(port))
        .await
        .unwrap()
        .with_events(tx);
    let run = tokio::spawn(client.run());

    let mut server = accept_handshake(&listener).await;
    server.send_signed("x", &greeting()).await.unwrap();
    server.send_signed("x", &ControlMessage::Conflict).await.unwrap();

    let exit = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(exit, ClientExit::Conflict);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ClientEvent::Verified));
    assert!(seen.contains(&ClientEvent::ServerMessage {
        message: CONNECTED_GREETING.to_string()
    }));
}

#[tokio::test]
async fn test_unverifiable_server_message_is_fatal() {
    let (listener, port) = fake_server().await;
    let run = tokio::spawn(ControlClient::connect(config(port)).await.unwrap().run());

    let mut server = accept_handshake(&listener).await;
    server.send_signed("not-x", &greeting()).await.unwrap();

    assert_eq!(timeout(WAIT, run).await.unwrap().unwrap(), ClientExit::VerifyFailed);
}

#[tokio::test]
async fn test_rejected_handshake_is_fatal() {
    let (listener, port) = fake_server().await;
    let run = tokio::spawn(ControlClient::connect(config(port)).await.unwrap().run());

    let mut server = accept_handshake(&listener).await;
    server.send_signed("x", &ControlMessage::Rejected).await.unwrap();

    assert_eq!(timeout(WAIT, run).await.unwrap().unwrap(), ClientExit::VerifyFailed);
}

#[tokio::test]
async fn test_silent_server_fails_verification_after_grace() {
    let (listener, port) = fake_server().await;
    let run = tokio::spawn(ControlClient::connect(config(port)).await.unwrap().run());

    let _server = accept_handshake(&listener).await;
    assert_eq!(timeout(WAIT, run).await.unwrap().unwrap(), ClientExit::VerifyFailed);
}

#[tokio::test]
async fn test_server_close_reports_disconnect() {
    let (listener, port) = fake_server().await;
    let run = tokio::spawn(ControlClient::connect(config(port)).await.unwrap().run());

    let mut server = accept_handshake(&listener).await;
    server.send_signed("x", &greeting()).await.unwrap();
    server.close().await.unwrap();
    drop(server);

    assert_eq!(
        timeout(WAIT, run).await.unwrap().unwrap(),
        ClientExit::Disconnected {
            was_verified: true,
            error: None
        }
    );
}

#[tokio::test]
async fn test_unreachable_local_target_sends_close_session() {
    let (listener, port) = fake_server().await;
    let dead_port = {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    };
    let client = ControlClient::connect(config(port)).await.unwrap();
    let handle = client.handle();
    let run = tokio::spawn(client.run());

    let mut server = accept_handshake(&listener).await;
    server.send_signed("x", &greeting()).await.unwrap();
    server
        .send_signed(
            "x",
            &ControlMessage::NewSession {
                session: "s1".to_string(),
                local_port: dead_port,
                remote_port: port,
            },
        )
        .await
        .unwrap();

    let reply = next_fields(&mut server).await.unwrap();
    assert!(verify("x", &reply).is_valid());
    assert_eq!(method_of(&reply), Some("close_session"));
    assert_eq!(reply["session"], "s1");

    handle.shutdown();
    assert_eq!(timeout(WAIT, run).await.unwrap().unwrap(), ClientExit::Shutdown);
}

#[tokio::test]
async fn test_heartbeat_records_round_trip() {
    let (listener, port) = fake_server().await;
    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..config(port)
    };
    let client = ControlClient::connect(config).await.unwrap();
    let handle = client.handle();
    let run = tokio::spawn(client.run());

    let mut server = accept_handshake(&listener).await;
    server.send_signed("x", &greeting()).await.unwrap();

    let ping = next_fields(&mut server).await.unwrap();
    assert_eq!(method_of(&ping), Some("ping"));
    let sent_at = ping["sent_at"].as_i64().unwrap();
    server
        .send_signed("x", &ControlMessage::Pong { sent_at })
        .await
        .unwrap();

    timeout(WAIT, async {
        while handle.last_ping().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pong was not recorded");
    let info = handle.last_ping().unwrap();
    assert!(info.delay_ms >= 0);
    assert!(info.received_at >= sent_at);

    handle.shutdown();
    assert_eq!(timeout(WAIT, run).await.unwrap().unwrap(), ClientExit::Shutdown);
}

#[tokio::test]
async fn test_connect_rejects_zero_heartbeat() {
    let (_listener, port) = fake_server().await;
    let mut config = config(port);
    config.heartbeat_interval = Duration::ZERO;

    let result = ControlClient::connect(config).await;
    assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
}
