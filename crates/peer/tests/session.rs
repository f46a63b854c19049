//! Two peers negotiating through a live rendezvous server and moving files
//! over the in-memory transport.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use airdelivery_peer::{MemoryNetwork, NegotiatorConfig, PeerSession, SessionEvent, SignalingError};
use airdelivery_protocol::ControlFrame;
use airdelivery_rendezvous::{RendezvousServer, ServerConfig};
use airdelivery_transfer::{
    ChannelError, CloseReason, EngineConfig, OutgoingFile, ReceivedFile, SendStatus, TransferEvent,
};

type Events = mpsc::UnboundedReceiver<SessionEvent>;

async fn start_server() -> (Arc<RendezvousServer>, String) {
    let server = RendezvousServer::new(ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..ServerConfig::default()
    });
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    for _ in 0..100 {
        if server.port().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let url = format!("ws://127.0.0.1:{}", server.port().await);
    (server, url)
}

async fn session(url: &str, network: &MemoryNetwork) -> (PeerSession, Events) {
    let config = NegotiatorConfig {
        signaling_url: url.to_owned(),
        ..NegotiatorConfig::default()
    };
    PeerSession::connect(config, EngineConfig::default(), Arc::new(network.clone()))
        .await
        .unwrap()
}

async fn wait_for(events: &mut Events, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("session ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn flight_transfer_end_to_end() {
    let (server, url) = start_server().await;
    let network = MemoryNetwork::default();
    let (a, mut a_events) = session(&url, &network).await;
    let (b, mut b_events) = session(&url, &network).await;

    let code = a.create_flight().await.unwrap();
    b.join_flight(&code).await.unwrap();

    wait_for(&mut a_events, |e| matches!(e, SessionEvent::Connected)).await;
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::Connected)).await;
    assert!(a.is_connected());

    let data = pattern_bytes(300_000);
    let id = a
        .engine()
        .enqueue(OutgoingFile::from_bytes("photos/cat.jpg", data.clone()))
        .unwrap();

    let received = wait_for(&mut b_events, |e| {
        matches!(e, SessionEvent::Transfer(TransferEvent::Received { transfer_id, .. }) if *transfer_id == id)
    })
    .await;
    match received {
        SessionEvent::Transfer(TransferEvent::Received {
            relative_path,
            file,
            ..
        }) => {
            assert_eq!(relative_path, "photos/cat.jpg");
            assert_eq!(file, ReceivedFile::Memory(data));
        }
        _ => unreachable!(),
    }
    wait_for(&mut a_events, |e| {
        matches!(e, SessionEvent::Transfer(TransferEvent::SendStatusChanged { status: SendStatus::Done, .. }))
    })
    .await;

    a.disconnect().await;
    a.disconnect().await;
    assert!(!a.is_connected());
    // The member sees both the closed channel and the owner leaving, in
    // either order.
    let (mut closed, mut owner_gone) = (false, false);
    while !(closed && owner_gone) {
        match wait_for(&mut b_events, |e| {
            matches!(e, SessionEvent::Disconnected(_) | SessionEvent::Roster(_))
        })
        .await
        {
            SessionEvent::Disconnected(_) => closed = true,
            SessionEvent::Roster(roster) => owner_gone |= !roster.owner_connected,
            _ => unreachable!(),
        }
    }
    assert!(!b.is_connected());
    server.shutdown();
}

#[tokio::test]
async fn direct_connect_then_transport_failure() {
    let (server, url) = start_server().await;
    let network = MemoryNetwork::default();
    let (a, mut a_events) = session(&url, &network).await;
    let (b, mut b_events) = session(&url, &network).await;

    a.request_nearby().await.unwrap();
    let b_id = b.identity().id.clone();
    wait_for(&mut a_events, |e| {
        matches!(e, SessionEvent::Nearby(users) if users.iter().any(|u| u.id == b_id))
    })
    .await;

    a.request_to_connect(&b_id).await.unwrap();
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::FlightStarted(_))).await;
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::Connected)).await;
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::Connected)).await;

    network.fail_all();
    let down = wait_for(&mut a_events, |e| matches!(e, SessionEvent::Disconnected(_))).await;
    assert!(matches!(down, SessionEvent::Disconnected(CloseReason::Failed)));
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::Disconnected(_))).await;
    assert_eq!(b.engine().live_receives(), 0);
    assert!(!b.is_connected());
    server.shutdown();
}

#[tokio::test]
async fn joining_unknown_flight_is_rejected() {
    let (server, url) = start_server().await;
    let network = MemoryNetwork::default();
    let (b, _events) = session(&url, &network).await;

    match b.join_flight("ZZZZZZ").await {
        Err(SignalingError::Rejected(reason)) => assert_eq!(reason, "Flight not found"),
        other => panic!("unexpected {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn control_frames_need_an_open_channel() {
    let (server, url) = start_server().await;
    let network = MemoryNetwork::default();
    let (a, _events) = session(&url, &network).await;

    let frame = ControlFrame::Pause {
        transfer_id: "t1".into(),
    };
    assert!(matches!(a.send_control(&frame), Err(ChannelError::Closed)));
    server.shutdown();
}
