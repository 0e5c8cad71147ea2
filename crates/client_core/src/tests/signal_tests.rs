use super::*;

use tokio::sync::broadcast;

use crate::{
    events::event_bus,
    test_support::{wait_for_event, Attempt, RecordingGateway, ScriptedConnector, ServerEnd},
};

struct Fixture {
    channel: Arc<SignalChannel>,
    connector: Arc<ScriptedConnector>,
    server_ends: mpsc::UnboundedReceiver<ServerEnd>,
    typing: Arc<TypingCoordinator>,
    session: SessionContext,
    events: broadcast::Receiver<ClientEvent>,
}

async fn fixture(script: &[Attempt]) -> Fixture {
    let gateway = RecordingGateway::new();
    let session = SessionContext::new();
    session
        .login("token-1", UserId::new_random())
        .await
        .expect("login");
    let bus = event_bus();
    let events = bus.subscribe();
    let timers = Arc::new(TimerRegistry::new());
    let outbox = SignalOutbox::new();
    let typing = TypingCoordinator::new(
        gateway,
        session.clone(),
        Arc::clone(&timers),
        outbox.clone(),
        bus.clone(),
        Duration::from_secs(2),
    );
    let (connector, server_ends) = ScriptedConnector::new(script);
    let channel = SignalChannel::new(
        connector.clone(),
        session.clone(),
        ReconnectPolicy::default(),
        Arc::clone(&typing),
        timers,
        outbox,
        bus,
    );
    Fixture {
        channel,
        connector,
        server_ends,
        typing,
        session,
        events,
    }
}

impl Fixture {
    async fn wait_state(&self, wanted: ConnectionState) {
        let mut states = self.channel.watch_state();
        tokio::time::timeout(Duration::from_secs(60), states.wait_for(|state| *state == wanted))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    async fn accepted(&mut self) -> ServerEnd {
        tokio::time::timeout(Duration::from_secs(60), self.server_ends.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("connector dropped")
    }
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy {
        max_attempts: 10,
        ..ReconnectPolicy::default()
    };
    let delays: Vec<u64> = (0..9)
        .filter_map(|attempt| policy.delay_for(attempt))
        .map(|delay| delay.as_secs())
        .collect();
    assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30, 30, 30]);
    assert_eq!(policy.delay_for(9), None);
    assert_eq!(policy.delay_for(40), None);
}

#[tokio::test]
async fn no_connection_is_attempted_without_a_credential() {
    let fx = fixture(&[Attempt::Accept]).await;
    fx.session.logout().await;

    let err = fx.channel.start().await.expect_err("must refuse");
    assert!(matches!(err, ChannelError::MissingCredential));
    tokio::task::yield_now().await;
    assert!(fx.connector.attempts().is_empty());
    assert_eq!(fx.channel.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_then_give_up_after_five_attempts() {
    let mut fx = fixture(&[]).await;
    fx.channel.start().await.expect("start");

    let mut delays = Vec::new();
    loop {
        let event = wait_for_event(&mut fx.events, |event| {
            matches!(
                event,
                ClientEvent::ReconnectScheduled { .. } | ClientEvent::SignalGaveUp { .. }
            )
        })
        .await;
        match event {
            ClientEvent::ReconnectScheduled { delay, .. } => delays.push(delay),
            ClientEvent::SignalGaveUp { attempts } => {
                assert_eq!(attempts, 5);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(
        delays,
        [1, 2, 4, 8].map(Duration::from_secs).to_vec()
    );
    let attempts = fx.connector.attempts();
    assert_eq!(attempts.len(), 5);
    let gaps: Vec<Duration> = attempts
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .collect();
    assert_eq!(gaps, [1, 2, 4, 8].map(Duration::from_secs).to_vec());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.connector.attempts().len(), 5);
    assert_eq!(fx.channel.state(), ConnectionState::Closed(CLOSE_ABNORMAL));
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_the_backoff() {
    let mut fx = fixture(&[Attempt::Refuse, Attempt::Refuse, Attempt::Accept]).await;
    fx.channel.start().await.expect("start");

    let server = fx.accepted().await;
    fx.wait_state(ConnectionState::Open).await;
    server.close(CLOSE_ABNORMAL);

    let mut delays = Vec::new();
    while delays.len() < 3 {
        if let ClientEvent::ReconnectScheduled { delay, .. } =
            wait_for_event(&mut fx.events, |event| {
                matches!(event, ClientEvent::ReconnectScheduled { .. })
            })
            .await
        {
            delays.push(delay.as_secs());
        }
    }
    assert_eq!(delays, [1, 2, 1]);
}

#[tokio::test(start_paused = true)]
async fn normal_closure_is_terminal() {
    let mut fx = fixture(&[Attempt::Accept, Attempt::Accept]).await;
    fx.channel.start().await.expect("start");

    let server = fx.accepted().await;
    fx.wait_state(ConnectionState::Open).await;
    server.close(CLOSE_NORMAL);
    fx.wait_state(ConnectionState::Closed(CLOSE_NORMAL)).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_sends_a_normal_close_frame_and_stays_down() {
    let mut fx = fixture(&[Attempt::Accept, Attempt::Accept]).await;
    fx.channel.start().await.expect("start");
    let mut server = fx.accepted().await;
    fx.wait_state(ConnectionState::Open).await;

    fx.channel.close().await;

    assert_eq!(server.from_client.recv().await, Some(OutboundFrame::Close));
    assert_eq!(fx.channel.state(), ConnectionState::Closed(CLOSE_NORMAL));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn typing_frames_reach_the_coordinator_and_unknown_frames_are_ignored() {
    let mut fx = fixture(&[Attempt::Accept]).await;
    fx.channel.start().await.expect("start");
    let server = fx.accepted().await;
    fx.wait_state(ConnectionState::Open).await;

    let peer = UserId::new_random();
    server.push_text(r#"{"type":"user_status","userId":"x","online":true}"#);
    server.push_text(r#"{"type":"brand_new_feature"}"#);
    server.push_text("not json at all");
    server.push_text(&format!(
        r#"{{"type":"typing_indicator","senderId":"{peer}","isTyping":true}}"#
    ));

    let event = wait_for_event(&mut fx.events, |event| {
        matches!(event, ClientEvent::TypingChanged { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::TypingChanged {
            peer_id: peer,
            is_typing: true
        }
    );
    assert!(fx.typing.is_peer_typing(peer).await);
    assert_eq!(fx.channel.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn outbound_hints_are_dropped_unless_open() {
    let mut fx = fixture(&[Attempt::Accept]).await;
    let outbox = fx.channel.outbox();
    let peer = UserId::new_random();

    assert!(!outbox.send_typing(peer, true).await);

    fx.channel.start().await.expect("start");
    let mut server = fx.accepted().await;
    fx.wait_state(ConnectionState::Open).await;

    assert!(outbox.send_typing(peer, true).await);
    let Some(OutboundFrame::Text(text)) = server.from_client.recv().await else {
        panic!("expected a text frame");
    };
    let frame: OutboundSignal = serde_json::from_str(&text).expect("json");
    assert_eq!(
        frame,
        OutboundSignal::TypingIndicator {
            receiver_id: peer,
            is_typing: true
        }
    );

    server.close(CLOSE_ABNORMAL);
    fx.wait_state(ConnectionState::Closed(CLOSE_ABNORMAL)).await;
    assert!(!outbox.send_typing(peer, false).await);
}

#[test]
fn websocket_url_carries_the_token() {
    let connector = WsConnector::new("ws://127.0.0.1:8080/api/ws");
    let url = connector.url_with_token("abc def").expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8080/api/ws?token=abc+def");

    let connector = WsConnector::new("not a url");
    assert!(matches!(
        connector.url_with_token("t"),
        Err(ChannelError::InvalidUrl { .. })
    ));
}
