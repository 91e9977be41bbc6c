use super::*;
use crate::test_support::{FakeConnection, FakeServer, FakeVoiceUdp, WAIT};
use crate::voice_stream::ENCRYPTION_MODE;
use tokio::time::timeout;

const BOT_ID: &str = "7";
const GUILD: &str = "100";

struct Harness {
    client: Arc<GatewayClient>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Receiver<GatewayEvent>,
    conn: FakeConnection,
    server: FakeServer,
}

async fn start(configure: impl FnOnce(&mut GatewayConfig)) -> Harness {
    let mut server = FakeServer::bind().await;
    let mut config = GatewayConfig {
        gateway_url: server.url.clone(),
        reconnect_delay: Duration::from_millis(20),
        ..GatewayConfig::new("bot-token")
    };
    configure(&mut config);
    let (client, commands) = GatewayClient::connect(config).await.expect("connect");
    let events = client.subscribe_events();
    let mut conn = server.accept().await;
    let identify = conn.recv().await;
    assert_eq!(identify["op"], 2);
    Harness {
        client,
        commands,
        events,
        conn,
        server,
    }
}

async fn dispatch(conn: &mut FakeConnection, seq: u64, event: &str, d: Value) {
    conn.send(json!({ "op": 0, "s": seq, "t": event, "d": d })).await;
}

async fn next_event(events: &mut broadcast::Receiver<GatewayEvent>) -> GatewayEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("gateway event timed out")
        .expect("gateway events closed")
}

fn chat(content: &str) -> Value {
    json!({
        "id": "900",
        "channel_id": "55",
        "guild_id": GUILD,
        "author": { "id": "31", "username": "listener" },
        "content": content,
    })
}

/// READY plus a GUILD_CREATE, waiting until both are applied.
async fn ready_with_guild(h: &mut Harness, voice_states: Value) {
    dispatch(
        &mut h.conn,
        1,
        "READY",
        json!({ "user": { "id": BOT_ID, "username": "bot", "bot": true }, "session_id": "gw" }),
    )
    .await;
    assert_eq!(
        next_event(&mut h.events).await,
        GatewayEvent::Ready {
            user_id: UserId::new(BOT_ID)
        }
    );
    dispatch(
        &mut h.conn,
        2,
        "GUILD_CREATE",
        json!({ "id": GUILD, "name": "hideout", "voice_states": voice_states }),
    )
    .await;
    assert_eq!(
        next_event(&mut h.events).await,
        GatewayEvent::GuildAvailable(GuildId::new(GUILD))
    );
}

#[tokio::test]
async fn identify_carries_token_intents_and_properties() {
    let mut server = FakeServer::bind().await;
    let config = GatewayConfig {
        gateway_url: server.url.clone(),
        client_name: "tester".into(),
        ..GatewayConfig::new("bot-token")
    };
    let (client, _commands) = GatewayClient::connect(config).await.expect("connect");
    let mut conn = server.accept().await;

    let identify = conn.recv().await;
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], "bot-token");
    assert_eq!(identify["d"]["intents"], intents::VOICE_BOT);
    assert_eq!(identify["d"]["properties"]["os"], std::env::consts::OS);
    assert_eq!(identify["d"]["properties"]["browser"], "tester");
    assert_eq!(identify["d"]["properties"]["device"], "tester");

    client.close().await;
}

#[tokio::test]
async fn only_prefixed_messages_become_commands() {
    let mut h = start(|_| {}).await;

    dispatch(&mut h.conn, 1, "MESSAGE_CREATE", chat("hello there")).await;
    dispatch(&mut h.conn, 2, "MESSAGE_CREATE", chat(".play some song")).await;
    dispatch(&mut h.conn, 3, "MESSAGE_UPDATE", chat(".skip")).await;
    dispatch(&mut h.conn, 4, "MESSAGE_CREATE", chat(".stop")).await;

    let play = timeout(WAIT, h.commands.recv())
        .await
        .expect("command timed out")
        .expect("commands closed");
    assert_eq!(play.name(), "play");
    assert_eq!(play.rest(0), "some song");
    assert_eq!(play.message.author.username, "listener");

    let stop = timeout(WAIT, h.commands.recv())
        .await
        .expect("command timed out")
        .expect("commands closed");
    assert_eq!(stop.name(), "stop");
    assert_eq!(h.client.sequence(), Some(4));

    h.client.close().await;
}

#[tokio::test]
async fn heartbeat_echoes_last_sequence() {
    let mut h = start(|_| {}).await;

    h.conn
        .send(json!({ "op": 10, "d": { "heartbeat_interval": 40 } }))
        .await;
    let first = h.conn.recv_op(1).await;
    assert!(first["d"].is_null());

    dispatch(&mut h.conn, 42, "MESSAGE_UPDATE", json!({})).await;
    let mut echoed = false;
    for _ in 0..20 {
        if h.conn.recv_op(1).await["d"] == 42 {
            echoed = true;
            break;
        }
    }
    assert!(echoed, "heartbeat never carried sequence 42");

    h.conn.send(json!({ "op": 1, "d": null })).await;
    assert_eq!(h.conn.recv_op(1).await["d"], 42);

    h.client.close().await;
}

#[tokio::test]
async fn guild_create_tracks_voice_states_with_guild_id() {
    let mut h = start(|_| {}).await;
    ready_with_guild(
        &mut h,
        json!([{ "channel_id": "300", "user_id": "31", "session_id": "s31" }]),
    )
    .await;

    let guild = h
        .client
        .guild(&GuildId::new(GUILD))
        .await
        .expect("guild known");
    assert_eq!(guild.name, "hideout");
    let listener = h
        .client
        .voice_state(&GuildId::new(GUILD), &UserId::new("31"))
        .await
        .expect("voice state");
    assert_eq!(listener.guild_id, Some(GuildId::new(GUILD)));
    assert_eq!(listener.channel_id, Some(ChannelId::new("300")));

    dispatch(
        &mut h.conn,
        3,
        "VOICE_STATE_UPDATE",
        json!({ "guild_id": GUILD, "channel_id": "301", "user_id": "31", "session_id": "s31" }),
    )
    .await;
    dispatch(&mut h.conn, 4, "MESSAGE_CREATE", chat(".sync")).await;
    timeout(WAIT, h.commands.recv()).await.expect("sync");
    let moved = h
        .client
        .voice_state(&GuildId::new(GUILD), &UserId::new("31"))
        .await
        .expect("voice state");
    assert_eq!(moved.channel_id, Some(ChannelId::new("301")));
    assert_eq!(h.client.user_id().await, Some(UserId::new(BOT_ID)));

    h.client.close().await;
}

#[tokio::test]
async fn guild_delete_evicts_the_guild() {
    let mut h = start(|_| {}).await;
    ready_with_guild(&mut h, json!([])).await;

    dispatch(&mut h.conn, 3, "GUILD_DELETE", json!({ "id": GUILD })).await;
    assert_eq!(
        next_event(&mut h.events).await,
        GatewayEvent::GuildRemoved(GuildId::new(GUILD))
    );
    assert!(h.client.guild(&GuildId::new(GUILD)).await.is_none());
    assert!(h.client.guild_ids().await.is_empty());

    h.client.close().await;
}

#[tokio::test]
async fn join_fails_for_unknown_guild_and_before_ready() {
    let mut h = start(|_| {}).await;
    let channel = ChannelId::new("300");

    assert!(matches!(
        h.client.join_voice(&GuildId::new("404"), &channel).await,
        Err(GatewayError::UnknownGuild(_))
    ));

    dispatch(
        &mut h.conn,
        1,
        "GUILD_CREATE",
        json!({ "id": GUILD, "name": "hideout" }),
    )
    .await;
    next_event(&mut h.events).await;
    assert!(matches!(
        h.client.join_voice(&GuildId::new(GUILD), &channel).await,
        Err(GatewayError::NotReady)
    ));

    h.client.close().await;
}

#[tokio::test]
async fn join_without_own_voice_state_fails() {
    let mut h = start(|_| {}).await;
    ready_with_guild(&mut h, json!([])).await;
    let guild = GuildId::new(GUILD);
    let channel = ChannelId::new("300");

    let join = h.client.join_voice(&guild, &channel);
    let conn = &mut h.conn;
    let serve = async {
        let request = conn.recv_op(4).await;
        assert_eq!(request["d"]["channel_id"], "300");
        dispatch(
            conn,
            3,
            "VOICE_SERVER_UPDATE",
            json!({ "token": "vt", "guild_id": GUILD, "endpoint": "voice.example:443" }),
        )
        .await;
    };
    let (joined, ()) = tokio::join!(join, serve);
    assert!(matches!(joined, Err(GatewayError::MissingVoiceState(_))));

    h.client.close().await;
}

#[tokio::test]
async fn join_times_out_without_voice_server() {
    let mut h = start(|config| config.voice_join_timeout = Some(Duration::from_millis(100))).await;
    ready_with_guild(&mut h, json!([])).await;

    assert!(matches!(
        h.client
            .join_voice(&GuildId::new(GUILD), &ChannelId::new("300"))
            .await,
        Err(GatewayError::VoiceServerTimeout { .. })
    ));

    h.client.close().await;
}

#[tokio::test]
async fn concurrent_joins_share_one_voice_connection() {
    let mut h = start(|_| {}).await;
    ready_with_guild(&mut h, json!([])).await;
    let mut voice_server = FakeServer::bind().await;
    let udp = FakeVoiceUdp::bind().await;
    let guild = GuildId::new(GUILD);
    let channel = ChannelId::new("300");

    let first = h.client.join_voice(&guild, &channel);
    let second = h.client.join_voice(&guild, &channel);
    let conn = &mut h.conn;
    let voice_url = voice_server.url.clone();
    let serve = async {
        let request = conn.recv_op(4).await;
        assert_eq!(request["d"]["guild_id"], GUILD);
        assert_eq!(request["d"]["self_deaf"], true);
        assert_eq!(request["d"]["self_mute"], false);
        dispatch(
            conn,
            3,
            "VOICE_STATE_UPDATE",
            json!({ "guild_id": GUILD, "channel_id": "300", "user_id": BOT_ID, "session_id": "own-voice" }),
        )
        .await;
        dispatch(
            conn,
            4,
            "VOICE_SERVER_UPDATE",
            json!({ "token": "vt", "guild_id": GUILD, "endpoint": voice_url }),
        )
        .await;

        let mut voice = voice_server.accept().await;
        let identify = voice.recv_op(0).await;
        assert_eq!(identify["d"]["session_id"], "own-voice");
        assert_eq!(identify["d"]["user_id"], BOT_ID);
        assert_eq!(identify["d"]["token"], "vt");
        voice
            .send(json!({ "op": 8, "d": { "heartbeat_interval": 1000.0 } }))
            .await;
        voice
            .send(json!({
                "op": 2,
                "d": { "ssrc": 11, "ip": "127.0.0.1", "port": udp.addr.port(), "modes": [ENCRYPTION_MODE] }
            }))
            .await;
        voice.recv_op(1).await;
        voice
            .send(json!({ "op": 4, "d": { "mode": ENCRYPTION_MODE, "secret_key": vec![1u8; 32] } }))
            .await;
        voice
    };

    let (first, second, _voice) = tokio::join!(first, second, serve);
    let first = first.expect("first join");
    let second = second.expect("second join");
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_ready());
    let cached = h.client.voice_client(&guild).await.expect("cached");
    assert!(Arc::ptr_eq(&first, &cached));

    h.client.leave_voice(&guild).await.expect("leave");
    let leave = h.conn.recv_op(4).await;
    assert!(leave["d"]["channel_id"].is_null());
    assert!(first.is_closed());
    assert!(h.client.voice_client(&guild).await.is_none());

    h.client.close().await;
}

#[tokio::test]
async fn reconnect_request_redials_and_identifies_again() {
    let mut h = start(|_| {}).await;

    h.conn.send(json!({ "op": 7, "d": null })).await;
    let mut again = h.server.accept().await;
    assert_eq!(again.recv().await["op"], 2);
    assert_eq!(next_event(&mut h.events).await, GatewayEvent::Reconnected);

    h.client.close().await;
}

#[tokio::test]
async fn invalid_session_closes_the_client() {
    let mut h = start(|_| {}).await;

    h.conn.send(json!({ "op": 9, "d": false })).await;
    assert_eq!(
        next_event(&mut h.events).await,
        GatewayEvent::Error("invalid session".into())
    );
    assert_eq!(next_event(&mut h.events).await, GatewayEvent::Closed);
    assert!(h.client.is_closed());
    assert!(timeout(WAIT, h.commands.recv())
        .await
        .expect("commands")
        .is_none());
}

async fn assert_abandoned(h: &mut Harness) {
    match next_event(&mut h.events).await {
        GatewayEvent::Error(reason) => assert!(!reason.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(next_event(&mut h.events).await, GatewayEvent::Closed);
    assert!(h.client.is_closed());
    assert!(h
        .server
        .try_accept(Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn undecodable_frame_closes_the_client() {
    let mut h = start(|_| {}).await;

    h.conn.send_raw("{ this is not json").await;
    assert_abandoned(&mut h).await;
}

#[tokio::test]
async fn dispatch_with_invalid_payload_closes_the_client() {
    let mut h = start(|_| {}).await;

    dispatch(&mut h.conn, 1, "GUILD_CREATE", json!({ "name": "no id" })).await;
    assert_abandoned(&mut h).await;
    assert!(h.client.guild(&GuildId::new(GUILD)).await.is_none());
    assert!(timeout(WAIT, h.commands.recv())
        .await
        .expect("commands")
        .is_none());
}
