use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use glam::Vec3;
use replicant::{
    Behaviour, BehaviourTag, DEFAULT_PORT, Field, Message, MessageKind, Mode, NetworkBehaviour,
    PrefabFactory, RpcError, RpcTable, Session, SessionConfig, SessionError, SessionEvent,
    SpawnInfo, SyncField, Value, ValueKind,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

struct Avatar {
    health: Field<i32>,
    reports: Vec<(i32, f32, String)>,
    announcements: Vec<String>,
}

impl NetworkBehaviour for Avatar {
    const TAG: BehaviourTag = BehaviourTag("Avatar");

    fn fields_mut(&mut self) -> Vec<&mut dyn SyncField> {
        vec![&mut self.health]
    }

    fn rpc_table() -> RpcTable<Self> {
        RpcTable::<Self>::new()
            .authority(
                "report",
                &[ValueKind::I32, ValueKind::F32, ValueKind::Str],
                |avatar, _ctx, args| {
                    avatar
                        .reports
                        .push((args.i32(0)?, args.f32(1)?, args.str(2)?.to_string()));
                    Ok(())
                },
            )
            .authority("retire", &[], |_avatar, ctx, _args| {
                ctx.session.despawn(ctx.object_id)?;
                Ok(())
            })
            .clients("announce", &[ValueKind::Str], |avatar, _ctx, args| {
                avatar.announcements.push(args.str(0)?.to_string());
                Ok(())
            })
    }
}

struct AvatarFactory;

impl PrefabFactory for AvatarFactory {
    fn instantiate(&self, _info: &SpawnInfo) -> Vec<Box<dyn Behaviour>> {
        vec![Box::new(Avatar {
            health: Field::new(100),
            reports: Vec::new(),
            announcements: Vec::new(),
        })]
    }
}

fn new_session() -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = Session::new(SessionConfig::default(), AvatarFactory);
    session.register_prefab("PlayerPrefab");
    session.register_prefab("EnemyPrefab");
    session.register_behaviour::<Avatar>();
    session
}

async fn wait_for(timeout_ms: u64, condition: impl Fn() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

async fn join(port: u16) -> Session {
    let client = new_session();
    client.start_client(localhost(port)).await.unwrap();
    assert!(
        wait_for(2000, || client
            .local_player()
            .is_some_and(|p| p.is_connected() && p.id() != u32::MAX))
        .await,
        "client never joined"
    );
    client
}

fn health(session: &Session, id: u32) -> Option<i32> {
    session.with_behaviour::<Avatar, _>(id, |avatar| *avatar.health.get())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mode_transitions() {
    let session = new_session();
    assert_eq!(session.mode(), Mode::Inactive);
    session.stop().await;

    session.start_server(next_port()).await.unwrap();
    assert_eq!(session.mode(), Mode::Server);
    assert!(session.is_authority() && !session.is_client());
    assert!(session.local_player().is_none());
    assert!(matches!(
        session.start_host(next_port()).await,
        Err(SessionError::AlreadyActive(Mode::Server))
    ));

    session.stop().await;
    assert_eq!(session.mode(), Mode::Inactive);
    assert!(session.local_addr().is_none());

    session.start_host(next_port()).await.unwrap();
    assert_eq!(session.mode(), Mode::Host);
    assert!(session.is_authority() && session.is_client());
    let local = session.local_player().unwrap();
    assert_eq!(local.id(), 0);
    assert!(local.is_local());
    assert_eq!(session.players(), vec![local]);

    session.stop().await;
    assert!(session.players().is_empty());
    assert!(session.local_player().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operations_check_the_role() {
    let session = new_session();
    let port = next_port();
    assert!(matches!(
        session.send_to_server(&Message::chat("early")),
        Err(SessionError::Inactive)
    ));

    session.start_server(port).await.unwrap();
    assert!(matches!(
        session.send_to_server(&Message::chat("wrong side")),
        Err(SessionError::NotClient)
    ));

    let client = join(port).await;
    assert!(wait_for(2000, || session.players().len() == 1).await);
    let player = session.players().remove(0);
    let local = client.local_player().unwrap();

    assert!(matches!(
        client.spawn("PlayerPrefab", &local, Vec3::ZERO),
        Err(SessionError::NotAuthority)
    ));
    assert!(matches!(
        client.despawn(1),
        Err(SessionError::NotAuthority)
    ));
    assert!(matches!(
        session.spawn("Nope", &player, Vec3::ZERO),
        Err(SessionError::UnknownPrefab(_))
    ));
    assert!(matches!(
        session.spawn("PlayerPrefab", &local, Vec3::ZERO),
        Err(SessionError::UnknownPlayer(_))
    ));

    client.stop().await;
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chat_reaches_subscribers_with_sender() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    server.subscribe(MessageKind::ChatText, move |message, sender| {
        if let Message::ChatText { text } = message {
            sink.lock().unwrap().push((text.clone(), sender.id()));
        }
        Ok(())
    });

    let client = join(port).await;
    let client_id = client.local_player().unwrap().id();
    client.send_to_server(&Message::chat("hello")).unwrap();

    assert!(wait_for(2000, || received.lock().unwrap().len() == 1).await);
    assert_eq!(
        received.lock().unwrap()[0],
        ("hello".to_string(), client_id)
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_and_despawn_replicate() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();
    let client = join(port).await;
    assert!(wait_for(2000, || server.players().len() == 1).await);

    let owner = server.players().remove(0);
    let object = server
        .spawn("PlayerPrefab", &owner, Vec3::new(1.0, 2.0, 3.0))
        .unwrap();
    let id = object.network_id();
    assert!(object.is_spawned());
    assert!(!object.is_locally_owned());

    assert!(wait_for(2000, || client.object(id).is_some()).await);
    let replica = client.object(id).unwrap();
    assert_eq!(replica.prefab(), "PlayerPrefab");
    assert_eq!(replica.position(), Vec3::new(1.0, 2.0, 3.0));
    assert_eq!(replica.owner_id(), owner.id());
    assert!(replica.is_locally_owned());
    assert_eq!(replica.behaviour_tags(), vec![Avatar::TAG]);

    let enemy = server.spawn("EnemyPrefab", &owner, Vec3::ZERO).unwrap();
    assert!(enemy.network_id() > id);

    assert!(server.despawn(id).unwrap());
    assert!(!server.despawn(id).unwrap());
    assert!(!object.is_spawned());
    assert!(wait_for(2000, || client.object(id).is_none()).await);
    assert!(!replica.is_spawned());
    assert!(client.object(enemy.network_id()).is_some());

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[allow(clippy::approx_constant)]
async fn test_rpc_arguments_arrive_intact() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();
    let client = join(port).await;
    assert!(wait_for(2000, || server.players().len() == 1).await);

    let owner = server.players().remove(0);
    let id = server
        .spawn("PlayerPrefab", &owner, Vec3::ZERO)
        .unwrap()
        .network_id();
    assert!(wait_for(2000, || client.object(id).is_some()).await);

    client
        .call_authority::<Avatar>(
            id,
            "report",
            &[Value::I32(42), Value::F32(3.14), Value::from("hi")],
        )
        .unwrap();
    assert!(
        wait_for(2000, || server
            .with_behaviour::<Avatar, _>(id, |a| a.reports.len())
            == Some(1))
        .await
    );
    let report = server
        .with_behaviour::<Avatar, _>(id, |a| a.reports[0].clone())
        .unwrap();
    assert_eq!(report.0, 42);
    assert_eq!(report.1.to_bits(), 3.14f32.to_bits());
    assert_eq!(report.2, "hi");

    server
        .call_all::<Avatar>(id, "announce", &[Value::from("round start")])
        .unwrap();
    assert!(
        wait_for(2000, || client
            .with_behaviour::<Avatar, _>(id, |a| a.announcements.clone())
            == Some(vec!["round start".to_string()]))
        .await
    );

    assert!(matches!(
        client.call_authority::<Avatar>(id, "announce", &[Value::from("x")]),
        Err(RpcError::WrongTarget { .. })
    ));
    assert!(matches!(
        client.call_authority::<Avatar>(id, "report", &[Value::I32(1)]),
        Err(RpcError::SignatureMismatch { .. })
    ));
    assert!(matches!(
        client.call_authority::<Avatar>(id, "missing", &[]),
        Err(RpcError::UnknownMethod { .. })
    ));
    assert!(matches!(
        client.call_all::<Avatar>(id, "announce", &[Value::from("x")]),
        Err(RpcError::WrongRole(_))
    ));
    assert!(matches!(
        server.call_all::<Avatar>(9999, "announce", &[Value::from("x")]),
        Err(RpcError::UnknownObject(9999))
    ));

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_joins_with_its_assigned_id() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();

    let client = new_session();
    let joined = Arc::new(Mutex::new(Vec::new()));
    let sink = joined.clone();
    client.subscribe_events(move |event| {
        if let SessionEvent::PlayerJoined(player) = event {
            sink.lock().unwrap().push(player.id());
        }
        Ok(())
    });
    client.start_client(localhost(port)).await.unwrap();

    assert!(wait_for(2000, || !joined.lock().unwrap().is_empty()).await);
    assert_eq!(*joined.lock().unwrap(), vec![1]);
    assert_eq!(client.local_player().unwrap().id(), 1);
    assert_eq!(server.players()[0].id(), 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_handler_can_despawn_its_object() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();
    let client = join(port).await;
    assert!(wait_for(2000, || server.players().len() == 1).await);

    let owner = server.players().remove(0);
    let object = server.spawn("PlayerPrefab", &owner, Vec3::ZERO).unwrap();
    let id = object.network_id();
    assert!(wait_for(2000, || client.object(id).is_some()).await);

    client.call_authority::<Avatar>(id, "retire", &[]).unwrap();
    assert!(wait_for(2000, || server.object(id).is_none()).await);
    assert!(wait_for(2000, || client.object(id).is_none()).await);
    assert!(wait_for(1000, || !object.is_spawned()).await);

    // The server keeps serving the client afterwards.
    let next = server
        .spawn("EnemyPrefab", &owner, Vec3::ONE)
        .unwrap()
        .network_id();
    assert!(wait_for(2000, || client.object(next).is_some()).await);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_owner_writes_relay_and_others_are_rejected() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();
    let alice = join(port).await;
    let bob = join(port).await;
    assert!(wait_for(2000, || server.players().len() == 2).await);

    let alice_id = alice.local_player().unwrap().id();
    let owner = server.player(alice_id).unwrap();
    let id = server
        .spawn("PlayerPrefab", &owner, Vec3::ZERO)
        .unwrap()
        .network_id();
    assert!(wait_for(2000, || alice.object(id).is_some() && bob.object(id).is_some()).await);
    assert!(!bob.object(id).unwrap().is_locally_owned());

    // Only the owner's copy originates updates.
    assert_eq!(
        bob.with_behaviour::<Avatar, _>(id, |a| a.health.set(1)),
        Some(true)
    );
    assert_eq!(
        alice.with_behaviour::<Avatar, _>(id, |a| a.health.set(50)),
        Some(true)
    );
    assert!(wait_for(2000, || health(&server, id) == Some(50) && health(&bob, id) == Some(50)).await);

    let forged = Message::FieldUpdate {
        object_id: id,
        behaviour_id: 0,
        field_id: 0,
        data: 7i32.to_le_bytes().to_vec(),
    };
    bob.send_to_server(&forged).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(health(&server, id), Some(50));
    assert_eq!(health(&alice, id), Some(50));

    alice.stop().await;
    bob.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_departing_player_objects_are_despawned() {
    let server = new_session();
    let port = next_port();
    server.start_server(port).await.unwrap();

    let left = Arc::new(AtomicUsize::new(0));
    let counter = left.clone();
    server.subscribe_events(move |event| {
        if matches!(event, SessionEvent::PlayerLeft { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let client = join(port).await;
    assert!(wait_for(2000, || server.players().len() == 1).await);
    let owner = server.players().remove(0);
    server.spawn("PlayerPrefab", &owner, Vec3::ZERO).unwrap();
    assert_eq!(server.object_count(), 1);

    client.stop().await;
    assert!(wait_for(2000, || left.load(Ordering::SeqCst) == 1).await);
    assert!(server.players().is_empty());
    assert_eq!(server.object_count(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_session_end_to_end() {
    let host = new_session();
    let joins = Arc::new(Mutex::new(Vec::new()));
    let sink = joins.clone();
    host.subscribe_events(move |event| {
        if let SessionEvent::PlayerJoined(player) = event {
            sink.lock().unwrap().push(player.id());
        }
        Ok(())
    });
    host.start_host(DEFAULT_PORT).await.unwrap();
    assert_eq!(*joins.lock().unwrap(), vec![0]);

    let client = new_session();
    let client_joins = Arc::new(Mutex::new(Vec::new()));
    let sink = client_joins.clone();
    client.subscribe_events(move |event| {
        if let SessionEvent::PlayerJoined(player) = event {
            sink.lock().unwrap().push(player.id());
        }
        Ok(())
    });
    client.start_client(localhost(DEFAULT_PORT)).await.unwrap();
    assert!(wait_for(2000, || host.players().len() == 2).await);
    assert!(
        wait_for(2000, || client
            .local_player()
            .is_some_and(|p| p.id() != u32::MAX))
        .await
    );

    let remote = host
        .players()
        .into_iter()
        .find(|p| !p.is_local())
        .unwrap();
    let object = host
        .spawn("PlayerPrefab", &remote, Vec3::new(1.0, 2.0, 3.0))
        .unwrap();
    let id = object.network_id();

    assert!(wait_for(2000, || client.object(id).is_some()).await);
    let replica = client.object(id).unwrap();
    assert_eq!(replica.prefab(), "PlayerPrefab");
    assert_eq!(replica.position(), Vec3::new(1.0, 2.0, 3.0));
    assert!(replica.is_locally_owned());

    // The host's own player is a client too.
    host.call_all::<Avatar>(id, "announce", &[Value::from("welcome")])
        .unwrap();
    let announced = |session: &Session| {
        session.with_behaviour::<Avatar, _>(id, |a| a.announcements.len()) == Some(1)
    };
    assert!(wait_for(2000, || announced(&host) && announced(&client)).await);

    host.call_authority::<Avatar>(id, "report", &[Value::I32(1), Value::F32(0.5), Value::from("local")])
        .unwrap();
    assert!(
        wait_for(2000, || host.with_behaviour::<Avatar, _>(id, |a| a.reports.len()) == Some(1))
            .await
    );

    assert_eq!(*joins.lock().unwrap(), vec![0, remote.id()]);
    assert_eq!(*client_joins.lock().unwrap(), vec![remote.id()]);
    assert_eq!(client.local_player().unwrap().id(), remote.id());

    client.stop().await;
    host.stop().await;
}
