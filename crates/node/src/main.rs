mod config;
mod demo;

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use replicant::{Message, MessageKind, Session, SessionEvent, Value};
use tokio::sync::mpsc;

use config::{Args, Command};
use demo::{Avatar, DemoFactory, ENEMY_PREFAB, PLAYER_PREFAB, PREFABS, spawn_point};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let session = Session::new(args.session_config(), DemoFactory);
    for prefab in PREFABS {
        session.register_prefab(prefab);
    }
    session.register_behaviour::<Avatar>();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    session.subscribe_events(move |event| {
        events_tx
            .send(event.clone())
            .map_err(|_| "node event loop has exited".into())
    });
    session.subscribe(MessageKind::ChatText, |message, sender| {
        if let Message::ChatText { text } = message {
            log::info!("[chat] {}: {}", sender, text);
        }
        Ok(())
    });

    match args.command {
        Command::Host { port } => {
            session.start_host(port).await?;
            if let Some(local) = session.local_player() {
                session.spawn(ENEMY_PREFAB, &local, Default::default())?;
            }
        }
        Command::Server { port } => session.start_server(port).await?,
        Command::Client { addr } => session.start_client(addr).await?,
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut greeted = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutting down");
                break;
            }
            Some(event) = events_rx.recv() => {
                if !handle_event(&session, event) {
                    break;
                }
            }
            _ = tick.tick() => tick_once(&session, &mut greeted),
        }
    }

    session.stop().await;
    Ok(())
}

/// Returns false once the node has nothing left to do.
fn handle_event(session: &Session, event: SessionEvent) -> bool {
    match event {
        SessionEvent::PlayerJoined(player) => {
            log::info!("{} joined", player);
            if session.is_authority() {
                if let Err(e) = session.spawn(PLAYER_PREFAB, &player, spawn_point(player.id())) {
                    log::warn!("Could not spawn an avatar for {}: {}", player, e);
                }
            }
        }
        SessionEvent::PlayerLeft { player, reason } => {
            log::info!("{} left ({})", player, reason.as_str());
        }
        SessionEvent::Connected => {
            if let Err(e) = session.send_to_server(&Message::chat("hello")) {
                log::warn!("Greeting failed: {}", e);
            }
        }
        SessionEvent::Disconnected(reason) => {
            log::warn!("Lost the server ({})", reason.as_str());
            return false;
        }
        SessionEvent::Error(message) => log::warn!("Session error: {}", message),
    }
    true
}

/// Owners greet once through their avatar, then bleed one health per tick.
fn tick_once(session: &Session, greeted: &mut HashSet<u32>) {
    if !session.is_client() {
        return;
    }

    for object in session.objects() {
        if !object.is_locally_owned() {
            continue;
        }
        let id = object.network_id();

        if greeted.insert(id) {
            let args = [Value::from(format!("ready at {}", object.position()))];
            if let Err(e) = session.call_authority::<Avatar>(id, "say", &args) {
                log::debug!("#{} cannot speak: {}", id, e);
            }
        }
        session.with_behaviour::<Avatar, _>(id, |avatar| {
            let next = (*avatar.health.get() - 1).max(0);
            avatar.health.set(next)
        });
    }
}
