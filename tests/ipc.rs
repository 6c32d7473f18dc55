mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use splithost::update::{UPDATE_CHANNEL, UpdateEventKind};
use splithost::{
    ChannelError, ConnectionId, Emitter, Event, IpcConfig, IpcServer, ServerChannel, UpdateChannel, UpdateClient,
    UpdateEvent, UpdateInfo, UpdateService,
};

use common::{connect, init_tracing};

/// `sleep(ms)` echoes after a delay; `hang` never answers; `tick` streams values.
#[derive(Default)]
struct Clock {
    ticks: Emitter<Value>,
}

#[async_trait]
impl ServerChannel for Clock {
    async fn call(&self, ctx: ConnectionId, command: &str, arg: Value) -> Result<Value, ChannelError> {
        match command {
            "sleep" => {
                let ms = arg.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "ctx": ctx.0, "slept": ms }))
            }
            "hang" => futures::future::pending().await,
            other => Err(ChannelError::UnknownCommand {
                channel: "clock".into(),
                command: other.into(),
            }),
        }
    }

    fn listen(&self, _ctx: ConnectionId, event: &str, _arg: Value) -> Result<Event<Value>, ChannelError> {
        match event {
            "tick" => Ok(self.ticks.event()),
            other => Err(ChannelError::UnknownEvent {
                channel: "clock".into(),
                event: other.into(),
            }),
        }
    }
}

struct WhoAmI(u64);

#[async_trait]
impl ServerChannel for WhoAmI {
    async fn call(&self, _ctx: ConnectionId, _command: &str, _arg: Value) -> Result<Value, ChannelError> {
        Ok(json!(self.0))
    }

    fn listen(&self, _ctx: ConnectionId, _event: &str, _arg: Value) -> Result<Event<Value>, ChannelError> {
        Ok(Event::none())
    }
}

async fn until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn server_with_clock() -> (IpcServer, Arc<Clock>) {
    init_tracing();
    let server = IpcServer::new(IpcConfig::default());
    let clock = Arc::new(Clock::default());
    server.register_channel("clock", clock.clone());
    (server, clock)
}

#[tokio::test]
async fn concurrent_calls_complete_out_of_order() {
    let (server, _) = server_with_clock();
    let client = connect(&server, 1).await;
    let clock = client.get_channel("clock");

    let slow = {
        let clock = clock.clone();
        tokio::spawn(async move { clock.call("sleep", 300).await })
    };
    let fast = clock.call("sleep", 5).await.unwrap();
    assert_eq!(fast, json!({ "ctx": 1, "slept": 5 }));
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), json!({ "ctx": 1, "slept": 300 }));
}

#[tokio::test]
async fn unknown_command_and_event_are_reported() {
    let (server, _) = server_with_clock();
    let client = connect(&server, 1).await;
    let clock = client.get_channel("clock");

    let err = clock.call("explode", ()).await.unwrap_err();
    assert!(matches!(err, ChannelError::Remote { ref message } if message.contains("unknown command")));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = clock.listen("melt", Value::Null).subscribe(move |item| s.lock().push(item.clone()));
    until(|| !seen.lock().is_empty()).await;
    assert!(matches!(&seen.lock()[0], Err(ChannelError::Remote { message }) if message.contains("unknown event")));
}

#[tokio::test]
async fn listen_opens_and_closes_the_remote_stream() {
    let (server, clock_impl) = server_with_clock();
    let client = connect(&server, 1).await;
    let ticks = client.get_channel("clock").listen("tick", Value::Null);
    assert!(!clock_impl.ticks.has_listeners());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let sub = ticks.subscribe(move |item| s.lock().push(item.clone()));
    until(|| clock_impl.ticks.has_listeners()).await;

    clock_impl.ticks.emit(&json!(1));
    clock_impl.ticks.emit(&json!(2));
    until(|| seen.lock().len() == 2).await;
    assert_eq!(*seen.lock(), vec![Ok(json!(1)), Ok(json!(2))]);

    sub.dispose();
    until(|| !clock_impl.ticks.has_listeners()).await;
}

#[tokio::test]
async fn disconnect_rejects_calls_and_ends_streams() {
    let (server, clock_impl) = server_with_clock();
    let removed = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&removed);
    let _watch = server.on_did_remove_connection().subscribe(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    let client = connect(&server, 3).await;
    let clock = client.get_channel("clock");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = clock.listen("tick", Value::Null).subscribe(move |item| s.lock().push(item.clone()));
    until(|| clock_impl.ticks.has_listeners()).await;

    let stuck = {
        let clock = clock.clone();
        tokio::spawn(async move { clock.call("hang", ()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.disconnect();
    assert_eq!(stuck.await.unwrap(), Err(ChannelError::Disconnected));
    assert_eq!(*seen.lock(), vec![Err(ChannelError::Disconnected)]);
    assert!(!client.is_connected());
    assert_eq!(clock.call("sleep", 1).await, Err(ChannelError::Disconnected));

    until(|| removed.load(Ordering::SeqCst) == 1).await;
    until(|| !clock_impl.ticks.has_listeners()).await;
    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn reconnect_retires_the_previous_state_once() {
    let (server, _) = server_with_clock();
    let removed = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&removed);
    let _watch = server.on_did_remove_connection().subscribe(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    let first = connect(&server, 7).await;
    first.register_channel("who", Arc::new(WhoAmI(1)));
    let second = connect(&server, 7).await;
    second.register_channel("who", Arc::new(WhoAmI(2)));

    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(server.connections(), vec![ConnectionId(7)]);

    let who = server.get_channel("who", |ctx| ctx == ConnectionId(7));
    assert_eq!(who.call("", ()).await.unwrap(), json!(2));

    // The superseded transport going away must not retire the live one.
    first.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(who.call("", ()).await.unwrap(), json!(2));
}

#[tokio::test]
async fn unbound_listen_streams_until_disconnect() {
    let (server, clock_impl) = server_with_clock();
    let client = connect(&server, 4).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let sub = client
        .get_channel("clock")
        .listen("tick", Value::Null)
        .subscribe(move |item| s.lock().push(item.clone()));
    until(|| clock_impl.ticks.has_listeners()).await;

    clock_impl.ticks.emit(&json!(1));
    until(|| !seen.lock().is_empty()).await;
    assert!(!sub.is_disposed());

    client.disconnect();
    assert_eq!(*seen.lock(), vec![Ok(json!(1)), Err(ChannelError::Disconnected)]);
    until(|| !clock_impl.ticks.has_listeners()).await;
}

#[tokio::test]
async fn reconnect_removes_the_old_state_before_adding_the_new() {
    let (server, _) = server_with_clock();
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let _added = server
        .on_did_add_connection()
        .subscribe(move |ctx| o.lock().push(("add", *ctx)));
    let o = Arc::clone(&order);
    let _removed = server
        .on_did_remove_connection()
        .subscribe(move |ctx| o.lock().push(("remove", *ctx)));

    let _first = connect(&server, 7).await;
    let _second = connect(&server, 7).await;

    assert_eq!(
        *order.lock(),
        vec![
            ("add", ConnectionId(7)),
            ("remove", ConnectionId(7)),
            ("add", ConnectionId(7))
        ]
    );
}

#[tokio::test]
async fn routed_channel_follows_the_filter() {
    init_tracing();
    let server = IpcServer::default();
    let one = connect(&server, 1).await;
    let two = connect(&server, 2).await;
    one.register_channel("who", Arc::new(WhoAmI(1)));
    two.register_channel("who", Arc::new(WhoAmI(2)));

    let second = server.get_channel("who", |ctx| ctx == ConnectionId(2));
    assert_eq!(second.call("", ()).await.unwrap(), json!(2));

    let any = server.get_channel("who", |_| true);
    assert_eq!(any.call("", ()).await.unwrap(), json!(1));

    let nobody = server.get_channel("who", |ctx| ctx.0 > 10);
    assert_eq!(
        nobody.call("", ()).await,
        Err(ChannelError::NoConnection {
            channel: "who".into()
        })
    );
    assert!(nobody.listen("x", Value::Null).is_err());
}

struct FakeUpdates {
    events: Emitter<UpdateEvent>,
}

#[async_trait]
impl UpdateService for FakeUpdates {
    async fn check_for_updates(&self) -> anyhow::Result<Option<UpdateInfo>> {
        Ok(Some(UpdateInfo {
            version: "2.0.0".into(),
            release_name: Some("Two".into()),
            ..UpdateInfo::default()
        }))
    }

    async fn check_for_updates_and_notify(&self) -> anyhow::Result<Option<UpdateInfo>> {
        anyhow::bail!("feed offline")
    }

    fn events(&self) -> Event<UpdateEvent> {
        self.events.event()
    }
}

#[tokio::test]
async fn update_channel_over_ipc() {
    init_tracing();
    let server = IpcServer::default();
    let service = Arc::new(FakeUpdates { events: Emitter::new() });
    server.register_channel(UPDATE_CHANNEL, Arc::new(UpdateChannel::new(Arc::clone(&service))));

    let client = connect(&server, 1).await;
    let updates = UpdateClient::new(client.get_channel(UPDATE_CHANNEL));

    let info = updates.check_for_updates().await.unwrap().unwrap();
    assert_eq!(info.version, "2.0.0");
    assert_eq!(info.release_name.as_deref(), Some("Two"));

    let err = updates.check_for_updates_and_notify().await.unwrap_err();
    assert!(matches!(err, ChannelError::Remote { ref message } if message.contains("feed offline")));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = updates
        .on(UpdateEventKind::UpdateDownloaded)
        .subscribe(move |item| s.lock().push(item.clone()));
    until(|| service.events.has_listeners()).await;

    service.events.emit(&UpdateEvent::CheckingForUpdate);
    service.events.emit(&UpdateEvent::UpdateDownloaded(info.clone()));
    until(|| !seen.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock(), vec![Ok(UpdateEvent::UpdateDownloaded(info))]);
}
