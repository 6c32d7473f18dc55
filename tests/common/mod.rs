#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use splithost::{
    AppHost, ConnectionId, Emitter, Event, IpcClient, IpcConfig, IpcServer, LifecycleConfig, LifecycleMain,
    LifecycleParticipant, Platform, Preventable, TargetId, UiTarget,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connects a client under `id` and waits until the server installed it.
pub async fn connect(server: &IpcServer, id: u64) -> IpcClient {
    let ctx = ConnectionId(id);
    let added = server.on_did_add_connection().filter(move |c| *c == ctx).next();
    let (privileged_end, ui_end) = tokio::io::duplex(256 * 1024);
    server.accept(ctx, privileged_end);
    let client = IpcClient::connect(ctx, ui_end, &IpcConfig::default()).expect("connect");
    added.await.expect("connection added");
    client
}

pub fn config(platform: Platform) -> LifecycleConfig {
    LifecycleConfig {
        platform,
        startup_dir: None,
        ..LifecycleConfig::default()
    }
}

/// Native application double following the desktop quit order.
#[derive(Default)]
pub struct FakeApp {
    args: Vec<String>,
    quitting: AtomicBool,
    quit_calls: AtomicUsize,
    windows: Mutex<Vec<Arc<FakeWindow>>>,
    exit_code: Mutex<Option<i32>>,
    relaunched: Mutex<Option<Vec<String>>>,
    before_quit: Emitter<()>,
    window_all_closed: Emitter<()>,
    will_quit: Emitter<Preventable>,
    quit_signal: Emitter<()>,
}

impl FakeApp {
    pub fn new(args: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        })
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn relaunched(&self) -> Option<Vec<String>> {
        self.relaunched.lock().clone()
    }

    pub fn quit_calls(&self) -> usize {
        self.quit_calls.load(Ordering::SeqCst)
    }

    pub fn emit_before_quit(&self) {
        self.before_quit.emit(&());
    }

    fn add_window(&self, window: Arc<FakeWindow>) {
        self.windows.lock().push(window);
    }

    fn remove_window(&self, id: TargetId) {
        let now_empty = {
            let mut windows = self.windows.lock();
            windows.retain(|w| w.id != id);
            windows.is_empty()
        };
        if now_empty && !self.quitting.load(Ordering::SeqCst) {
            self.window_all_closed.emit(&());
        }
    }

    /// Waits until the process "exited".
    pub async fn exited(&self) -> i32 {
        loop {
            if let Some(code) = self.exit_code() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl AppHost for FakeApp {
    fn quit(&self) {
        self.quit_calls.fetch_add(1, Ordering::SeqCst);
        if self.exit_code().is_some() {
            return;
        }
        self.quitting.store(true, Ordering::SeqCst);
        self.before_quit.emit(&());

        let windows = self.windows.lock().clone();
        for window in windows {
            if !window.request_close() {
                self.quitting.store(false, Ordering::SeqCst);
                return;
            }
        }

        let will_quit = Preventable::new();
        self.will_quit.emit(&will_quit);
        self.quitting.store(false, Ordering::SeqCst);
        if will_quit.is_default_prevented() {
            return;
        }
        self.quit_signal.emit(&());
        self.exit(0);
    }

    fn exit(&self, code: i32) {
        let mut exit_code = self.exit_code.lock();
        if exit_code.is_none() {
            *exit_code = Some(code);
        }
    }

    fn relaunch(&self, args: Vec<String>) {
        *self.relaunched.lock() = Some(args);
    }

    fn args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn on_before_quit(&self) -> Event<()> {
        self.before_quit.event()
    }

    fn on_window_all_closed(&self) -> Event<()> {
        self.window_all_closed.event()
    }

    fn on_will_quit(&self) -> Event<Preventable> {
        self.will_quit.event()
    }

    fn on_quit(&self) -> Event<()> {
        self.quit_signal.event()
    }
}

/// Window double. `stuck` windows ignore `destroy`.
pub struct FakeWindow {
    id: TargetId,
    app: Weak<FakeApp>,
    stuck: bool,
    destroyed: AtomicBool,
    reloads: AtomicUsize,
    close_requested: Emitter<Preventable>,
    closed: Emitter<()>,
}

impl FakeWindow {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Asks to close; returns `true` if the window actually closed.
    pub fn request_close(&self) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return true;
        }
        let event = Preventable::new();
        self.close_requested.emit(&event);
        if event.is_default_prevented() {
            return false;
        }
        self.finish_close();
        true
    }

    fn finish_close(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.emit(&());
        if let Some(app) = self.app.upgrade() {
            app.remove_window(self.id);
        }
    }
}

impl UiTarget for FakeWindow {
    fn id(&self) -> TargetId {
        self.id
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.request_close();
    }

    fn destroy(&self) {
        if !self.stuck {
            self.finish_close();
        }
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close_requested(&self) -> Event<Preventable> {
        self.close_requested.event()
    }

    fn on_closed(&self) -> Event<()> {
        self.closed.event()
    }
}

/// One UI process: native window, its connection, its participant.
pub struct Ui {
    pub window: Arc<FakeWindow>,
    pub client: IpcClient,
    pub participant: Arc<LifecycleParticipant>,
}

pub struct Host {
    pub server: IpcServer,
    pub app: Arc<FakeApp>,
    pub main: Arc<LifecycleMain>,
    pub platform: Platform,
}

impl Host {
    pub fn new(platform: Platform, args: &[&str]) -> Self {
        init_tracing();
        let server = IpcServer::default();
        let app = FakeApp::new(args);
        let main = LifecycleMain::new(app.clone(), server.clone(), config(platform));
        Self {
            server,
            app,
            main,
            platform,
        }
    }

    pub async fn open_window(&self, id: u64, stuck: bool) -> Ui {
        let window = Arc::new(FakeWindow {
            id: TargetId(id),
            app: Arc::downgrade(&self.app),
            stuck,
            destroyed: AtomicBool::new(false),
            reloads: AtomicUsize::new(0),
            close_requested: Emitter::new(),
            closed: Emitter::new(),
        });
        self.app.add_window(Arc::clone(&window));

        let client = connect(&self.server, id).await;
        let participant = LifecycleParticipant::new(&client, config(self.platform));
        self.main.register_target(window.clone());
        Ui {
            window,
            client,
            participant,
        }
    }
}
