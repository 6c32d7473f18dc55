mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::Shared;
use parking_lot::Mutex;
use splithost::lifecycle::BeforeShutdownError;
use splithost::{LifecyclePhase, Platform, RelaunchOptions, ShutdownReason, UiTarget, UnloadReason};

use common::Host;

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn quit_unloads_windows_joins_and_exits() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    assert_eq!(host.main.window_count(), 1);

    let joined = Arc::new(AtomicBool::new(false));
    let j = Arc::clone(&joined);
    let _join = ui.participant.on_will_shutdown().subscribe(move |event| {
        assert_eq!(event.reason(), UnloadReason::Quit);
        let j = Arc::clone(&j);
        event.join("flush-state", async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            j.store(true, Ordering::SeqCst);
            Ok(())
        });
    });
    let (did_shutdown, on_did) = counter();
    let _did = ui.participant.on_did_shutdown().subscribe(move |_| on_did());
    let (main_will, on_main_will) = counter();
    let _main_will = host.main.on_will_shutdown().subscribe(move |event| {
        assert_eq!(event.reason(), ShutdownReason::Quit);
        on_main_will();
    });

    let vetoed = host.main.quit(false).await;
    assert!(!vetoed);
    assert_eq!(host.app.exited().await, 0);

    assert!(joined.load(Ordering::SeqCst));
    assert_eq!(did_shutdown.load(Ordering::SeqCst), 1);
    assert_eq!(main_will.load(Ordering::SeqCst), 1);
    assert!(ui.window.is_destroyed());
    assert_eq!(host.main.window_count(), 0);
    assert_eq!(ui.participant.shutdown_reason(), Some(UnloadReason::Quit));
}

#[tokio::test]
async fn veto_keeps_windows_and_resets_quit() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let _veto = ui
        .participant
        .on_before_shutdown()
        .subscribe(|event| event.veto(true, "unsaved-document"));
    let (vetoes, on_veto) = counter();
    let _seen = ui.participant.on_shutdown_veto().subscribe(move |_| on_veto());

    assert!(host.main.quit(false).await);
    assert!(!host.main.quit_requested());
    assert!(!ui.window.is_destroyed());
    assert_eq!(host.main.window_count(), 1);
    assert_eq!(vetoes.load(Ordering::SeqCst), 1);
    assert_eq!(host.app.exit_code(), None);
    assert_eq!(ui.participant.shutdown_reason(), None);
}

#[tokio::test]
async fn failing_deferred_veto_counts_as_veto() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let _veto = ui.participant.on_before_shutdown().subscribe(|event| {
        event.veto_later(async { Err::<bool, _>(anyhow::anyhow!("disk unavailable")) }, "autosave");
    });
    let errors: Arc<Mutex<Vec<BeforeShutdownError>>> = Arc::default();
    let e = Arc::clone(&errors);
    let _errors = ui
        .participant
        .on_before_shutdown_error()
        .subscribe(move |err| e.lock().push(err.clone()));

    assert!(host.main.quit(false).await);
    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, "autosave");
    assert_eq!(errors[0].reason, UnloadReason::Quit);
    assert!(errors[0].message.contains("disk unavailable"));
}

#[tokio::test]
async fn deferred_no_veto_lets_close_proceed() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let _veto = ui.participant.on_before_shutdown().subscribe(|event| {
        event.veto_later(
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(false)
            },
            "slow-check",
        );
    });
    let closing = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&closing);
    let _closing = host
        .main
        .on_before_close_window()
        .subscribe(move |id| c.lock().push(*id));

    ui.window.close();
    let closed = ui.window.on_closed().next();
    tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap();

    assert_eq!(*closing.lock(), vec![ui.window.id()]);
    assert_eq!(ui.participant.shutdown_reason(), Some(UnloadReason::Close));
    // Not quitting and not on macOS: the last window closing ends the app.
    assert_eq!(host.app.exited().await, 0);
}

#[tokio::test]
async fn concurrent_unloads_share_one_future() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let (asked, on_asked) = counter();
    let _count = ui.participant.on_before_shutdown().subscribe(move |_| on_asked());

    let target: Arc<dyn UiTarget> = ui.window.clone();
    let first = host.main.unload(&target, UnloadReason::Close);
    let second = host.main.unload(&target, UnloadReason::Reload);
    assert!(Shared::ptr_eq(&first, &second));

    assert!(!first.await);
    assert!(!second.await);
    assert_eq!(asked.load(Ordering::SeqCst), 1);

    let third = host.main.unload(&target, UnloadReason::Close);
    assert!(!third.await);
    assert_eq!(asked.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unload_of_unreachable_target_is_not_vetoed() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let _veto = ui
        .participant
        .on_before_shutdown()
        .subscribe(|event| event.veto(true, "never"));
    ui.client.disconnect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let target: Arc<dyn UiTarget> = ui.window.clone();
    assert!(!host.main.unload(&target, UnloadReason::Close).await);
}

#[tokio::test]
async fn before_quit_runs_once_on_macos_without_windows() {
    let host = Host::new(Platform::MacOs, &["app"]);
    let (before, on_before) = counter();
    let _before = host.main.on_before_shutdown().subscribe(move |_| on_before());
    let (will, on_will) = counter();
    let _will = host.main.on_will_shutdown().subscribe(move |_| on_will());

    host.app.emit_before_quit();
    host.app.emit_before_quit();
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(will.load(Ordering::SeqCst), 1);
    assert!(host.main.quit_requested());

    let again = host.main.will_shutdown(ShutdownReason::Kill);
    again.await;
    assert_eq!(will.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn macos_keeps_running_after_last_window_closes() {
    let host = Host::new(Platform::MacOs, &["app"]);
    let ui = host.open_window(1, false).await;

    ui.window.close();
    tokio::time::timeout(Duration::from_secs(5), ui.window.on_closed().next())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(host.main.window_count(), 0);
    assert_eq!(host.app.exit_code(), None);
    assert_eq!(host.app.quit_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn kill_exits_within_deadlines_despite_stuck_window() {
    let host = Host::new(Platform::Linux, &["app"]);
    let _ui = host.open_window(1, true).await;
    let _hang = host.main.on_will_shutdown().subscribe(|event| {
        assert_eq!(event.reason(), ShutdownReason::Kill);
        event.join("never-finishes", futures::future::pending());
    });

    let started = tokio::time::Instant::now();
    host.main.kill(42).await;
    let elapsed = started.elapsed();

    assert_eq!(host.app.exit_code(), Some(42));
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2200), "{elapsed:?}");
}

#[tokio::test]
async fn participant_kill_reaches_main() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;

    ui.participant.kill(3).await.unwrap();
    assert_eq!(host.app.exit_code(), Some(3));
    assert!(ui.window.is_destroyed());
}

#[tokio::test]
async fn relaunch_adjusts_arguments() {
    let host = Host::new(Platform::Linux, &["app", "--verbose", "--profile", "a", "--verbose"]);

    let vetoed = host
        .main
        .relaunch(RelaunchOptions {
            add_args: vec!["--restarted".into()],
            remove_args: vec!["--verbose".into()],
        })
        .await;

    assert!(!vetoed);
    assert!(host.main.is_restarting());
    assert_eq!(host.app.exited().await, 0);
    assert_eq!(
        host.app.relaunched(),
        Some(vec![
            "--profile".to_string(),
            "a".into(),
            "--verbose".into(),
            "--restarted".into()
        ])
    );
}

#[tokio::test]
async fn vetoed_relaunch_does_not_relaunch() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let _veto = ui
        .participant
        .on_before_shutdown()
        .subscribe(|event| event.veto(true, "busy"));

    assert!(ui.participant.relaunch(RelaunchOptions::default()).await.unwrap());
    assert_eq!(host.app.relaunched(), None);
    assert_eq!(host.app.exit_code(), None);
    assert!(!host.main.is_restarting());
    assert!(!host.main.quit_requested());

    // A later plain quit does not inherit the restart flag.
    assert!(host.main.quit(false).await);
    assert!(!host.main.is_restarting());
}

#[tokio::test]
async fn reload_unloads_then_reloads() {
    let host = Host::new(Platform::Linux, &["app"]);
    let ui = host.open_window(1, false).await;
    let target: Arc<dyn UiTarget> = ui.window.clone();

    assert!(!host.main.reload(&target).await);
    assert_eq!(ui.window.reloads(), 1);
    assert_eq!(ui.participant.shutdown_reason(), Some(UnloadReason::Reload));

    let _veto = ui
        .participant
        .on_before_shutdown()
        .subscribe(|event| event.veto(true, "editing"));
    assert!(host.main.reload(&target).await);
    assert_eq!(ui.window.reloads(), 1);
}

#[tokio::test]
async fn phases_only_move_forward() {
    let host = Host::new(Platform::Linux, &["app"]);
    assert_eq!(host.main.phase(), LifecyclePhase::Starting);

    let ready = {
        let main = Arc::clone(&host.main);
        tokio::spawn(async move { main.when(LifecyclePhase::Ready).await })
    };
    host.main.set_phase(LifecyclePhase::Ready).unwrap();
    tokio::time::timeout(Duration::from_secs(1), ready).await.unwrap().unwrap();

    assert!(host.main.set_phase(LifecyclePhase::Starting).is_err());
    assert_eq!(host.main.phase(), LifecyclePhase::Ready);
}
