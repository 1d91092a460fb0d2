//! Integration tests for the session and transport engine
//!
//! Driven end to end against the scripted mock backend: session lifecycle,
//! stealing, the optimistic acquire guard, connect retries, reset
//! suppression, the long-poll notifier and the concurrency properties of
//! the call path.

use protocol::Message;
use server::{CallMode, Core, CoreError};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use transport::mock::{MockBackend, MockController};
use transport::TransportBus;

fn mock_core(allow_stealing: bool) -> (Core, MockController) {
    let backend = MockBackend::new();
    let controller = backend.controller();
    let bus = TransportBus::new(vec![Box::new(backend)]).unwrap();
    (Core::new(bus, allow_stealing, true), controller)
}

fn message(kind: u16, len: usize) -> Message {
    Message {
        kind,
        data: (0..len).map(|i| (i % 256) as u8).collect(),
    }
}

#[tokio::test]
async fn test_acquire_call_release_happy_path() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);

    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "1");
    assert_eq!(entries[0].session, None);

    let session = core.acquire("1".into(), None, false).await.unwrap();
    assert_eq!(session, "1");

    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries[0].session.as_deref(), Some("1"));

    let msg = message(0x0001, 0);
    let reply = core
        .call(
            CancellationToken::new(),
            Some(msg.clone()),
            session.clone(),
            CallMode::ReadWrite,
            false,
        )
        .await
        .unwrap();
    assert_eq!(reply, Some(msg));

    core.release(session.clone(), false).await.unwrap();
    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries[0].session, None);

    // second release of the same id
    let err = core.release(session, false).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound));
}

#[tokio::test]
async fn test_acquire_wrong_previous_session() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();

    let err = core
        .acquire("1".into(), Some("99".into()), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::WrongPreviousSession));
}

#[tokio::test]
async fn test_acquire_unknown_device() {
    let (core, _controller) = mock_core(true);
    let err = core.acquire("1".into(), None, false).await.unwrap_err();
    assert!(matches!(err, CoreError::DeviceNotFound));
}

#[tokio::test]
async fn test_stealing_replaces_holder() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();

    let first = core.acquire("1".into(), None, false).await.unwrap();
    let second = core
        .acquire("1".into(), Some(first.clone()), false)
        .await
        .unwrap();
    assert_ne!(first, second);

    // the displaced holder's id is dead
    let err = core.release(first, false).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound));

    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries[0].session.as_deref(), Some(second.as_str()));
}

#[tokio::test]
async fn test_stealing_disabled_keeps_holder() {
    let (core, controller) = mock_core(false);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();

    let holder = core.acquire("1".into(), None, false).await.unwrap();

    // declaring the holder correctly still cannot displace it
    let err = core
        .acquire("1".into(), Some(holder.clone()), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::OtherCallInProgress));

    // not declaring it fails the optimistic guard first
    let err = core.acquire("1".into(), None, false).await.unwrap_err();
    assert!(matches!(err, CoreError::WrongPreviousSession));

    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries[0].session.as_deref(), Some(holder.as_str()));
}

#[tokio::test]
async fn test_acquire_retries_transient_connect_failures() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();

    controller.fail_connects("mock0", 3);
    let session = core.acquire("1".into(), None, false).await.unwrap();
    assert_eq!(session, "1");
    assert_eq!(controller.connect_count("mock0"), 1);
}

#[tokio::test]
async fn test_acquire_gives_up_after_retry_budget() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();

    controller.fail_connects("mock0", 4);
    let err = core.acquire("1".into(), None, false).await.unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    assert_eq!(controller.connect_count("mock0"), 0);
}

#[tokio::test]
async fn test_reset_suppressed_while_other_interface_held() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", true);
    core.enumerate().await.unwrap();

    core.acquire("1".into(), None, false).await.unwrap();
    let debug_session = core.acquire("1".into(), None, true).await.unwrap();
    assert!(debug_session.starts_with("debug"));

    // first connect resets, second must not (it would kill the first)
    assert_eq!(controller.connect_resets("mock0"), vec![true, false]);

    let entries = core.enumerate().await.unwrap();
    assert!(entries[0].session.is_some());
    assert_eq!(entries[0].debug_session.as_deref(), Some(debug_session.as_str()));
}

#[tokio::test]
async fn test_enumerate_is_sorted_and_never_null() {
    let (core, controller) = mock_core(true);
    assert!(core.enumerate().await.unwrap().is_empty());

    for i in 0..10 {
        controller.add_device(&format!("mock{i}"), false);
    }
    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries.len(), 10);
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
}

#[tokio::test]
async fn test_listen_wakes_on_attach() {
    let (core, controller) = mock_core(true);

    tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        controller.add_device("mock0", false);
    });

    let entries = timeout(
        Duration::from_secs(2),
        core.listen(CancellationToken::new(), Vec::new()),
    )
    .await
    .expect("listen should wake promptly")
    .unwrap()
    .expect("not cancelled");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "1");
}

#[tokio::test]
async fn test_listen_returns_empty_on_cancel() {
    let (core, _controller) = mock_core(true);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = timeout(Duration::from_secs(2), core.listen(cancel, Vec::new()))
        .await
        .expect("listen should return promptly")
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_parallel_calls_on_distinct_sessions() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    controller.add_device("mock1", false);
    core.enumerate().await.unwrap();

    let s1 = core.acquire("1".into(), None, false).await.unwrap();
    let s2 = core.acquire("2".into(), None, false).await.unwrap();

    let m1 = message(0x0101, 100);
    let m2 = message(0x0202, 4000);
    let (r1, r2) = tokio::join!(
        core.call(
            CancellationToken::new(),
            Some(m1.clone()),
            s1,
            CallMode::ReadWrite,
            false
        ),
        core.call(
            CancellationToken::new(),
            Some(m2.clone()),
            s2,
            CallMode::ReadWrite,
            false
        ),
    );
    assert_eq!(r1.unwrap(), Some(m1));
    assert_eq!(r2.unwrap(), Some(m2));
}

#[tokio::test]
async fn test_concurrent_calls_on_same_session() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();
    let session = core.acquire("1".into(), None, false).await.unwrap();

    // a read-mode call blocks until the device produces something
    let blocked = tokio::spawn({
        let core = core.clone();
        let session = session.clone();
        async move {
            core.call(CancellationToken::new(), None, session, CallMode::Read, false)
                .await
        }
    });
    sleep(Duration::from_millis(100)).await;

    let err = core
        .call(
            CancellationToken::new(),
            Some(message(1, 4)),
            session,
            CallMode::ReadWrite,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::OtherCallInProgress));

    controller.push_reply("mock0", 0x0042, &[9, 9]);
    let reply = blocked.await.unwrap().unwrap().unwrap();
    assert_eq!(reply.kind, 0x0042);
    assert_eq!(reply.data, vec![9, 9]);
}

#[tokio::test]
async fn test_post_mode_returns_no_reply() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();
    let session = core.acquire("1".into(), None, false).await.unwrap();

    let reply = core
        .call(
            CancellationToken::new(),
            Some(message(7, 10)),
            session.clone(),
            CallMode::Write,
            false,
        )
        .await
        .unwrap();
    assert!(reply.is_none());

    // the echo is still queued; a read-mode call picks it up
    let reply = core
        .call(CancellationToken::new(), None, session, CallMode::Read, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, message(7, 10));
}

#[tokio::test]
async fn test_read_mode_rejects_body() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();
    let session = core.acquire("1".into(), None, false).await.unwrap();

    let err = core
        .call(
            CancellationToken::new(),
            Some(message(1, 1)),
            session,
            CallMode::Read,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NonEmptyBodyOnRead));
}

#[tokio::test]
async fn test_disconnect_during_call_fails_call_and_retires_session() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();
    let session = core.acquire("1".into(), None, false).await.unwrap();

    let blocked = tokio::spawn({
        let core = core.clone();
        let session = session.clone();
        async move {
            core.call(CancellationToken::new(), None, session, CallMode::Read, false)
                .await
        }
    });
    sleep(Duration::from_millis(100)).await;

    controller.remove_device("mock0");
    let err = blocked.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "device disconnected during action");

    // the next enumeration retires the device and force-releases the session
    let entries = core.enumerate().await.unwrap();
    assert!(entries.is_empty());
    let err = core.release(session, false).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound));
}

#[tokio::test]
async fn test_client_disconnect_auto_releases_session() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    core.enumerate().await.unwrap();
    let session = core.acquire("1".into(), None, false).await.unwrap();

    let cancel = CancellationToken::new();
    let blocked = tokio::spawn({
        let core = core.clone();
        let session = session.clone();
        let cancel = cancel.clone();
        async move {
            core.call(cancel, None, session, CallMode::Read, false).await
        }
    });
    sleep(Duration::from_millis(100)).await;

    cancel.cancel();
    // the watcher releases the session, which unblocks the read
    let err = timeout(Duration::from_secs(2), blocked)
        .await
        .expect("cancel should unblock the call")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), "closed device");

    let entries = core.enumerate().await.unwrap();
    assert_eq!(entries[0].session, None);
    let err = core.release(session, false).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound));
}

#[tokio::test]
async fn test_replug_mints_fresh_public_id() {
    let (core, controller) = mock_core(true);
    controller.add_device("mock0", false);
    assert_eq!(core.enumerate().await.unwrap()[0].path, "1");

    controller.remove_device("mock0");
    assert!(core.enumerate().await.unwrap().is_empty());

    controller.add_device("mock0", false);
    assert_eq!(core.enumerate().await.unwrap()[0].path, "2");
}
