use devgw_protocol::{HttpTransport, MockTransport, Reply, Request, Timeouts, TransportError};
use devgw_session::{Session, SessionConfig, SessionError};
use domain::{ConnectionState, HttpMethod, RegisterTable};
use std::sync::Arc;
use std::time::Duration;

fn read(address: u16) -> Request {
    Request::ReadRegisters {
        table: RegisterTable::Holding,
        unit: None,
        address,
        count: 1,
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        lock_timeout: Duration::from_millis(200),
        reconnect_step: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn call_opens_lazily_and_reads() {
    let mock = MockTransport::new();
    mock.set_register(0x32, 0xFF9C);
    let session = Session::new("heatpump", Box::new(mock.clone()), fast_config());
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let reply = session.call(read(0x32)).await.expect("reply");

    assert_eq!(reply, Reply::Registers(vec![0xFF9C]));
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(mock.open_attempts(), 1);
    assert!(session.snapshot().connected_since_ms.is_some());
}

#[tokio::test]
async fn concurrent_calls_never_overlap() {
    let mock = MockTransport::new();
    mock.set_delay(Duration::from_millis(20));
    let session = Arc::new(Session::new(
        "avr",
        Box::new(mock.clone()),
        SessionConfig {
            lock_timeout: Duration::from_secs(2),
            ..fast_config()
        },
    ));

    let mut handles = Vec::new();
    for address in 0..5u16 {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move { session.call(read(address)).await }));
    }
    for handle in handles {
        handle.await.expect("join").expect("call");
    }

    assert_eq!(mock.requests().len(), 5);
    assert_eq!(mock.max_in_flight(), 1);
}

#[tokio::test]
async fn failed_open_backs_off_then_recovers() {
    let mock = MockTransport::new();
    mock.set_fail_open(true);
    let session = Session::new("meter", Box::new(mock.clone()), fast_config());

    let err = session.ensure_open().await.expect_err("refused");
    assert!(matches!(err, SessionError::Transport(TransportError::Connect(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(mock.open_attempts(), 1);

    let err = session.ensure_open().await.expect_err("deferred");
    assert!(matches!(err, SessionError::Backoff(_)));
    assert!(err.is_unavailable());
    assert_eq!(mock.open_attempts(), 1);

    tokio::time::sleep(Duration::from_millis(70)).await;
    mock.set_fail_open(false);
    let state = session.ensure_open().await.expect("reconnected");
    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(mock.open_attempts(), 2);
    assert!(session.last_error().is_none());
}

#[tokio::test]
async fn link_failure_disconnects_and_next_call_reopens() {
    let mock = MockTransport::new();
    let session = Session::new("vacuum", Box::new(mock.clone()), fast_config());
    session.ensure_open().await.expect("open");

    mock.set_fail_requests(true);
    let err = session.call(read(1)).await.expect_err("io");
    assert!(matches!(err, SessionError::Transport(TransportError::Io(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!mock.link_open());
    assert_eq!(mock.close_count(), 1);

    assert_eq!(session.snapshot().reconnect_failures, 1);

    mock.set_fail_requests(false);
    let err = session.call(read(1)).await.expect_err("deferred");
    assert!(matches!(err, SessionError::Backoff(_)));
    assert_eq!(mock.open_attempts(), 1);

    tokio::time::sleep(Duration::from_millis(70)).await;
    session.call(read(1)).await.expect("reopened");
    assert_eq!(mock.open_attempts(), 2);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.snapshot().reconnect_failures, 0);
}

#[tokio::test]
async fn failures_after_reopen_keep_growing_until_a_reply() {
    let mock = MockTransport::new();
    mock.set_fail_requests(true);
    let session = Session::new("pump", Box::new(mock.clone()), fast_config());

    session.call(read(1)).await.expect_err("first");
    tokio::time::sleep(Duration::from_millis(70)).await;
    session.call(read(1)).await.expect_err("second");
    assert_eq!(mock.open_attempts(), 2);
    assert_eq!(session.snapshot().reconnect_failures, 2);

    // 第二次失败后等待 2 × step
    tokio::time::sleep(Duration::from_millis(70)).await;
    let err = session.ensure_open().await.expect_err("still deferred");
    assert!(matches!(err, SessionError::Backoff(_)));
    assert_eq!(mock.open_attempts(), 2);
}

#[tokio::test]
async fn http_device_down_backs_off_between_ticks() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let transport = HttpTransport::new(
        format!("http://127.0.0.1:{}", port),
        Default::default(),
        None,
        Timeouts::default(),
    );
    let session = Session::new("tv", Box::new(transport), fast_config());
    let status = || Request::Http {
        method: HttpMethod::Get,
        path: "/status".to_string(),
        body: None,
    };

    session.ensure_open().await.expect("client built");
    let err = session.call(status()).await.expect_err("refused");
    assert!(err.is_unavailable());
    assert_eq!(session.open_attempts(), 1);

    for _ in 0..3 {
        let err = session.ensure_open().await.expect_err("deferred");
        assert!(matches!(err, SessionError::Backoff(_)));
        assert!(matches!(session.call(status()).await, Err(SessionError::Backoff(_))));
    }
    assert_eq!(session.open_attempts(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(70)).await;
    session.ensure_open().await.expect("client rebuilt");
    session.call(status()).await.expect_err("still refused");
    assert_eq!(session.open_attempts(), 2);
    match session.ensure_open().await {
        Err(SessionError::Backoff(remaining)) => assert!(remaining > Duration::from_millis(60)),
        other => panic!("expected back-off, got {:?}", other),
    }
}

#[tokio::test]
async fn protocol_error_keeps_link() {
    let mock = MockTransport::new();
    mock.push_result(Err(TransportError::Protocol("exception: IllegalDataAddress".to_string())));
    let session = Session::new("plc", Box::new(mock.clone()), fast_config());

    let err = session.call(read(9)).await.expect_err("exception");
    assert!(!err.is_unavailable());
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(mock.link_open());
}

#[tokio::test]
async fn suspended_session_does_not_touch_transport() {
    let mock = MockTransport::new();
    let session = Session::new("heating", Box::new(mock.clone()), fast_config());
    session.ensure_open().await.expect("open");

    session.suspend().await;
    assert_eq!(session.state(), ConnectionState::Suspended);
    let err = session.call(read(2)).await.expect_err("suspended");
    assert!(matches!(err, SessionError::Suspended));
    assert!(mock.requests().is_empty());

    session.resume().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    session.call(read(2)).await.expect("resumed");
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn lock_deadline_reports_busy() {
    let mock = MockTransport::new();
    mock.set_delay(Duration::from_millis(400));
    let session = Arc::new(Session::new(
        "slow",
        Box::new(mock.clone()),
        SessionConfig {
            lock_timeout: Duration::from_millis(50),
            ..fast_config()
        },
    ));

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call(read(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let err = session.call(read(2)).await.expect_err("busy");
    assert!(matches!(err, SessionError::Busy(_)));

    first.await.expect("join").expect("first call");
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_call() {
    let mock = MockTransport::new();
    mock.set_delay(Duration::from_secs(30));
    let session = Arc::new(Session::new("hung", Box::new(mock.clone()), fast_config()));

    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call(read(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    tokio::time::timeout(Duration::from_secs(1), session.shutdown())
        .await
        .expect("shutdown bounded");
    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("call returned")
        .expect("join");

    assert!(matches!(result, Err(SessionError::Shutdown)));
    assert_eq!(session.state(), ConnectionState::Suspended);
    assert!(!mock.link_open());
    assert!(matches!(
        session.call(read(1)).await,
        Err(SessionError::Shutdown)
    ));
}

#[tokio::test]
async fn shutdown_without_open_is_noop() {
    let mock = MockTransport::new();
    let session = Session::new("idle", Box::new(mock.clone()), fast_config());

    session.shutdown().await;

    assert_eq!(mock.open_attempts(), 0);
    assert_eq!(mock.close_count(), 0);
}
