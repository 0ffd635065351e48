use std::time::{Duration, Instant};

use futures_util::future::join_all;
use korba::{
    CompletionStatus, LocateStatus, OrbOptions, SystemExceptionKind, TypeCode, Value,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use crate::{echo_fixture, init_logging, shutdown, ECHO_ID};

#[tokio::test]
async fn hundred_concurrent_calls_share_one_connection() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let started = Instant::now();
    let calls = (0..100).map(|i| {
        let client = fixture.client.clone();
        let proxy = fixture.proxy.clone();
        async move {
            let payload = format!("payload-{i}");
            let result = client
                .invoke(
                    &proxy,
                    "echo",
                    &[Value::string(payload.clone())],
                    Some(&TypeCode::String(0)),
                )
                .await
                .unwrap();
            assert_eq!(result, Value::string(payload));
        }
    });
    join_all(calls).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    shutdown(fixture).await;
}

#[tokio::test]
async fn holding_delays_dispatch_until_activate() {
    let fixture = echo_fixture(OrbOptions::default()).await;
    let manager = fixture.server.root_poa().manager().clone();

    // first call proves the path, then the manager goes on hold
    fixture
        .client
        .invoke(
            &fixture.proxy,
            "echo",
            &[Value::string("warm")],
            Some(&TypeCode::String(0)),
        )
        .await
        .unwrap();
    manager.hold_requests().unwrap();

    let held = {
        let client = fixture.client.clone();
        let proxy = fixture.proxy.clone();
        tokio::spawn(async move {
            client
                .invoke(
                    &proxy,
                    "echo",
                    &[Value::string("held")],
                    Some(&TypeCode::String(0)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!held.is_finished());

    manager.activate().unwrap();
    let result = held.await.unwrap().unwrap();
    assert_eq!(result, Value::string("held"));

    shutdown(fixture).await;
}

#[tokio::test]
async fn discarding_rejects_with_transient() {
    let fixture = echo_fixture(OrbOptions::default()).await;
    let manager = fixture.server.root_poa().manager().clone();
    manager.discard_requests().unwrap();

    let err = fixture
        .client
        .invoke(&fixture.proxy, "echo", &[Value::string("x")], None)
        .await
        .unwrap_err();
    assert!(err.is_system(SystemExceptionKind::Transient));

    shutdown(fixture).await;
}

#[tokio::test]
async fn oneway_leaves_no_pending_request() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let mut request = korba::Request::new(fixture.proxy.clone(), "notify");
    request.add_in_arg(TypeCode::String(0), Value::string("ping"));
    request.send_oneway().await.unwrap();

    // the notification lands without any reply having been sent
    let mut seen = 0;
    for _ in 0..200 {
        seen = fixture
            .servant
            .notifications
            .load(std::sync::atomic::Ordering::SeqCst);
        if seen == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, 1);

    // the remote count op agrees once a normal two-way lands
    let count = fixture
        .client
        .invoke(
            &fixture.proxy,
            "notification_count",
            &[],
            Some(&TypeCode::ULongLong),
        )
        .await
        .unwrap();
    assert_eq!(count, Value::ULongLong(1));

    shutdown(fixture).await;
}

#[tokio::test]
async fn abrupt_close_mid_call_is_comm_failure_maybe() {
    init_logging();
    // a fake server that accepts, reads the request, then slams the socket
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
        drop(stream);
    });

    let client = korba::Orb::init(OrbOptions::default()).await.unwrap();
    let target = client.object_from_ior(korba::Ior::new_iiop(
        ECHO_ID,
        "127.0.0.1",
        port,
        b"echo".to_vec(),
    ));
    let err = client
        .invoke(&target, "echo", &[Value::string("x")], None)
        .await
        .unwrap_err();
    let system = err.system().expect("system exception");
    assert_eq!(system.kind, SystemExceptionKind::CommFailure);
    assert_eq!(system.completed, CompletionStatus::Maybe);

    client.shutdown(false).await;
}

#[tokio::test]
async fn silent_server_times_out_as_transient() {
    init_logging();
    // accepts and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                break;
            }
        }
    });

    let client = korba::Orb::init(OrbOptions {
        request_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await
    .unwrap();
    let target = client.object_from_ior(korba::Ior::new_iiop(
        ECHO_ID,
        "127.0.0.1",
        port,
        b"echo".to_vec(),
    ));
    let err = client
        .invoke(&target, "echo", &[Value::string("x")], None)
        .await
        .unwrap_err();
    assert!(err.is_system(SystemExceptionKind::Transient));

    client.shutdown(false).await;
}

#[tokio::test]
async fn connect_refused_is_comm_failure() {
    init_logging();
    let client = korba::Orb::init(OrbOptions::default()).await.unwrap();
    // bind-then-drop leaves a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let target = client.object_from_ior(korba::Ior::new_iiop(
        ECHO_ID,
        "127.0.0.1",
        port,
        b"echo".to_vec(),
    ));
    let err = client
        .invoke(&target, "echo", &[Value::string("x")], None)
        .await
        .unwrap_err();
    let system = err.system().expect("system exception");
    assert_eq!(system.kind, SystemExceptionKind::CommFailure);
    assert_eq!(system.completed, CompletionStatus::No);

    client.shutdown(false).await;
}

#[tokio::test]
async fn locate_request_answers_object_here() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    assert_eq!(
        fixture.proxy.locate().await.unwrap(),
        LocateStatus::ObjectHere
    );

    let (host, port) = fixture.server.endpoint();
    let bogus = fixture.client.object_from_ior(korba::Ior::new_iiop(
        ECHO_ID,
        host,
        port,
        b"nobody".to_vec(),
    ));
    assert_eq!(bogus.locate().await.unwrap(), LocateStatus::UnknownObject);

    shutdown(fixture).await;
}

#[tokio::test]
async fn shutdown_rejects_new_invocations() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    fixture.client.shutdown(true).await;
    let err = fixture
        .client
        .invoke(&fixture.proxy, "echo", &[Value::string("x")], None)
        .await
        .unwrap_err();
    assert!(err.is_system(SystemExceptionKind::BadInvOrder));

    fixture.server.shutdown(false).await;
}

#[tokio::test]
async fn slow_servant_still_answers_within_deadline() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let result = fixture
        .client
        .invoke(
            &fixture.proxy,
            "nap",
            &[Value::ULong(50)],
            Some(&TypeCode::Boolean),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::Boolean(true));

    shutdown(fixture).await;
}
