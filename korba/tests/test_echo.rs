use korba::{
    ByteOrder, OrbOptions, Request, SystemExceptionKind, TypeCode, Value,
};

use crate::{echo_fixture, shutdown, ECHO_ID, OOPS_ID};

#[tokio::test]
async fn echo_round_trip() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let mut request = Request::new(fixture.proxy.clone(), "echo");
    request
        .add_in_arg(TypeCode::String(0), Value::string("hello"))
        .set_return_type(TypeCode::String(0));
    request.invoke().await.unwrap();
    assert_eq!(request.return_value(), &Value::string("hello"));

    shutdown(fixture).await;
}

#[tokio::test]
async fn invoke_with_inferred_typecodes() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let result = fixture
        .client
        .invoke(
            &fixture.proxy,
            "add",
            &[Value::Long(30), Value::Long(12)],
            Some(&TypeCode::Long),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::Long(42));

    shutdown(fixture).await;
}

#[tokio::test]
async fn echo_over_giop_1_0_and_1_1_little_endian() {
    for minor in [0u8, 1] {
        let options = OrbOptions {
            giop_minor: minor,
            byte_order: ByteOrder::Little,
            ..Default::default()
        };
        let fixture = echo_fixture(options).await;
        let result = fixture
            .client
            .invoke(
                &fixture.proxy,
                "echo",
                &[Value::string("interop")],
                Some(&TypeCode::String(0)),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::string("interop"));
        shutdown(fixture).await;
    }
}

#[tokio::test]
async fn user_exception_travels_unconverted() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let err = fixture
        .client
        .invoke(&fixture.proxy, "fail", &[], None)
        .await
        .unwrap_err();
    match err {
        korba::OrbError::User(user) => {
            assert_eq!(user.repository_id, OOPS_ID);
        }
        other => panic!("expected a user exception, got {other}"),
    }

    shutdown(fixture).await;
}

#[tokio::test]
async fn unknown_operation_is_bad_operation() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let err = fixture
        .client
        .invoke(&fixture.proxy, "does_not_exist", &[], None)
        .await
        .unwrap_err();
    assert!(err.is_system(SystemExceptionKind::BadOperation));

    shutdown(fixture).await;
}

#[tokio::test]
async fn unknown_object_key_is_object_not_exist() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let (host, port) = fixture.server.endpoint();
    let bogus = fixture.client.object_from_ior(korba::Ior::new_iiop(
        ECHO_ID,
        host,
        port,
        b"no-such-object".to_vec(),
    ));
    let err = fixture
        .client
        .invoke(&bogus, "echo", &[Value::string("x")], None)
        .await
        .unwrap_err();
    let system = err.system().expect("system exception");
    assert_eq!(
        system.repository_id(),
        "IDL:omg.org/CORBA/OBJECT_NOT_EXIST:1.0"
    );

    shutdown(fixture).await;
}

#[tokio::test]
async fn implicit_operations() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    assert!(fixture.proxy.is_a(ECHO_ID).await.unwrap());
    // ask the servant, bypassing the local type-id match
    assert!(fixture
        .proxy
        .is_a("IDL:omg.org/CORBA/Object:1.0")
        .await
        .unwrap());
    assert!(!fixture.proxy.is_a("IDL:Test/Other:1.0").await.unwrap());
    assert!(!fixture.proxy.non_existent().await.unwrap());

    shutdown(fixture).await;
}

#[tokio::test]
async fn deferred_request_polls_then_completes() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let mut request = Request::new(fixture.proxy.clone(), "echo");
    request
        .add_in_arg(TypeCode::String(0), Value::string("later"))
        .set_return_type(TypeCode::String(0));
    request.send_deferred().unwrap();
    // double send is rejected
    assert!(request.send_deferred().is_err());
    while !request.poll_response() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    request.get_response().await.unwrap();
    assert_eq!(request.return_value(), &Value::string("later"));

    shutdown(fixture).await;
}

#[tokio::test]
async fn stringified_reference_survives_orbs() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let stringified = fixture.client.object_to_string(&fixture.proxy).unwrap();
    let reparsed = fixture.client.string_to_object(&stringified).await.unwrap();
    assert!(reparsed.is_equivalent(&fixture.proxy));
    assert_eq!(
        reparsed.hash(1000),
        fixture.proxy.hash(1000)
    );

    shutdown(fixture).await;
}
