use korba::{
    NameComponent, NamingContext, NamingServant, Orb, OrbOptions, TypeCode, Value,
    NAMING_CONTEXT_ID,
};

use crate::{echo_fixture, init_logging, shutdown};

const NAME_SERVICE_KEY: &[u8] = b"NameService";

#[tokio::test]
async fn bind_and_resolve_across_orbs() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    // host a naming context next to the echo servant
    let (_, naming_ior) =
        NamingServant::activate(fixture.server.root_poa(), NAME_SERVICE_KEY).unwrap();
    assert_eq!(naming_ior.type_id, NAMING_CONTEXT_ID);

    let root = NamingContext::narrow(
        fixture
            .client
            .string_to_object(&naming_ior.stringify())
            .await
            .unwrap(),
    )
    .await
    .unwrap();

    let applications = root
        .bind_new_context(&[NameComponent::new("Applications", "")])
        .await
        .unwrap();
    applications
        .bind(
            &[NameComponent::new("Echo", "Service")],
            &fixture.proxy,
        )
        .await
        .unwrap();

    // a third ORB resolves the compound name and invokes
    let second = Orb::init(OrbOptions::default()).await.unwrap();
    let root2 = NamingContext::from_object(
        second
            .string_to_object(&naming_ior.stringify())
            .await
            .unwrap(),
    );
    let resolved = root2.resolve_str("Applications/Echo.Service").await.unwrap();
    let result = second
        .invoke(
            &resolved,
            "echo",
            &[Value::string("via naming")],
            Some(&TypeCode::String(0)),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::string("via naming"));

    second.shutdown(false).await;
    shutdown(fixture).await;
}

#[tokio::test]
async fn corbaname_url_resolution() {
    let fixture = echo_fixture(OrbOptions::default()).await;
    let (_, naming_ior) =
        NamingServant::activate(fixture.server.root_poa(), NAME_SERVICE_KEY).unwrap();

    let root = NamingContext::from_object(
        fixture
            .client
            .string_to_object(&naming_ior.stringify())
            .await
            .unwrap(),
    );
    root.bind(&[NameComponent::new("echo", "")], &fixture.proxy)
        .await
        .unwrap();

    let (host, port) = fixture.server.endpoint();
    let url = format!("corbaname:iiop:{host}:{port}#echo");
    let resolved = fixture.client.string_to_object(&url).await.unwrap();
    let result = fixture
        .client
        .invoke(
            &resolved,
            "echo",
            &[Value::string("via url")],
            Some(&TypeCode::String(0)),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::string("via url"));

    shutdown(fixture).await;
}

#[tokio::test]
async fn naming_faults_surface_as_user_exceptions() {
    init_logging();
    let fixture = echo_fixture(OrbOptions::default()).await;
    let (_, naming_ior) =
        NamingServant::activate(fixture.server.root_poa(), NAME_SERVICE_KEY).unwrap();
    let root = NamingContext::from_object(
        fixture
            .client
            .string_to_object(&naming_ior.stringify())
            .await
            .unwrap(),
    );

    let name = vec![NameComponent::new("solo", "")];
    root.bind(&name, &fixture.proxy).await.unwrap();
    let err = root.bind(&name, &fixture.proxy).await.unwrap_err();
    match err {
        korba::OrbError::User(user) => assert_eq!(
            user.repository_id,
            "IDL:omg.org/CosNaming/NamingContext/AlreadyBound:1.0"
        ),
        other => panic!("expected AlreadyBound, got {other}"),
    }

    // rebind replaces without complaint
    root.rebind(&name, &fixture.proxy).await.unwrap();

    let err = root
        .resolve(&[NameComponent::new("missing", "")])
        .await
        .unwrap_err();
    match err {
        korba::OrbError::User(user) => assert_eq!(
            user.repository_id,
            "IDL:omg.org/CosNaming/NamingContext/NotFound:1.0"
        ),
        other => panic!("expected NotFound, got {other}"),
    }

    root.unbind(&name).await.unwrap();
    assert!(root.resolve(&name).await.is_err());

    shutdown(fixture).await;
}

#[tokio::test]
async fn narrow_rejects_non_context() {
    let fixture = echo_fixture(OrbOptions::default()).await;

    let err = NamingContext::narrow(fixture.proxy.clone()).await.unwrap_err();
    assert!(err.is_system(korba::SystemExceptionKind::BadParam));

    shutdown(fixture).await;
}
