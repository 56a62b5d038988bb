//! Integration tests for mounting, unmounting and supervising cascaded endpoints

mod common;

use std::time::Duration;

use ::common::prelude::*;

use common::{endpoint, local_names, name, populate, setup_test_env, wait_for_count, wait_for_state};

fn drain<T>(rx: &flume::Receiver<T>) -> Vec<T> {
    rx.try_iter().collect()
}

#[tokio::test]
async fn test_mount_and_unmount_default_template() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A", "B"]);
    let lifecycle = env.registry.subscribe();

    let handle = env
        .service
        .mount(MountRequest::new(e.clone()).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();

    let mut names = local_names(&env.registry);
    names.sort();
    assert_eq!(
        names,
        vec!["/[10.0.0.1/9000]/app:type=A", "/[10.0.0.1/9000]/app:type=B"]
    );
    let proxy = env
        .registry
        .get(&name("/[10.0.0.1/9000]/app:type=A"))
        .unwrap();
    assert_eq!(proxy.remote_name, name("app:type=A"));
    assert_eq!(proxy.endpoint, e.address());

    env.service.unmount(handle).await.unwrap();
    assert!(env.registry.is_empty());

    let notifications = drain(&lifecycle);
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].kind, LifecycleKind::Added);
    assert_eq!(notifications[1].kind, LifecycleKind::Removed);
    assert_eq!(notifications[1].prefix, "/[10.0.0.1/9000]");
    assert_eq!(
        notifications[1].source,
        env.service.settings().delegate_name
    );
}

#[tokio::test]
async fn test_round_trip_leaves_no_residue() {
    let env = setup_test_env();
    env.registry
        .register_object(
            name("local:type=Existing"),
            ObjectProxy {
                remote_name: name("local:type=Existing"),
                endpoint: "local".to_string(),
                metadata: ObjectMetadata::default(),
            },
        )
        .await
        .unwrap();
    let before = local_names(&env.registry);

    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A", "B"]);
    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    assert_eq!(env.registry.len(), 3);

    env.service.unmount(handle).await.unwrap();
    assert_eq!(local_names(&env.registry), before);
}

#[tokio::test]
async fn test_mount_is_at_most_once_per_endpoint() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A"]);
    let request = MountRequest::new(e.clone()).with_target_path(DEFAULT_TARGET_PATH);

    let (first, second) = tokio::join!(
        env.service.mount(request.clone()),
        env.service.mount(request.clone())
    );
    let (ok, err) = match (first, second) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        other => panic!("expected exactly one success, got {:?}", other),
    };
    assert!(matches!(err, CascadeError::AlreadyMounted(_)));
    assert_eq!(env.service.list_mounts(), vec![ok]);
    assert_eq!(env.registry.len(), 1);

    // the endpoint is free again once unmounted
    env.service.unmount(ok).await.unwrap();
    let again = env.service.mount(request).await.unwrap();
    assert_ne!(again, ok);
    assert_eq!(env.registry.len(), 1);
}

#[tokio::test]
async fn test_unmount_is_idempotent() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A"]);
    let lifecycle = env.registry.subscribe();

    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    env.service.unmount(handle).await.unwrap();

    let err = env.service.unmount(handle).await.unwrap_err();
    assert_eq!(err, CascadeError::UnknownMount(handle));
    assert!(err.is_soft());

    let removed = drain(&lifecycle)
        .into_iter()
        .filter(|n| n.kind == LifecycleKind::Removed)
        .count();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_failed_connect_leaves_nothing_behind() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A"]);
    remote.set_reachable(false);
    let lifecycle = env.registry.subscribe();

    let err = env
        .service
        .mount(MountRequest::new(e.clone()).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CascadeError::Connection(ConnectionError::Refused { .. })
    ));
    assert!(err.is_retryable());
    assert!(env.service.list_mounts().is_empty());
    assert!(env.registry.is_empty());
    assert!(drain(&lifecycle).is_empty());

    // a later attempt is not blocked by the failed one
    remote.set_reachable(true);
    env.service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    assert_eq!(env.registry.len(), 1);
}

#[tokio::test]
async fn test_invalid_template_is_rejected_before_connecting() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A"]);

    let err = env
        .service
        .mount(MountRequest::new(e).with_target_path("%s/%s/%s"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CascadeError::InvalidPathTemplate(PathTemplateError::TooManySlots { .. })
    ));
    assert_eq!(remote.connect_count(), 0);
    assert!(env.service.list_mounts().is_empty());
}

#[tokio::test]
async fn test_pattern_and_query_filter_mounted_objects() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A", "B"]);
    remote.register(name("sys:type=A"), ObjectMetadata::new("A").with_attribute("kind", "A"));

    let handle = env
        .service
        .mount(
            MountRequest::new(e)
                .with_target_path(DEFAULT_TARGET_PATH)
                .with_pattern(NamePattern::parse("app:*").unwrap())
                .with_query(AttributeQuery::new().require("kind", "A")),
        )
        .await
        .unwrap();

    assert_eq!(
        local_names(&env.registry),
        vec!["/[10.0.0.1/9000]/app:type=A"]
    );

    // live registrations go through the same filters
    remote.register(name("app:type=C"), ObjectMetadata::new("C").with_attribute("kind", "A"));
    remote.register(name("app:type=D"), ObjectMetadata::new("D").with_attribute("kind", "D"));
    remote.register(name("sys:type=E"), ObjectMetadata::new("E").with_attribute("kind", "A"));
    wait_for_count(&env.registry, 2).await;
    assert!(env.registry.contains(&name("/[10.0.0.1/9000]/app:type=C")));

    remote.unregister(&name("app:type=A"));
    wait_for_count(&env.registry, 1).await;

    let info = env.service.mount_info(handle).await.unwrap();
    assert_eq!(info.object_count, 1);
    assert_eq!(info.state, AgentState::Active);
}

#[tokio::test]
async fn test_connectivity_loss_and_restore() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A", "B"]);

    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    let before = local_names(&env.registry);
    let agent = env.service.agent(handle).unwrap();
    let events = env.service.subscribe(handle).unwrap();

    remote.fail();
    wait_for_state(&agent, AgentState::Failed).await;
    assert!(env.registry.is_empty());
    // still mounted as far as the service is concerned
    assert_eq!(env.service.list_mounts(), vec![handle]);

    remote.restore();
    wait_for_state(&agent, AgentState::Active).await;
    assert_eq!(local_names(&env.registry), before);
    assert_eq!(remote.connect_count(), 1);

    let mut transitions = Vec::new();
    while transitions.len() < 2 {
        let event = tokio::time::timeout(common::WAIT, events.recv_async())
            .await
            .expect("timed out waiting for agent events")
            .unwrap();
        if let AgentEvent::ConnectivityChanged { event, state } = event {
            transitions.push((event, state));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (ConnectivityEvent::Failed, AgentState::Failed),
            (ConnectivityEvent::Opened, AgentState::Active),
        ]
    );
}

#[tokio::test]
async fn test_unmount_while_failed() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A"]);
    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    let agent = env.service.agent(handle).unwrap();

    remote.fail();
    wait_for_state(&agent, AgentState::Failed).await;
    env.service.unmount(handle).await.unwrap();
    assert_eq!(agent.state(), AgentState::Stopped);

    // a restore after the stop must not bring anything back
    remote.restore();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(env.registry.is_empty());
    assert_eq!(remote.close_count(), 1);
}

#[tokio::test]
async fn test_lost_notifications_trigger_resync() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A", "B"]);
    env.service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();

    remote.unregister_silently(&name("app:type=A"));
    remote.register_silently(name("app:type=C"), ObjectMetadata::new("C"));
    assert_eq!(env.registry.len(), 2);

    remote.lose_notifications();
    tokio::time::timeout(common::WAIT, async {
        while !env.registry.contains(&name("/[10.0.0.1/9000]/app:type=C")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut names = local_names(&env.registry);
    names.sort();
    assert_eq!(
        names,
        vec!["/[10.0.0.1/9000]/app:type=B", "/[10.0.0.1/9000]/app:type=C"]
    );
}

#[tokio::test]
async fn test_object_collisions_are_skipped() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A", "B"]);

    // root mount: the remote names land unchanged and one is taken
    env.registry
        .register_object(
            name("app:type=A"),
            ObjectProxy {
                remote_name: name("app:type=A"),
                endpoint: "local".to_string(),
                metadata: ObjectMetadata::default(),
            },
        )
        .await
        .unwrap();

    let handle = env.service.mount(MountRequest::new(e)).await.unwrap();
    let agent = env.service.agent(handle).unwrap();
    assert_eq!(agent.mounted_objects().await, vec![name("app:type=B")]);
    assert_eq!(agent.target_path(), "");

    env.service.unmount(handle).await.unwrap();
    // the unrelated object is untouched
    assert_eq!(local_names(&env.registry), vec!["app:type=A"]);
}

#[tokio::test]
async fn test_occupied_prefix_aborts_mount() {
    let env = setup_test_env();
    let first = endpoint("10.0.0.1", 9000);
    let second = endpoint("10.0.0.1", 9001);
    populate(&env, &first, &["A"]);
    populate(&env, &second, &["B"]);

    // a host-only template cannot tell the two apart
    env.service
        .mount(MountRequest::new(first).with_target_path("/[%s]"))
        .await
        .unwrap();
    let err = env
        .service
        .mount(MountRequest::new(second).with_target_path("/[%s]"))
        .await
        .unwrap_err();
    assert!(matches!(err, CascadeError::NameCollision { .. }));
    assert_eq!(env.service.list_mounts().len(), 1);
    assert_eq!(local_names(&env.registry), vec!["/[10.0.0.1]/app:type=A"]);
}

#[tokio::test]
async fn test_distinct_endpoints_reconcile() {
    let env = setup_test_env();
    let endpoints: Vec<EndpointDescriptor> =
        (0..5).map(|i| endpoint("10.0.0.1", 9000 + i)).collect();
    for e in &endpoints {
        populate(&env, e, &["A", "B"]);
    }
    env.transport.endpoint(&endpoints[4]).set_reachable(false);

    let mut handles = Vec::new();
    for e in &endpoints {
        if let Ok(handle) = env
            .service
            .mount(MountRequest::new(e.clone()).with_target_path(DEFAULT_TARGET_PATH))
            .await
        {
            handles.push(handle);
        }
    }
    assert_eq!(handles.len(), 4);
    assert_eq!(env.registry.len(), 8);

    env.service.unmount(handles[1]).await.unwrap();
    assert_eq!(env.service.list_mounts().len(), 3);
    assert_eq!(env.registry.len(), 6);

    env.service.shutdown().await;
    assert!(env.service.list_mounts().is_empty());
    assert!(env.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_mount_times_out() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A"])
        .set_connect_delay(Some(Duration::from_secs(120)));

    let err = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CascadeError::Connection(ConnectionError::Timeout { .. })
    ));
    assert!(env.service.list_mounts().is_empty());
}

/// Receive the next `count` events an agent forwards
async fn next_events(rx: &flume::Receiver<AgentEvent>, count: usize) -> Vec<AgentEvent> {
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        let event = tokio::time::timeout(common::WAIT, rx.recv_async())
            .await
            .expect("timed out waiting for agent events")
            .unwrap();
        events.push(event);
    }
    events
}

fn added(local: &str, remote: &str) -> AgentEvent {
    AgentEvent::ObjectAdded {
        local_name: name(local),
        remote_name: name(remote),
    }
}

fn removed(local: &str) -> AgentEvent {
    AgentEvent::ObjectRemoved {
        local_name: name(local),
    }
}

#[tokio::test]
async fn test_prefix_stays_claimed_while_owner_failed() {
    let env = setup_test_env();
    // distinct addresses, same host and port, so the same prefix
    let first = endpoint("10.0.0.1", 9000).with_path("/a");
    let second = endpoint("10.0.0.1", 9000).with_path("/b");
    let remote = populate(&env, &first, &["A"]);
    populate(&env, &second, &["B"]);

    let handle = env
        .service
        .mount(MountRequest::new(first).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    let agent = env.service.agent(handle).unwrap();
    remote.fail();
    wait_for_state(&agent, AgentState::Failed).await;
    assert!(env.registry.is_empty());

    let request = MountRequest::new(second).with_target_path(DEFAULT_TARGET_PATH);
    let err = env.service.mount(request.clone()).await.unwrap_err();
    match err {
        CascadeError::NameCollision { prefix, .. } => assert_eq!(prefix, "/[10.0.0.1/9000]"),
        other => panic!("expected a prefix collision, got {:?}", other),
    }
    assert_eq!(env.service.list_mounts(), vec![handle]);

    remote.restore();
    wait_for_state(&agent, AgentState::Active).await;
    assert_eq!(local_names(&env.registry), vec!["/[10.0.0.1/9000]/app:type=A"]);

    // released with the mount
    env.service.unmount(handle).await.unwrap();
    env.service.mount(request).await.unwrap();
    assert_eq!(local_names(&env.registry), vec!["/[10.0.0.1/9000]/app:type=B"]);
}

#[tokio::test]
async fn test_prefix_is_claimed_by_an_empty_mount() {
    let env = setup_test_env();
    let first = endpoint("10.0.0.1", 9000).with_path("/a");
    let second = endpoint("10.0.0.1", 9000).with_path("/b");
    populate(&env, &first, &["A"]);
    populate(&env, &second, &["B"]);
    let lifecycle = env.registry.subscribe();

    // the pattern matches nothing, so the prefix holds no objects
    let handle = env
        .service
        .mount(
            MountRequest::new(first)
                .with_target_path(DEFAULT_TARGET_PATH)
                .with_pattern(NamePattern::parse("none:*").unwrap()),
        )
        .await
        .unwrap();
    assert!(env.registry.is_empty());

    let request = MountRequest::new(second).with_target_path(DEFAULT_TARGET_PATH);
    assert!(matches!(
        env.service.mount(request.clone()).await,
        Err(CascadeError::NameCollision { .. })
    ));

    env.service.unmount(handle).await.unwrap();
    let kinds: Vec<LifecycleKind> = drain(&lifecycle).into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![LifecycleKind::Added, LifecycleKind::Removed]);

    env.service.mount(request).await.unwrap();
    assert_eq!(local_names(&env.registry), vec!["/[10.0.0.1/9000]/app:type=B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_mounts_at_one_prefix() {
    let env = setup_test_env();
    let first = endpoint("10.0.0.1", 9000).with_path("/a");
    let second = endpoint("10.0.0.1", 9000).with_path("/b");
    populate(&env, &first, &["A"]);
    populate(&env, &second, &["B"]);

    let (a, b) = tokio::join!(
        env.service
            .mount(MountRequest::new(first).with_target_path(DEFAULT_TARGET_PATH)),
        env.service
            .mount(MountRequest::new(second).with_target_path(DEFAULT_TARGET_PATH))
    );
    let (ok, err) = match (a, b) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        other => panic!("expected exactly one success, got {:?}", other),
    };
    assert!(matches!(err, CascadeError::NameCollision { .. }));
    assert_eq!(env.service.list_mounts(), vec![ok]);
    assert_eq!(env.registry.len(), 1);
}

#[tokio::test]
async fn test_live_object_events_are_forwarded() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A"]);
    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    let events = env.service.subscribe(handle).unwrap();

    remote.register(name("app:type=C"), ObjectMetadata::new("C"));
    remote.unregister(&name("app:type=A"));

    assert_eq!(
        next_events(&events, 2).await,
        vec![
            added("/[10.0.0.1/9000]/app:type=C", "app:type=C"),
            removed("/[10.0.0.1/9000]/app:type=A"),
        ]
    );
}

#[tokio::test]
async fn test_remote_close_is_handled_like_a_failure() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A", "B"]);
    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    let agent = env.service.agent(handle).unwrap();
    let events = env.service.subscribe(handle).unwrap();

    remote.close_link();
    wait_for_state(&agent, AgentState::Failed).await;
    assert!(env.registry.is_empty());
    assert_eq!(
        next_events(&events, 3).await,
        vec![
            removed("/[10.0.0.1/9000]/app:type=A"),
            removed("/[10.0.0.1/9000]/app:type=B"),
            AgentEvent::ConnectivityChanged {
                event: ConnectivityEvent::Closed,
                state: AgentState::Failed,
            },
        ]
    );

    remote.restore();
    wait_for_state(&agent, AgentState::Active).await;
    assert_eq!(
        next_events(&events, 3).await,
        vec![
            added("/[10.0.0.1/9000]/app:type=A", "app:type=A"),
            added("/[10.0.0.1/9000]/app:type=B", "app:type=B"),
            AgentEvent::ConnectivityChanged {
                event: ConnectivityEvent::Opened,
                state: AgentState::Active,
            },
        ]
    );
}

#[tokio::test]
async fn test_lost_notifications_are_forwarded() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A"]);
    let handle = env
        .service
        .mount(MountRequest::new(e).with_target_path(DEFAULT_TARGET_PATH))
        .await
        .unwrap();
    let events = env.service.subscribe(handle).unwrap();

    remote.register_silently(name("app:type=C"), ObjectMetadata::new("C"));
    remote.lose_notifications();

    assert_eq!(
        next_events(&events, 2).await,
        vec![
            added("/[10.0.0.1/9000]/app:type=C", "app:type=C"),
            AgentEvent::ConnectivityChanged {
                event: ConnectivityEvent::NotificationsLost,
                state: AgentState::Active,
            },
        ]
    );
}

#[tokio::test]
async fn test_reregistration_refreshes_or_drops_the_object() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    let remote = populate(&env, &e, &["A"]);
    let handle = env
        .service
        .mount(
            MountRequest::new(e)
                .with_target_path(DEFAULT_TARGET_PATH)
                .with_query(AttributeQuery::new().require("kind", "A")),
        )
        .await
        .unwrap();
    let events = env.service.subscribe(handle).unwrap();
    let local = name("/[10.0.0.1/9000]/app:type=A");

    remote.register(
        name("app:type=A"),
        ObjectMetadata::new("A2").with_attribute("kind", "A"),
    );
    tokio::time::timeout(common::WAIT, async {
        while env.registry.get(&local).map(|p| p.metadata.type_name) != Some("A2".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("metadata was never refreshed");

    // no longer accepted by the query
    remote.register(
        name("app:type=A"),
        ObjectMetadata::new("A3").with_attribute("kind", "Z"),
    );
    assert_eq!(
        next_events(&events, 1).await,
        vec![removed("/[10.0.0.1/9000]/app:type=A")]
    );
    assert!(env.registry.is_empty());
}

#[tokio::test]
async fn test_strict_mount_fails_on_object_collision() {
    let env = setup_test_env();
    let e = endpoint("10.0.0.1", 9000);
    populate(&env, &e, &["A", "B"]);
    env.registry
        .register_object(
            name("app:type=B"),
            ObjectProxy {
                remote_name: name("app:type=B"),
                endpoint: "local".to_string(),
                metadata: ObjectMetadata::default(),
            },
        )
        .await
        .unwrap();
    let lifecycle = env.registry.subscribe();

    let err = env
        .service
        .mount(MountRequest::new(e.clone()).strict())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CascadeError::Registry(RegistryError::NameCollision(name("app:type=B")))
    );
    // the object mounted before the collision is rolled back
    assert_eq!(local_names(&env.registry), vec!["app:type=B"]);
    assert!(env.service.list_mounts().is_empty());
    assert!(drain(&lifecycle).is_empty());

    // the default skips the collision instead
    let handle = env.service.mount(MountRequest::new(e)).await.unwrap();
    let agent = env.service.agent(handle).unwrap();
    assert_eq!(agent.mounted_objects().await, vec![name("app:type=A")]);
}
