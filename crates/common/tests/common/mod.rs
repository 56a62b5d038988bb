//! Shared fixtures for cascading integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ::common::prelude::*;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestEnv {
    pub transport: MemoryTransport,
    pub registry: MemoryRegistry,
    pub service: CascadingService,
}

pub fn setup_test_env() -> TestEnv {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let transport = MemoryTransport::new();
    let registry = MemoryRegistry::new();
    let settings = CascadeSettings {
        connect_timeout: Duration::from_secs(1),
        enumerate_timeout: Duration::from_secs(1),
        ..CascadeSettings::default()
    };
    let service = CascadingService::new(
        Arc::new(transport.clone()),
        Arc::new(registry.clone()),
        settings,
    );
    TestEnv {
        transport,
        registry,
        service,
    }
}

pub fn endpoint(host: &str, port: u16) -> EndpointDescriptor {
    EndpointDescriptor::new("jmx:rmi", host, port)
}

pub fn name(s: &str) -> ObjectName {
    ObjectName::parse(s).unwrap()
}

/// Populate a remote endpoint with `type=<t>` objects in domain `app`
pub fn populate(env: &TestEnv, endpoint: &EndpointDescriptor, types: &[&str]) -> Arc<MemoryEndpoint> {
    let remote = env.transport.endpoint(endpoint);
    for t in types {
        remote.register(
            name(&format!("app:type={}", t)),
            ObjectMetadata::new(*t).with_attribute("kind", *t),
        );
    }
    remote
}

pub fn local_names(registry: &MemoryRegistry) -> Vec<String> {
    registry.names(None).into_iter().map(|n| n.to_string()).collect()
}

/// Wait until the registry holds exactly `count` names
pub async fn wait_for_count(registry: &MemoryRegistry, count: usize) {
    tokio::time::timeout(WAIT, async {
        while registry.len() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {} names, has {:?}", count, local_names(registry)));
}

pub async fn wait_for_state(agent: &CascadingAgent, state: AgentState) {
    let mut rx = agent.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for agent state")
        .expect("agent dropped");
}
