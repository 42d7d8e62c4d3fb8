#![allow(dead_code)]

use hostagent_common::CreateInstanceRequest;
use hostagent_lib::{Agent, AgentConfig};
use hostagent_runtime::FakeRuntime;
use hostagent_telemetry::InMemorySink;
use ssh_key::private::Ed25519Keypair;
use ssh_key::PrivateKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const RANGE_START: u16 = 30000;
pub const RANGE_END: u16 = 30009;

/// Ten auto ports, no host probing, no persistence, no startup delay.
pub fn test_config() -> AgentConfig {
    AgentConfig {
        port_range_start: RANGE_START,
        port_range_end: RANGE_END,
        probe_host_ports: false,
        runtime_timeout: Duration::from_secs(2),
        create_timeout: Duration::from_secs(5),
        provision_timeout: Duration::from_secs(5),
        runtime_retries: 1,
        startup_check: Duration::ZERO,
        state_file: None,
        ..Default::default()
    }
}

pub struct TestAgent {
    pub agent: Agent,
    pub runtime: FakeRuntime,
    pub sink: InMemorySink,
}

pub fn agent_with(config: AgentConfig, runtime: FakeRuntime) -> TestAgent {
    let sink = InMemorySink::new();
    let agent = Agent::new(config, Arc::new(runtime.clone()), Arc::new(sink.clone()));
    TestAgent {
        agent,
        runtime,
        sink,
    }
}

pub fn agent() -> TestAgent {
    agent_with(test_config(), FakeRuntime::new())
}

pub fn persistent_config(state_file: PathBuf) -> AgentConfig {
    AgentConfig {
        state_file: Some(state_file),
        ..test_config()
    }
}

pub fn request(image: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        image: image.to_string(),
        ..Default::default()
    }
}

/// Fresh ed25519 public key line.
pub fn public_key(comment: &str) -> String {
    let mut seed = [0u8; 32];
    seed[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    seed[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    let mut key = PrivateKey::from(Ed25519Keypair::from_seed(&seed))
        .public_key()
        .clone();
    key.set_comment(comment);
    key.to_openssh().unwrap()
}
