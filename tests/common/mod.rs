//! Shared model classes and store setup for the integration suites.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};

use topograph::{
    BindingEnd, DeleteAction, MemoryBackend, ObjectClass, ObjectStore, StoreConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bridge {
    pub id: String,
    pub name: String,
    pub port_ids: Vec<String>,
}

impl ObjectClass for Bridge {
    const NAME: &'static str = "Bridge";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Port {
    pub id: String,
    pub bridge_id: Option<String>,
    pub router_id: Option<String>,
}

impl ObjectClass for Port {
    const NAME: &'static str = "Port";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Router {
    pub id: String,
    pub port_ids: Vec<String>,
}

impl ObjectClass for Router {
    const NAME: &'static str = "Router";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chain {
    pub id: String,
    pub rule_ids: Vec<String>,
}

impl ObjectClass for Chain {
    const NAME: &'static str = "Chain";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    pub chain_id: Option<String>,
}

impl ObjectClass for Rule {
    const NAME: &'static str = "Rule";
}

/// Bindings used throughout the suites:
///
/// * `Bridge.port_ids ↔ Port.bridge_id`, both CLEAR
/// * `Router.port_ids ↔ Port.router_id`, ERROR on the router side
/// * `Chain.rule_ids ↔ Rule.chain_id`, CASCADE on the chain side
pub async fn build_store(
    backend: MemoryBackend,
    config: StoreConfig,
) -> ObjectStore<MemoryBackend> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ObjectStore::builder(backend)
        .config(config)
        .register_class::<Bridge>()
        .unwrap()
        .register_class::<Port>()
        .unwrap()
        .register_class::<Router>()
        .unwrap()
        .register_class::<Chain>()
        .unwrap()
        .register_class::<Rule>()
        .unwrap()
        .bind::<Bridge, Port>(
            BindingEnd::list("port_ids", DeleteAction::Clear),
            BindingEnd::single("bridge_id", DeleteAction::Clear),
        )
        .unwrap()
        .bind::<Router, Port>(
            BindingEnd::list("port_ids", DeleteAction::Error),
            BindingEnd::single("router_id", DeleteAction::Clear),
        )
        .unwrap()
        .bind::<Chain, Rule>(
            BindingEnd::list("rule_ids", DeleteAction::Cascade),
            BindingEnd::single("chain_id", DeleteAction::Clear),
        )
        .unwrap()
        .build()
        .await
        .unwrap()
}

pub async fn fresh_store() -> ObjectStore<MemoryBackend> {
    build_store(MemoryBackend::new(), StoreConfig::default()).await
}

pub fn bridge(id: &str) -> Bridge {
    Bridge {
        id: id.to_string(),
        name: format!("bridge-{id}"),
        port_ids: Vec::new(),
    }
}

pub fn port(id: &str, bridge_id: Option<&str>) -> Port {
    Port {
        id: id.to_string(),
        bridge_id: bridge_id.map(String::from),
        router_id: None,
    }
}

pub fn router(id: &str, port_ids: &[&str]) -> Router {
    Router {
        id: id.to_string(),
        port_ids: port_ids.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn chain(id: &str, rule_ids: &[&str]) -> Chain {
    Chain {
        id: id.to_string(),
        rule_ids: rule_ids.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn rule(id: &str, chain_id: Option<&str>) -> Rule {
    Rule {
        id: id.to_string(),
        chain_id: chain_id.map(String::from),
    }
}
