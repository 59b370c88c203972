//! Topologies shared by the integration tests.

#![allow(dead_code)]

use netbuilder::TopologyConfig;

/// `stacks` section for generic-device end nodes.
pub fn stacks(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| {
            format!("[[stacks]]\nname = \"{name}\"\nqdevice = {{ kind = \"generic\" }}\n\n")
        })
        .collect()
}

/// Alice and Bob joined by one link and an instant classical channel.
pub fn alice_bob(link: &str) -> TopologyConfig {
    let toml = format!(
        r#"{stacks}
[[links]]
nodes = ["Alice", "Bob"]
{link}

[[clinks]]
nodes = ["Alice", "Bob"]
kind = "instant"
"#,
        stacks = stacks(&["Alice", "Bob"]),
    );
    TopologyConfig::from_toml_str(&toml).expect("valid topology")
}

/// One hub over `nodes` with perfect links and the given scheduler.
pub fn hub(nodes: &[&str], scheduler: &str) -> TopologyConfig {
    let members = nodes
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        r#"{stacks}
[[hubs]]
name = "metro"
nodes = [{members}]
link = {{ kind = "perfect", config = {{ state_delay = 1000 }} }}
clink = {{ kind = "default", config = {{ delay = 500 }} }}
scheduler = {scheduler}
"#,
        stacks = stacks(nodes),
    );
    TopologyConfig::from_toml_str(&toml).expect("valid topology")
}
