//! ContainerSpec to Docker API parameters

// Bollard 0.19 deprecates the container::Config API
#![allow(deprecated)]

use bollard::container::{Config, CreateContainerOptions};
use bollard::models::{HostConfig, PortBinding};
use nimbus_backend::{ContainerSpec, TaskOptions};
use nimbus_core::model::PortMapping;
use std::collections::HashMap;

/// Label set on every container nimbus creates
pub const MANAGED_LABEL: &str = "nimbus.managed";
/// Label carrying the network handle the container belongs to
pub const NETWORK_LABEL: &str = "nimbus.network";
pub const TASK_LABEL: &str = "nimbus.task";

/// `80/tcp` style key used by the Docker API
pub fn port_key(port: &PortMapping) -> String {
    format!("{}/{}", port.container, port.protocol)
}

/// Image reference with an explicit tag
pub fn image_reference(image: &str) -> String {
    let name_part = image.rsplit('/').next().unwrap_or(image);
    if name_part.contains(':') || image.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Convert a spec into Docker create parameters.
///
/// `network_mode` is the Docker network to join; a spec whose `network_id`
/// is not a Docker network only carries it as a label.
pub fn spec_to_container_config(
    spec: &ContainerSpec,
    network_mode: Option<String>,
) -> (Config<String>, CreateContainerOptions<String>) {
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut port_bindings = HashMap::new();
    let mut exposed_ports = HashMap::new();
    for port in &spec.ports {
        let key = port_key(port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                // empty host port lets Docker pick one
                host_port: (port.host != 0).then(|| port.host.to_string()),
            }]),
        );
    }

    let binds: Vec<String> = spec
        .mounts
        .iter()
        .map(|m| {
            let mode = if m.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", m.source, m.target, mode)
        })
        .collect();

    let host_config = Some(HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(binds),
        network_mode,
        memory: spec.memory_bytes,
        nano_cpus: spec.cpus.map(|c| (c * 1_000_000_000.0) as i64),
        extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
        ..Default::default()
    });

    let mut labels = spec.labels.clone();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    if let Some(network) = &spec.network_id {
        labels.insert(NETWORK_LABEL.to_string(), network.clone());
    }

    let config = Config {
        image: Some(image_reference(&spec.image)),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        host_config,
        labels: Some(labels),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.clone(),
        platform: None,
    };

    (config, options)
}

/// A task is a container without published ports, labelled as a task
pub fn task_to_spec(options: &TaskOptions) -> ContainerSpec {
    let mut spec = ContainerSpec::new(&options.name, &options.image);
    spec.cmd = options.cmd.clone();
    spec.env = options.env.clone();
    spec.memory_bytes = options.memory_bytes;
    spec.network_id = options.network_id.clone();
    spec.labels
        .insert(TASK_LABEL.to_string(), "true".to_string());
    spec
}
