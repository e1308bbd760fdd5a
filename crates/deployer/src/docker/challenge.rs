//! Challenge containers — create, start, stop, remove, inspect, enumerate.

use std::collections::HashMap;

use bollard::models::{ContainerCreateBody, EndpointSettings, HostConfig, NetworkingConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};

use super::client::{classify, DockerClient, DriverError};
use crate::conf::DeployerConfig;

/// Label marking containers this deployment owns.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label marking per-user challenge instances (as opposed to the fixed
/// system services on the same project).
pub const CHALLENGE_LABEL: &str = "ctf.challenge";

/// Everything the engine needs to materialize one challenge instance.
#[derive(Debug, Clone)]
pub struct ChallengeSpec {
    pub image: String,
    pub host_port: u16,
    pub port_in_container: u16,
    pub network_name: String,
    pub flag: String,
    pub compose_project: String,
    pub memory: i64,
    pub memory_swap: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub no_new_privileges: bool,
    pub read_only: bool,
    pub tmpfs: Option<String>,
    pub drop_all_caps: bool,
    pub cap_add: Vec<String>,
}

impl ChallengeSpec {
    pub fn from_config(config: &DeployerConfig, host_port: u16) -> Self {
        let mut cap_add = Vec::new();
        if config.security.cap_net_bind {
            cap_add.push("NET_BIND_SERVICE".to_string());
        }
        if config.security.cap_chown {
            cap_add.push("CHOWN".to_string());
        }
        Self {
            image: config.challenge_image.clone(),
            host_port,
            port_in_container: config.ports.port_in_container,
            network_name: config.network.network_name.clone(),
            flag: config.flag.clone(),
            compose_project: config.compose_project.clone(),
            memory: config.limits.per_container_mem,
            memory_swap: config.limits.per_container_swap,
            nano_cpus: config.limits.nano_cpus(),
            pids_limit: config.limits.per_container_pids,
            no_new_privileges: config.security.no_new_privileges,
            read_only: config.security.read_only,
            tmpfs: config
                .security
                .tmpfs_enable
                .then(|| config.security.tmpfs_size.clone()),
            drop_all_caps: config.security.drop_all_caps,
            cap_add,
        }
    }

    pub fn container_name(&self) -> String {
        format!("ctf-challenge-{}", self.host_port)
    }

    fn create_body(&self) -> ContainerCreateBody {
        let container_port = format!("{}/tcp", self.port_in_container);

        let mut security_opt = Vec::new();
        if self.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }

        let mut labels = HashMap::new();
        labels.insert(PROJECT_LABEL.to_string(), self.compose_project.clone());
        labels.insert(CHALLENGE_LABEL.to_string(), "true".to_string());

        ContainerCreateBody {
            image: Some(self.image.clone()),
            env: Some(vec![format!("FLAG={}", self.flag)]),
            labels: Some(labels),
            exposed_ports: Some(vec![container_port.clone()]),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some({
                    let mut endpoints = HashMap::new();
                    endpoints.insert(self.network_name.clone(), EndpointSettings::default());
                    endpoints
                }),
            }),
            host_config: Some(HostConfig {
                memory: Some(self.memory),
                memory_swap: Some(self.memory_swap),
                nano_cpus: Some(self.nano_cpus),
                pids_limit: Some(self.pids_limit),
                port_bindings: Some(
                    [(
                        container_port,
                        Some(vec![PortBinding {
                            host_ip: Some("0.0.0.0".to_string()),
                            host_port: Some(self.host_port.to_string()),
                        }]),
                    )]
                    .into_iter()
                    .collect(),
                ),
                security_opt: (!security_opt.is_empty()).then_some(security_opt),
                readonly_rootfs: Some(self.read_only),
                tmpfs: self.tmpfs.as_ref().map(|size| {
                    let mut mounts = HashMap::new();
                    mounts.insert("/tmp".to_string(), format!("size={}", size));
                    mounts
                }),
                cap_drop: self.drop_all_caps.then(|| vec!["ALL".to_string()]),
                cap_add: (!self.cap_add.is_empty()).then(|| self.cap_add.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Summary of one engine container, as the admin surface needs it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub is_challenge: bool,
}

impl DockerClient {
    /// Create and start one challenge instance; returns the engine id.
    pub async fn run_challenge(&self, spec: &ChallengeSpec) -> Result<String, DriverError> {
        let options = CreateContainerOptionsBuilder::new()
            .name(&spec.container_name())
            .build();

        let created = self
            .client
            .create_container(Some(options), spec.create_body())
            .await
            .map_err(classify)?;

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // A created-but-unstartable container must not linger.
            let start_err = classify(e);
            if let Err(cleanup) = self.remove_container(&created.id, true).await {
                if !cleanup.is_not_found() {
                    tracing::error!(
                        container_id = %created.id,
                        error = %cleanup,
                        "Failed to clean up container after start failure"
                    );
                }
            }
            return Err(start_err);
        }

        tracing::info!(
            container_id = %created.id,
            port = spec.host_port,
            "Challenge container started"
        );
        Ok(created.id)
    }

    /// Stop a running container with a timeout (in seconds).
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout_secs: u32,
    ) -> Result<(), DriverError> {
        let options = StopContainerOptions {
            t: Some(timeout_secs as i32),
            ..Default::default()
        };
        self.client
            .stop_container(container_id, Some(options))
            .await
            .map_err(classify)
    }

    /// Force-remove a container. `NotFound` propagates so callers on
    /// cleanup paths can treat it as success explicitly.
    pub async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
    ) -> Result<(), DriverError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(classify)
    }

    /// Current engine-side state string ("running", "exited", …).
    pub async fn container_state(&self, container_id: &str) -> Result<String, DriverError> {
        let details = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(classify)?;
        Ok(details
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string()))
    }

    /// Enumerate containers belonging to this deployment (challenge
    /// instances plus the fixed system services), by project label.
    pub async fn list_deployment_containers(
        &self,
        compose_project: &str,
    ) -> Result<Vec<ContainerSnapshot>, DriverError> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let labels = summary.labels.clone().unwrap_or_default();
                if labels.get(PROJECT_LABEL).map(String::as_str) != Some(compose_project) {
                    return None;
                }
                Some(ContainerSnapshot {
                    id: summary.id.unwrap_or_default(),
                    name: summary
                        .names
                        .as_deref()
                        .and_then(|n| n.first())
                        .map(|n| n.trim_start_matches('/'))
                        .unwrap_or("unknown")
                        .to_string(),
                    image: summary.image.unwrap_or_default(),
                    state: summary
                        .state
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".into()),
                    is_challenge: labels.get(CHALLENGE_LABEL).map(String::as_str) == Some("true"),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec() -> ChallengeSpec {
        let mut vars = HashMap::new();
        for (k, v) in [
            ("DEPLOYER_CHALLENGE_IMAGE", "ctf/pwn:1"),
            ("DEPLOYER_FLAG", "flag{x}"),
            ("DEPLOYER_ADMIN_KEY", "super-secret-key"),
            ("DEPLOYER_DB_NAME", "ctf"),
            ("DEPLOYER_DB_USER", "ctf"),
            ("DEPLOYER_DB_PASSWORD", "pw-pw-pw-pw"),
            ("DEPLOYER_PORT_IN_CONTAINER", "1337"),
            ("DEPLOYER_START_RANGE", "9000"),
            ("DEPLOYER_STOP_RANGE", "9100"),
        ] {
            vars.insert(k.to_string(), v.to_string());
        }
        let config = DeployerConfig::from_map(&vars).unwrap();
        ChallengeSpec::from_config(&config, 9007)
    }

    #[test]
    fn test_container_name_embeds_port() {
        assert_eq!(spec().container_name(), "ctf-challenge-9007");
    }

    #[test]
    fn test_create_body_port_binding() {
        let body = spec().create_body();
        let host_config = body.host_config.unwrap();
        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings["1337/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("9007"));
        assert_eq!(binding[0].host_ip.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn test_create_body_security_hardening() {
        let body = spec().create_body();
        let host_config = body.host_config.unwrap();
        assert_eq!(
            host_config.security_opt.as_deref(),
            Some(&["no-new-privileges:true".to_string()][..])
        );
        assert_eq!(host_config.readonly_rootfs, Some(true));
        assert_eq!(host_config.cap_drop.as_deref(), Some(&["ALL".to_string()][..]));
        let cap_add = host_config.cap_add.unwrap();
        assert!(cap_add.contains(&"NET_BIND_SERVICE".to_string()));
        assert!(cap_add.contains(&"CHOWN".to_string()));
        assert_eq!(
            host_config.tmpfs.unwrap().get("/tmp").map(String::as_str),
            Some("size=64m")
        );
    }

    #[test]
    fn test_create_body_limits() {
        let body = spec().create_body();
        let host_config = body.host_config.unwrap();
        assert_eq!(host_config.memory, Some(512 * 1024 * 1024));
        assert_eq!(host_config.nano_cpus, Some(500_000_000));
        assert_eq!(host_config.pids_limit, Some(64));
    }

    #[test]
    fn test_create_body_flag_env_and_labels() {
        let body = spec().create_body();
        assert!(body.env.unwrap().contains(&"FLAG=flag{x}".to_string()));
        let labels = body.labels.unwrap();
        assert_eq!(labels.get(PROJECT_LABEL).map(String::as_str), Some("ctf-deployer"));
        assert_eq!(labels.get(CHALLENGE_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_create_body_network_attachment() {
        let body = spec().create_body();
        let networking = body.networking_config.unwrap();
        assert!(networking
            .endpoints_config
            .unwrap()
            .contains_key("ctf_net"));
    }
}
