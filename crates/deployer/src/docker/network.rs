//! Challenge network — created idempotently at boot.

use bollard::models::{Ipam, IpamConfig, NetworkCreateRequest};

use super::client::{classify, DockerClient, DriverError};

impl DockerClient {
    /// Make sure the challenge network exists. An existing network is
    /// reused as-is, whatever its subnet.
    pub async fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), DriverError> {
        let inspect_options = None::<bollard::query_parameters::InspectNetworkOptions>;
        if self.client.inspect_network(name, inspect_options).await.is_ok() {
            tracing::debug!(network = %name, "Challenge network already exists");
            return Ok(());
        }

        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ipam: Some(Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.client.create_network(request).await {
            Ok(_) => {
                tracing::info!(network = %name, subnet = %subnet, "Created challenge network");
                Ok(())
            }
            // Lost a race with another creator; the network exists now.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}
