//! App Runner infrastructure.
//!
//! App Runner's declarative surface covers services and VPC connectors,
//! but auto scaling configurations exist only as a raw create/delete call
//! pair. [`AutoScalingConfig`] assembles that pair into a real resource via
//! [`CustomResource`], so the service definition can reference its ARN like
//! any other output.
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_apprunner::{
    operation::create_auto_scaling_configuration::CreateAutoScalingConfigurationOutput,
    types::{
        AuthenticationConfiguration, EgressConfiguration, EgressType, ImageConfiguration,
        ImageRepository, ImageRepositoryType, InstanceConfiguration, NetworkConfiguration,
        SourceConfiguration,
    },
};

use crate::{
    self as gantry,
    lifecycle::{ActionPair, CustomResource, DeleteOutcome, InvalidSpec, InvalidSpecSnafu,
        LifecycleError},
    remote::Remote,
    HasDependencies, Resource,
};

/// App Runner auto scaling configuration.
///
/// Validated locally before anything is sent: capacity bounds must be
/// positive and ordered, and the concurrency threshold positive.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct AutoScalingConfig {
    pub name: String,
    /// Instances kept warm at all times.
    pub min_size: i32,
    /// Hard ceiling on running instances.
    pub max_size: i32,
    /// Concurrent requests per instance before scaling out.
    pub max_concurrency: i32,
}

impl AutoScalingConfig {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        snafu::ensure!(
            !self.name.is_empty(),
            InvalidSpecSnafu {
                reason: "name must not be empty",
            }
        );
        snafu::ensure!(
            self.min_size > 0,
            InvalidSpecSnafu {
                reason: format!("min size {} must be positive", self.min_size),
            }
        );
        snafu::ensure!(
            self.max_size >= self.min_size,
            InvalidSpecSnafu {
                reason: format!(
                    "max size {} is below min size {}",
                    self.max_size, self.min_size
                ),
            }
        );
        snafu::ensure!(
            self.max_concurrency > 0,
            InvalidSpecSnafu {
                reason: format!("max concurrency {} must be positive", self.max_concurrency),
            }
        );
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AutoScalingConfigOutput {
    pub arn: String,
}

/// The create/delete call pair behind [`AutoScalingConfig`].
pub struct AutoScalingActions {
    client: aws_sdk_apprunner::Client,
}

impl AutoScalingActions {
    pub fn new(cfg: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_apprunner::Client::new(cfg),
        }
    }
}

impl ActionPair for AutoScalingActions {
    type Spec = AutoScalingConfig;
    type Response = CreateAutoScalingConfigurationOutput;
    type Error = anyhow::Error;

    fn validate(spec: &AutoScalingConfig) -> Result<(), InvalidSpec> {
        spec.validate()
    }

    async fn create(
        &self,
        spec: &AutoScalingConfig,
    ) -> anyhow::Result<CreateAutoScalingConfigurationOutput> {
        let out = self
            .client
            .create_auto_scaling_configuration()
            .auto_scaling_configuration_name(&spec.name)
            .min_size(spec.min_size)
            .max_size(spec.max_size)
            .max_concurrency(spec.max_concurrency)
            .send()
            .await?;
        Ok(out)
    }

    fn identifier(response: &CreateAutoScalingConfigurationOutput) -> Option<String> {
        response
            .auto_scaling_configuration()
            .and_then(|config| config.auto_scaling_configuration_arn())
            .map(|arn| arn.to_owned())
    }

    async fn delete(&self, handle: &str) -> anyhow::Result<DeleteOutcome> {
        match self
            .client
            .delete_auto_scaling_configuration()
            .auto_scaling_configuration_arn(handle)
            .send()
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false);
                if gone {
                    Ok(DeleteOutcome::NotFound)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

impl Resource for AutoScalingConfig {
    type Provider = SdkConfig;
    type Error = LifecycleError;
    type Output = AutoScalingConfigOutput;

    async fn create(&self, cfg: &SdkConfig) -> Result<AutoScalingConfigOutput, LifecycleError> {
        let mut rez = CustomResource::new(AutoScalingActions::new(cfg));
        let arn = rez.create(self).await?;
        Ok(AutoScalingConfigOutput { arn })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        _previous_local: &Self,
        previous_remote: &AutoScalingConfigOutput,
    ) -> Result<AutoScalingConfigOutput, LifecycleError> {
        // Configurations are immutable: a changed definition becomes a new
        // revision under the same name. The superseded revision stays until
        // teardown, since the service may still reference it mid-apply.
        log::info!(
            "creating a new revision superseding {}",
            previous_remote.arn
        );
        let mut rez = CustomResource::new(AutoScalingActions::new(cfg));
        let arn = rez.create(self).await?;
        Ok(AutoScalingConfigOutput { arn })
    }

    async fn delete(
        &self,
        cfg: &SdkConfig,
        previous_remote: &AutoScalingConfigOutput,
    ) -> Result<(), LifecycleError> {
        let mut rez = CustomResource::resume(
            AutoScalingActions::new(cfg),
            previous_remote.arn.clone(),
        )?;
        rez.delete().await
    }
}

/// App Runner VPC connector resource.
///
/// Gives services egress into the subnets that can reach the database.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct VpcConnector {
    pub name: String,
    pub subnets: Vec<Remote<String>>,
    pub security_groups: Vec<Remote<String>>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VpcConnectorOutput {
    pub arn: String,
}

impl Resource for VpcConnector {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = VpcConnectorOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<VpcConnectorOutput> {
        let client = aws_sdk_apprunner::Client::new(cfg);
        let mut req = client.create_vpc_connector().vpc_connector_name(&self.name);
        for subnet in self.subnets.iter() {
            req = req.subnets(subnet.get()?);
        }
        for group in self.security_groups.iter() {
            req = req.security_groups(group.get()?);
        }
        let connector = req.send().await?.vpc_connector.context("no vpc connector")?;
        log::info!("...created vpc connector {}", self.name);
        Ok(VpcConnectorOutput {
            arn: connector
                .vpc_connector_arn
                .context("missing vpc connector arn")?,
        })
    }

    async fn update(
        &self,
        _cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &VpcConnectorOutput,
    ) -> anyhow::Result<VpcConnectorOutput> {
        // Connectors have no update call.
        anyhow::ensure!(
            self == previous_local,
            "vpc connector '{}' requires destroying and recreating",
            previous_local.name
        );
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        cfg: &SdkConfig,
        previous_remote: &VpcConnectorOutput,
    ) -> anyhow::Result<()> {
        let client = aws_sdk_apprunner::Client::new(cfg);
        match client
            .delete_vpc_connector()
            .vpc_connector_arn(&previous_remote.arn)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false);
                if gone {
                    log::debug!("vpc connector {} was already gone", self.name);
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

/// Where a service's container image lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RepositoryKind {
    /// A private ECR repository; requires an access role.
    Ecr,
    /// A public ECR gallery image.
    EcrPublic,
}

impl HasDependencies for RepositoryKind {}

impl RepositoryKind {
    fn sdk(self) -> ImageRepositoryType {
        match self {
            RepositoryKind::Ecr => ImageRepositoryType::Ecr,
            RepositoryKind::EcrPublic => ImageRepositoryType::EcrPublic,
        }
    }
}

/// One environment variable handed to the running container.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct EnvVar {
    pub name: String,
    pub value: Remote<String>,
}

/// App Runner service resource.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Service {
    pub name: String,
    pub image_identifier: String,
    pub repository_kind: RepositoryKind,
    /// Port the container listens on.
    pub port: String,
    /// vCPU units, e.g. "1024".
    pub cpu: String,
    /// Memory in MB, e.g. "2048".
    pub memory: String,
    pub environment: Vec<EnvVar>,
    pub auto_scaling_configuration: Remote<String>,
    /// Role App Runner assumes to pull from private ECR.
    pub access_role: Option<Remote<String>>,
    /// Role the running tasks assume, e.g. to read the database secret.
    pub instance_role: Option<Remote<String>>,
    /// Egress through a VPC connector instead of the public default.
    pub vpc_connector: Option<Remote<String>>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceOutput {
    pub arn: String,
    pub service_id: String,
    /// Public URL; absent for private endpoints.
    pub url: Option<String>,
    pub status: String,
}

impl Service {
    fn source_configuration(&self) -> anyhow::Result<SourceConfiguration> {
        let mut image_config = ImageConfiguration::builder().port(&self.port);
        for var in self.environment.iter() {
            image_config = image_config.runtime_environment_variables(&var.name, var.value.get()?);
        }
        let image = ImageRepository::builder()
            .image_identifier(&self.image_identifier)
            .image_repository_type(self.repository_kind.sdk())
            .image_configuration(image_config.build())
            .build()
            .context("image repository")?;
        let mut source = SourceConfiguration::builder()
            .image_repository(image)
            .auto_deployments_enabled(false);
        if let Some(role) = self.access_role.as_ref() {
            source = source.authentication_configuration(
                AuthenticationConfiguration::builder()
                    .access_role_arn(role.get()?)
                    .build(),
            );
        }
        Ok(source.build())
    }

    fn instance_configuration(&self) -> anyhow::Result<InstanceConfiguration> {
        let mut instance = InstanceConfiguration::builder()
            .cpu(&self.cpu)
            .memory(&self.memory);
        if let Some(role) = self.instance_role.as_ref() {
            instance = instance.instance_role_arn(role.get()?);
        }
        Ok(instance.build())
    }

    fn network_configuration(&self) -> anyhow::Result<Option<NetworkConfiguration>> {
        Ok(match self.vpc_connector.as_ref() {
            Some(connector) => Some(
                NetworkConfiguration::builder()
                    .egress_configuration(
                        EgressConfiguration::builder()
                            .egress_type(EgressType::Vpc)
                            .vpc_connector_arn(connector.get()?)
                            .build(),
                    )
                    .build(),
            ),
            None => None,
        })
    }
}

fn service_output(service: aws_sdk_apprunner::types::Service) -> ServiceOutput {
    ServiceOutput {
        arn: service.service_arn,
        service_id: service.service_id,
        url: service.service_url,
        status: service.status.as_str().to_owned(),
    }
}

impl Resource for Service {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = ServiceOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<ServiceOutput> {
        let client = aws_sdk_apprunner::Client::new(cfg);
        let mut req = client
            .create_service()
            .service_name(&self.name)
            .source_configuration(self.source_configuration()?)
            .instance_configuration(self.instance_configuration()?)
            .auto_scaling_configuration_arn(self.auto_scaling_configuration.get()?);
        if let Some(network) = self.network_configuration()? {
            req = req.network_configuration(network);
        }
        let service = req.send().await?.service.context("no service")?;
        log::info!(
            "...created app runner service {} ({})",
            self.name,
            service.status.as_str()
        );
        Ok(service_output(service))
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &ServiceOutput,
    ) -> anyhow::Result<ServiceOutput> {
        anyhow::ensure!(
            self.name == previous_local.name,
            "service rename requires destroying '{}' and recreating",
            previous_local.name
        );
        let client = aws_sdk_apprunner::Client::new(cfg);
        let mut req = client
            .update_service()
            .service_arn(&previous_remote.arn)
            .source_configuration(self.source_configuration()?)
            .instance_configuration(self.instance_configuration()?)
            .auto_scaling_configuration_arn(self.auto_scaling_configuration.get()?);
        if let Some(network) = self.network_configuration()? {
            req = req.network_configuration(network);
        }
        let service = req.send().await?.service.context("no service")?;
        log::info!(
            "...updated app runner service {} ({})",
            self.name,
            service.status.as_str()
        );
        Ok(service_output(service))
    }

    async fn delete(&self, cfg: &SdkConfig, previous_remote: &ServiceOutput) -> anyhow::Result<()> {
        let client = aws_sdk_apprunner::Client::new(cfg);
        match client
            .delete_service()
            .service_arn(&previous_remote.arn)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false);
                if gone {
                    log::debug!("service {} was already gone", self.name);
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;

    fn config() -> AutoScalingConfig {
        AutoScalingConfig {
            name: "web".to_owned(),
            min_size: 1,
            max_size: 3,
            max_concurrency: 100,
        }
    }

    #[test]
    fn validation() {
        assert!(config().validate().is_ok());
        assert!(AutoScalingConfig {
            name: String::new(),
            ..config()
        }
        .validate()
        .is_err());
        assert!(AutoScalingConfig {
            min_size: 0,
            ..config()
        }
        .validate()
        .is_err());
        assert!(AutoScalingConfig {
            min_size: 3,
            max_size: 1,
            ..config()
        }
        .validate()
        .is_err());
        assert!(AutoScalingConfig {
            max_concurrency: 0,
            ..config()
        }
        .validate()
        .is_err());
    }

    struct FakeSummary {
        arn: Option<String>,
    }

    /// Mirrors the create response: the ARN sits one level down in an
    /// optional configuration summary.
    struct FakeCreateResponse {
        auto_scaling_configuration: Option<FakeSummary>,
    }

    #[derive(Default)]
    struct FakeScalingPlane {
        create_calls: Cell<usize>,
        revision: Cell<usize>,
        live: Cell<bool>,
    }

    impl ActionPair for FakeScalingPlane {
        type Spec = AutoScalingConfig;
        type Response = FakeCreateResponse;
        type Error = String;

        fn validate(spec: &AutoScalingConfig) -> Result<(), InvalidSpec> {
            spec.validate()
        }

        async fn create(&self, spec: &AutoScalingConfig) -> Result<FakeCreateResponse, String> {
            self.create_calls.set(self.create_calls.get() + 1);
            self.revision.set(self.revision.get() + 1);
            self.live.set(true);
            Ok(FakeCreateResponse {
                auto_scaling_configuration: Some(FakeSummary {
                    arn: Some(format!(
                        "arn:aws:apprunner:us-east-1:000000000000:autoscalingconfiguration/{}/{}",
                        spec.name,
                        self.revision.get()
                    )),
                }),
            })
        }

        fn identifier(response: &FakeCreateResponse) -> Option<String> {
            response
                .auto_scaling_configuration
                .as_ref()?
                .arn
                .clone()
        }

        async fn delete(&self, _handle: &str) -> Result<DeleteOutcome, String> {
            if self.live.replace(false) {
                Ok(DeleteOutcome::Deleted)
            } else {
                Ok(DeleteOutcome::NotFound)
            }
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let mut rez = CustomResource::new(FakeScalingPlane::default());
        let handle = rez.create(&config()).await.unwrap();
        assert!(handle.contains("autoscalingconfiguration/web"));
        assert_eq!(handle, rez.handle().unwrap());

        // Teardown is idempotent: the second delete sees "not found" and
        // still succeeds.
        rez.delete().await.unwrap();
        rez.delete().await.unwrap();
    }

    #[tokio::test]
    async fn inverted_sizes_never_reach_the_control_plane() {
        let mut rez = CustomResource::new(FakeScalingPlane::default());
        let err = rez
            .create(&AutoScalingConfig {
                min_size: 3,
                max_size: 1,
                ..config()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation { .. }), "{err}");
        assert_eq!(0, rez.actions().create_calls.get());
    }
}
