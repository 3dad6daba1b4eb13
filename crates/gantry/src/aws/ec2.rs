//! VPC infrastructure.
//!
//! The slice of EC2 that an App Runner service with VPC egress needs: the
//! VPC itself, private subnets for the database, and security groups.
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_ec2::{
    error::{ProvideErrorMetadata, SdkError},
    types::{
        AttributeBooleanValue, IpPermission, IpRange, ResourceType, Tag, TagSpecification,
        UserIdGroupPair,
    },
};

use crate::{self as gantry, remote::Remote, HasDependencies, Resource};

/// EC2 models no typed not-found variants, so deletes match on the error
/// code the service returns.
fn is_not_found<E, R>(err: &SdkError<E, R>, code: &str) -> bool
where
    E: ProvideErrorMetadata,
{
    err.as_service_error().and_then(|se| se.code()) == Some(code)
}

fn name_tags(resource_type: ResourceType, name: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key("Name").value(name).build())
        .build()
}

/// AWS VPC resource.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Vpc {
    pub name: String,
    pub cidr_block: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VpcOutput {
    pub vpc_id: String,
}

impl Resource for Vpc {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = VpcOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<VpcOutput> {
        let client = aws_sdk_ec2::Client::new(cfg);
        let vpc = client
            .create_vpc()
            .cidr_block(&self.cidr_block)
            .tag_specifications(name_tags(ResourceType::Vpc, &self.name))
            .send()
            .await?
            .vpc
            .context("no vpc")?;
        let vpc_id = vpc.vpc_id.context("missing vpc id")?;
        log::info!("...created vpc {} ({vpc_id})", self.name);

        // Database endpoints inside the VPC resolve through VPC DNS.
        client
            .modify_vpc_attribute()
            .vpc_id(&vpc_id)
            .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await?;
        client
            .modify_vpc_attribute()
            .vpc_id(&vpc_id)
            .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await?;
        Ok(VpcOutput { vpc_id })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &VpcOutput,
    ) -> anyhow::Result<VpcOutput> {
        anyhow::ensure!(
            self.cidr_block == previous_local.cidr_block,
            "changing the CIDR block requires destroying vpc '{}' and recreating",
            previous_local.name
        );
        let client = aws_sdk_ec2::Client::new(cfg);
        client
            .create_tags()
            .resources(&previous_remote.vpc_id)
            .tags(Tag::builder().key("Name").value(&self.name).build())
            .send()
            .await?;
        Ok(previous_remote.clone())
    }

    async fn delete(&self, cfg: &SdkConfig, previous_remote: &VpcOutput) -> anyhow::Result<()> {
        let client = aws_sdk_ec2::Client::new(cfg);
        match client
            .delete_vpc()
            .vpc_id(&previous_remote.vpc_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e, "InvalidVpcID.NotFound") => {
                log::debug!("vpc {} was already gone", previous_remote.vpc_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// AWS subnet resource.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Subnet {
    pub name: String,
    pub vpc_id: Remote<String>,
    pub cidr_block: String,
    pub availability_zone: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubnetOutput {
    pub subnet_id: String,
}

impl Resource for Subnet {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = SubnetOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<SubnetOutput> {
        let client = aws_sdk_ec2::Client::new(cfg);
        let subnet = client
            .create_subnet()
            .vpc_id(self.vpc_id.get()?)
            .cidr_block(&self.cidr_block)
            .availability_zone(&self.availability_zone)
            .tag_specifications(name_tags(ResourceType::Subnet, &self.name))
            .send()
            .await?
            .subnet
            .context("no subnet")?;
        let subnet_id = subnet.subnet_id.context("missing subnet id")?;
        log::info!(
            "...created subnet {} ({subnet_id}) in {}",
            self.name,
            self.availability_zone
        );
        Ok(SubnetOutput { subnet_id })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &SubnetOutput,
    ) -> anyhow::Result<SubnetOutput> {
        // Everything about a subnet except its name tag is fixed at creation.
        anyhow::ensure!(
            self.cidr_block == previous_local.cidr_block
                && self.availability_zone == previous_local.availability_zone
                && self.vpc_id == previous_local.vpc_id,
            "subnet '{}' requires destroying and recreating",
            previous_local.name
        );
        let client = aws_sdk_ec2::Client::new(cfg);
        client
            .create_tags()
            .resources(&previous_remote.subnet_id)
            .tags(Tag::builder().key("Name").value(&self.name).build())
            .send()
            .await?;
        Ok(previous_remote.clone())
    }

    async fn delete(&self, cfg: &SdkConfig, previous_remote: &SubnetOutput) -> anyhow::Result<()> {
        let client = aws_sdk_ec2::Client::new(cfg);
        match client
            .delete_subnet()
            .subnet_id(&previous_remote.subnet_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e, "InvalidSubnetID.NotFound") => {
                log::debug!("subnet {} was already gone", previous_remote.subnet_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// One allowed inbound flow on a [`SecurityGroup`].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    /// Peer security group the traffic may come from.
    pub source_security_group: Option<Remote<String>>,
    /// CIDR range the traffic may come from.
    pub cidr: Option<String>,
}

/// AWS security group resource.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct SecurityGroup {
    pub name: String,
    pub description: String,
    pub vpc_id: Remote<String>,
    pub ingress: Vec<IngressRule>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SecurityGroupOutput {
    pub group_id: String,
}

impl SecurityGroup {
    fn permission(rule: &IngressRule) -> anyhow::Result<IpPermission> {
        let mut permission = IpPermission::builder()
            .ip_protocol(&rule.protocol)
            .from_port(rule.from_port)
            .to_port(rule.to_port);
        if let Some(peer) = rule.source_security_group.as_ref() {
            permission = permission
                .user_id_group_pairs(UserIdGroupPair::builder().group_id(peer.get()?).build());
        }
        if let Some(cidr) = rule.cidr.as_ref() {
            permission = permission.ip_ranges(IpRange::builder().cidr_ip(cidr).build());
        }
        Ok(permission.build())
    }
}

impl Resource for SecurityGroup {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = SecurityGroupOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<SecurityGroupOutput> {
        let client = aws_sdk_ec2::Client::new(cfg);
        let group_id = client
            .create_security_group()
            .group_name(&self.name)
            .description(&self.description)
            .vpc_id(self.vpc_id.get()?)
            .tag_specifications(name_tags(ResourceType::SecurityGroup, &self.name))
            .send()
            .await?
            .group_id
            .context("missing security group id")?;
        log::info!("...created security group {} ({group_id})", self.name);
        for rule in self.ingress.iter() {
            client
                .authorize_security_group_ingress()
                .group_id(&group_id)
                .ip_permissions(Self::permission(rule)?)
                .send()
                .await?;
        }
        Ok(SecurityGroupOutput { group_id })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &SecurityGroupOutput,
    ) -> anyhow::Result<SecurityGroupOutput> {
        anyhow::ensure!(
            self.name == previous_local.name
                && self.description == previous_local.description
                && self.vpc_id == previous_local.vpc_id,
            "security group '{}' requires destroying and recreating",
            previous_local.name
        );
        let client = aws_sdk_ec2::Client::new(cfg);
        for rule in previous_local.ingress.iter() {
            if !self.ingress.contains(rule) {
                log::info!("revoking ingress on {}: {rule:?}", self.name);
                client
                    .revoke_security_group_ingress()
                    .group_id(&previous_remote.group_id)
                    .ip_permissions(Self::permission(rule)?)
                    .send()
                    .await?;
            }
        }
        for rule in self.ingress.iter() {
            if !previous_local.ingress.contains(rule) {
                log::info!("authorizing ingress on {}: {rule:?}", self.name);
                client
                    .authorize_security_group_ingress()
                    .group_id(&previous_remote.group_id)
                    .ip_permissions(Self::permission(rule)?)
                    .send()
                    .await?;
            }
        }
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        cfg: &SdkConfig,
        previous_remote: &SecurityGroupOutput,
    ) -> anyhow::Result<()> {
        let client = aws_sdk_ec2::Client::new(cfg);
        match client
            .delete_security_group()
            .group_id(&previous_remote.group_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e, "InvalidGroup.NotFound") => {
                log::debug!(
                    "security group {} was already gone",
                    previous_remote.group_id
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
