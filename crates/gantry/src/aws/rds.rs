//! Aurora infrastructure.
//!
//! A Serverless v2 Aurora MySQL cluster reachable only from inside the
//! VPC, with its master password managed by the platform.
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_rds::types::ServerlessV2ScalingConfiguration;

use crate::{self as gantry, remote::Remote, HasDependencies, Resource};

/// AWS DB subnet group resource.
///
/// Aurora requires subnets in at least two availability zones.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct DbSubnetGroup {
    pub name: String,
    pub description: String,
    pub subnet_ids: Vec<Remote<String>>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbSubnetGroupOutput {
    pub name: String,
    pub arn: String,
}

impl Resource for DbSubnetGroup {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = DbSubnetGroupOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<DbSubnetGroupOutput> {
        let client = aws_sdk_rds::Client::new(cfg);
        let mut req = client
            .create_db_subnet_group()
            .db_subnet_group_name(&self.name)
            .db_subnet_group_description(&self.description);
        for subnet in self.subnet_ids.iter() {
            req = req.subnet_ids(subnet.get()?);
        }
        let group = req
            .send()
            .await?
            .db_subnet_group
            .context("no db subnet group")?;
        log::info!("...created db subnet group {}", self.name);
        Ok(DbSubnetGroupOutput {
            name: group.db_subnet_group_name.context("missing name")?,
            arn: group.db_subnet_group_arn.context("missing arn")?,
        })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &DbSubnetGroupOutput,
    ) -> anyhow::Result<DbSubnetGroupOutput> {
        anyhow::ensure!(
            self.name == previous_local.name,
            "db subnet group rename requires destroying '{}' and recreating",
            previous_local.name
        );
        let client = aws_sdk_rds::Client::new(cfg);
        let mut req = client
            .modify_db_subnet_group()
            .db_subnet_group_name(&self.name)
            .db_subnet_group_description(&self.description);
        for subnet in self.subnet_ids.iter() {
            req = req.subnet_ids(subnet.get()?);
        }
        req.send().await?;
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        cfg: &SdkConfig,
        _previous_remote: &DbSubnetGroupOutput,
    ) -> anyhow::Result<()> {
        let client = aws_sdk_rds::Client::new(cfg);
        match client
            .delete_db_subnet_group()
            .db_subnet_group_name(&self.name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_db_subnet_group_not_found_fault())
                    .unwrap_or(false);
                if gone {
                    log::debug!("db subnet group {} was already gone", self.name);
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

/// AWS Aurora cluster resource.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct DbCluster {
    pub identifier: String,
    /// e.g. "aurora-mysql"
    pub engine: String,
    pub database_name: String,
    pub master_username: String,
    pub db_subnet_group: Remote<String>,
    pub security_group_ids: Vec<Remote<String>>,
    /// Serverless v2 capacity bounds, in ACUs.
    pub min_capacity: f64,
    pub max_capacity: f64,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbClusterOutput {
    pub identifier: String,
    pub arn: String,
    pub endpoint: String,
    pub reader_endpoint: String,
    /// Secrets Manager ARN of the managed master password.
    pub master_user_secret_arn: Option<String>,
}

fn cluster_output(cluster: aws_sdk_rds::types::DbCluster) -> anyhow::Result<DbClusterOutput> {
    Ok(DbClusterOutput {
        identifier: cluster
            .db_cluster_identifier
            .context("missing cluster identifier")?,
        arn: cluster.db_cluster_arn.context("missing cluster arn")?,
        endpoint: cluster.endpoint.context("missing cluster endpoint")?,
        reader_endpoint: cluster
            .reader_endpoint
            .context("missing cluster reader endpoint")?,
        master_user_secret_arn: cluster
            .master_user_secret
            .and_then(|secret| secret.secret_arn),
    })
}

impl DbCluster {
    fn scaling(&self) -> ServerlessV2ScalingConfiguration {
        ServerlessV2ScalingConfiguration::builder()
            .min_capacity(self.min_capacity)
            .max_capacity(self.max_capacity)
            .build()
    }
}

impl Resource for DbCluster {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = DbClusterOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<DbClusterOutput> {
        let client = aws_sdk_rds::Client::new(cfg);
        let mut req = client
            .create_db_cluster()
            .db_cluster_identifier(&self.identifier)
            .engine(&self.engine)
            .database_name(&self.database_name)
            .master_username(&self.master_username)
            .manage_master_user_password(true)
            .db_subnet_group_name(self.db_subnet_group.get()?)
            .serverless_v2_scaling_configuration(self.scaling());
        for sg in self.security_group_ids.iter() {
            req = req.vpc_security_group_ids(sg.get()?);
        }
        let cluster = req.send().await?.db_cluster.context("no db cluster")?;
        log::info!("...created db cluster {}", self.identifier);
        cluster_output(cluster)
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        _previous_remote: &DbClusterOutput,
    ) -> anyhow::Result<DbClusterOutput> {
        anyhow::ensure!(
            self.identifier == previous_local.identifier
                && self.engine == previous_local.engine
                && self.database_name == previous_local.database_name
                && self.master_username == previous_local.master_username,
            "db cluster '{}' requires destroying and recreating",
            previous_local.identifier
        );
        let client = aws_sdk_rds::Client::new(cfg);
        let mut req = client
            .modify_db_cluster()
            .db_cluster_identifier(&self.identifier)
            .serverless_v2_scaling_configuration(self.scaling())
            .apply_immediately(true);
        for sg in self.security_group_ids.iter() {
            req = req.vpc_security_group_ids(sg.get()?);
        }
        let cluster = req.send().await?.db_cluster.context("no db cluster")?;
        cluster_output(cluster)
    }

    async fn delete(
        &self,
        cfg: &SdkConfig,
        _previous_remote: &DbClusterOutput,
    ) -> anyhow::Result<()> {
        let client = aws_sdk_rds::Client::new(cfg);
        match client
            .delete_db_cluster()
            .db_cluster_identifier(&self.identifier)
            .skip_final_snapshot(true)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_db_cluster_not_found_fault())
                    .unwrap_or(false);
                if gone {
                    log::debug!("db cluster {} was already gone", self.identifier);
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

/// AWS Aurora instance resource.
///
/// Serverless v2 clusters still need at least one instance of class
/// `db.serverless` to do the actual work.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct DbInstance {
    pub identifier: String,
    pub cluster_identifier: Remote<String>,
    /// e.g. "db.serverless"
    pub instance_class: String,
    pub engine: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbInstanceOutput {
    pub arn: String,
}

impl Resource for DbInstance {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = DbInstanceOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<DbInstanceOutput> {
        let client = aws_sdk_rds::Client::new(cfg);
        let instance = client
            .create_db_instance()
            .db_instance_identifier(&self.identifier)
            .db_cluster_identifier(self.cluster_identifier.get()?)
            .db_instance_class(&self.instance_class)
            .engine(&self.engine)
            .send()
            .await?
            .db_instance
            .context("no db instance")?;
        log::info!("...created db instance {}", self.identifier);
        Ok(DbInstanceOutput {
            arn: instance.db_instance_arn.context("missing instance arn")?,
        })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &DbInstanceOutput,
    ) -> anyhow::Result<DbInstanceOutput> {
        anyhow::ensure!(
            self.identifier == previous_local.identifier && self.engine == previous_local.engine,
            "db instance '{}' requires destroying and recreating",
            previous_local.identifier
        );
        if self.instance_class != previous_local.instance_class {
            let client = aws_sdk_rds::Client::new(cfg);
            client
                .modify_db_instance()
                .db_instance_identifier(&self.identifier)
                .db_instance_class(&self.instance_class)
                .apply_immediately(true)
                .send()
                .await?;
        }
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        cfg: &SdkConfig,
        _previous_remote: &DbInstanceOutput,
    ) -> anyhow::Result<()> {
        let client = aws_sdk_rds::Client::new(cfg);
        match client
            .delete_db_instance()
            .db_instance_identifier(&self.identifier)
            .skip_final_snapshot(true)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_db_instance_not_found_fault())
                    .unwrap_or(false);
                if gone {
                    log::debug!("db instance {} was already gone", self.identifier);
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}
