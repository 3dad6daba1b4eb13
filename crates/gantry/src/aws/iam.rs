//! IAM infrastructure.
use anyhow::Context;
use aws_config::SdkConfig;

use crate::{self as gantry, HasDependencies, Resource};

/// AWS role resource.
///
/// Holds the trust policy plus the managed policies attached to the role.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Role {
    pub name: String,
    pub assume_role_policy: serde_json::Value,
    pub managed_policy_arns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoleOutput {
    pub arn: String,
}

impl Resource for Role {
    type Provider = SdkConfig;
    type Error = anyhow::Error;
    type Output = RoleOutput;

    async fn create(&self, cfg: &SdkConfig) -> anyhow::Result<RoleOutput> {
        let client = aws_sdk_iam::Client::new(cfg);
        let iam_role = client
            .create_role()
            .role_name(&self.name)
            .assume_role_policy_document(serde_json::to_string(&self.assume_role_policy)?)
            .send()
            .await?
            .role
            .context("no role")?;
        log::info!("...created role {}", self.name);

        for policy_arn in self.managed_policy_arns.iter() {
            attach_policy(cfg, &self.name, policy_arn).await?;
        }
        Ok(RoleOutput { arn: iam_role.arn })
    }

    async fn update(
        &self,
        cfg: &SdkConfig,
        previous_local: &Self,
        previous_remote: &RoleOutput,
    ) -> anyhow::Result<RoleOutput> {
        anyhow::ensure!(
            self.name == previous_local.name,
            "role name change requires destroying '{}' and recreating",
            previous_local.name
        );
        let client = aws_sdk_iam::Client::new(cfg);
        if self.assume_role_policy != previous_local.assume_role_policy {
            log::info!("updating trust policy of role {}", self.name);
            client
                .update_assume_role_policy()
                .role_name(&self.name)
                .policy_document(serde_json::to_string(&self.assume_role_policy)?)
                .send()
                .await?;
        }
        for prev_policy in previous_local.managed_policy_arns.iter() {
            if !self.managed_policy_arns.contains(prev_policy) {
                log::info!("detaching policy {prev_policy} from role {}", self.name);
                detach_policy(cfg, &self.name, prev_policy).await?;
            }
        }
        for new_policy in self.managed_policy_arns.iter() {
            if !previous_local.managed_policy_arns.contains(new_policy) {
                log::info!("attaching policy {new_policy} to role {}", self.name);
                attach_policy(cfg, &self.name, new_policy).await?;
            }
        }
        Ok(previous_remote.clone())
    }

    async fn delete(&self, cfg: &SdkConfig, _previous_remote: &RoleOutput) -> anyhow::Result<()> {
        let client = aws_sdk_iam::Client::new(cfg);
        for policy_arn in self.managed_policy_arns.iter() {
            if let Err(e) = client
                .detach_role_policy()
                .role_name(&self.name)
                .policy_arn(policy_arn)
                .send()
                .await
            {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_no_such_entity_exception())
                    .unwrap_or(false);
                if !gone {
                    return Err(e.into());
                }
            }
        }
        match client.delete_role().role_name(&self.name).send().await {
            Ok(_) => {}
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_no_such_entity_exception())
                    .unwrap_or(false);
                if gone {
                    log::debug!("role {} was already gone", self.name);
                } else {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

pub async fn attach_policy(
    cfg: &SdkConfig,
    role_name: &str,
    policy_arn: &str,
) -> anyhow::Result<()> {
    let client = aws_sdk_iam::Client::new(cfg);
    let _ = client
        .attach_role_policy()
        .role_name(role_name)
        .policy_arn(policy_arn)
        .send()
        .await?;
    log::info!("...attached policy {policy_arn} to role {role_name}");
    Ok(())
}

pub async fn detach_policy(
    cfg: &SdkConfig,
    role_name: &str,
    policy_arn: &str,
) -> anyhow::Result<()> {
    let client = aws_sdk_iam::Client::new(cfg);
    let _ = client
        .detach_role_policy()
        .role_name(role_name)
        .policy_arn(policy_arn)
        .send()
        .await?;
    Ok(())
}
