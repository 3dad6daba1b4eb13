//! Example: an App Runner service with VPC access, managed with gantry.
//!
//! The stack is the classic shape: an Aurora Serverless v2 cluster living
//! in private subnets, an App Runner service that egresses into the VPC
//! through a connector to reach it, and an auto scaling configuration —
//! the piece App Runner has no declarative construct for — assembled from
//! its raw create/delete calls and referenced by ARN.
//!
//! Run with `RUST_LOG=info` to see what gantry does under the hood.
//!
//! ```sh
//! cargo run -p gantry-example -- plan
//! cargo run -p gantry-example -- apply
//! cargo run -p gantry-example -- destroy --force
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gantry::aws::{apprunner, ec2, iam, rds, SdkConfig};
use gantry::remote::Remote;
use gantry::{Declared, Store};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "infra", about = "Manage the bookcase service's infrastructure")]
struct Cli {
    /// Directory for gantry state files.
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// AWS region to provision into.
    #[arg(long, default_value = "us-east-1", env = "AWS_REGION")]
    region: String,

    /// Base name for every resource.
    #[arg(long, default_value = "bookcase")]
    name: String,

    /// Container image the service runs.
    #[arg(
        long,
        default_value = "public.ecr.aws/aws-containers/hello-app-runner:latest"
    )]
    image: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what would change without applying.
    Plan,
    /// Plan and apply infrastructure changes.
    Apply,
    /// Tear down all infrastructure.
    Destroy {
        #[clap(long, short, default_value = "false")]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Infrastructure declaration
// ---------------------------------------------------------------------------

fn declare_infra(
    store: &mut Store<SdkConfig>,
    cli: &Cli,
) -> Result<Declared<apprunner::Service, apprunner::ServiceOutput>, gantry::Error> {
    let name = &cli.name;

    let vpc = store.resource(
        "vpc",
        ec2::Vpc {
            name: format!("{name}-vpc"),
            cidr_block: "10.0.0.0/16".to_owned(),
        },
    )?;

    // Two private subnets: Aurora insists on spanning two availability
    // zones, and the VPC connector reuses them for service egress.
    let subnet_a = store.resource(
        "subnet-a",
        ec2::Subnet {
            name: format!("{name}-private-a"),
            vpc_id: vpc.remote(|v| v.vpc_id.clone()),
            cidr_block: "10.0.0.0/24".to_owned(),
            availability_zone: format!("{}a", cli.region),
        },
    )?;
    let subnet_b = store.resource(
        "subnet-b",
        ec2::Subnet {
            name: format!("{name}-private-b"),
            vpc_id: vpc.remote(|v| v.vpc_id.clone()),
            cidr_block: "10.0.1.0/24".to_owned(),
            availability_zone: format!("{}b", cli.region),
        },
    )?;

    let service_sg = store.resource(
        "service-sg",
        ec2::SecurityGroup {
            name: format!("{name}-service"),
            description: "App Runner VPC connector egress".to_owned(),
            vpc_id: vpc.remote(|v| v.vpc_id.clone()),
            ingress: vec![],
        },
    )?;

    // The database only answers to traffic coming from the service.
    let database_sg = store.resource(
        "database-sg",
        ec2::SecurityGroup {
            name: format!("{name}-database"),
            description: "Aurora access from the App Runner service".to_owned(),
            vpc_id: vpc.remote(|v| v.vpc_id.clone()),
            ingress: vec![ec2::IngressRule {
                protocol: "tcp".to_owned(),
                from_port: 3306,
                to_port: 3306,
                source_security_group: Some(service_sg.remote(|g| g.group_id.clone())),
                cidr: None,
            }],
        },
    )?;

    let db_subnets = store.resource(
        "db-subnet-group",
        rds::DbSubnetGroup {
            name: format!("{name}-db-subnets"),
            description: "Private subnets for the bookcase cluster".to_owned(),
            subnet_ids: vec![
                subnet_a.remote(|s| s.subnet_id.clone()),
                subnet_b.remote(|s| s.subnet_id.clone()),
            ],
        },
    )?;

    let cluster = store.resource(
        "db-cluster",
        rds::DbCluster {
            identifier: format!("{name}-cluster"),
            engine: "aurora-mysql".to_owned(),
            database_name: "bookcase".to_owned(),
            master_username: "admin".to_owned(),
            db_subnet_group: db_subnets.remote(|g| g.name.clone()),
            security_group_ids: vec![database_sg.remote(|g| g.group_id.clone())],
            min_capacity: 0.5,
            max_capacity: 2.0,
        },
    )?;

    let _writer = store.resource(
        "db-writer",
        rds::DbInstance {
            identifier: format!("{name}-writer"),
            cluster_identifier: cluster.remote(|c| c.identifier.clone()),
            instance_class: "db.serverless".to_owned(),
            engine: "aurora-mysql".to_owned(),
        },
    )?;

    // Role the running containers assume, so the app can fetch the managed
    // master password from Secrets Manager.
    let instance_role = store.resource(
        "instance-role",
        iam::Role {
            name: format!("{name}-instance"),
            assume_role_policy: serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": "tasks.apprunner.amazonaws.com" },
                    "Action": "sts:AssumeRole",
                }],
            }),
            managed_policy_arns: vec![
                "arn:aws:iam::aws:policy/SecretsManagerReadWrite".to_owned()
            ],
        },
    )?;

    let scaling = store.resource(
        "autoscaling",
        apprunner::AutoScalingConfig {
            name: format!("{name}-autoscaling"),
            min_size: 1,
            max_size: 3,
            max_concurrency: 100,
        },
    )?;

    let connector = store.resource(
        "vpc-connector",
        apprunner::VpcConnector {
            name: format!("{name}-connector"),
            subnets: vec![
                subnet_a.remote(|s| s.subnet_id.clone()),
                subnet_b.remote(|s| s.subnet_id.clone()),
            ],
            security_groups: vec![service_sg.remote(|g| g.group_id.clone())],
        },
    )?;

    let service = store.resource(
        "service",
        apprunner::Service {
            name: name.clone(),
            image_identifier: cli.image.clone(),
            repository_kind: apprunner::RepositoryKind::EcrPublic,
            port: "8000".to_owned(),
            cpu: "1024".to_owned(),
            memory: "2048".to_owned(),
            environment: vec![
                apprunner::EnvVar {
                    name: "DATABASE_HOST".to_owned(),
                    value: cluster.remote(|c| c.endpoint.clone()),
                },
                apprunner::EnvVar {
                    name: "DATABASE_NAME".to_owned(),
                    value: Remote::literal("bookcase".to_owned()),
                },
                apprunner::EnvVar {
                    name: "DATABASE_SECRET_ARN".to_owned(),
                    value: cluster
                        .remote(|c| c.master_user_secret_arn.clone().unwrap_or_default()),
                },
            ],
            auto_scaling_configuration: scaling.remote(|c| c.arn.clone()),
            access_role: None,
            instance_role: Some(instance_role.remote(|r| r.arn.clone())),
            vpc_connector: Some(connector.remote(|c| c.arn.clone())),
        },
    )?;

    Ok(service)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(cli.region.clone()))
        .load()
        .await;
    let mut store = Store::new(&cli.state_dir, cfg);

    match &cli.command {
        Command::Plan => {
            declare_infra(&mut store, &cli)?;
            let plan = store.plan()?;
            println!("Plan:\n{plan}");
        }
        Command::Apply => {
            let service = declare_infra(&mut store, &cli)?;
            let plan = store.plan()?;
            println!("Plan:\n{plan}");
            println!();
            println!("Applying...");
            store.apply(plan).await?;
            match service.remote(|s| s.url.clone()).get() {
                Ok(Some(url)) => println!("Done. The service answers at https://{url}"),
                _ => println!("Done."),
            }
        }
        Command::Destroy { force } => {
            // Declaring the stack registers every resource type; clearing
            // then turns the whole state directory into orphans, which
            // plan() schedules for deletion in reverse dependency order.
            declare_infra(&mut store, &cli)?;
            store.clear_resources();
            let plan = store.plan()?;
            println!("Plan:\n{plan}");
            if *force {
                println!();
                println!("Applying...");
                store.apply(plan).await?;
                println!("Done.");
            } else {
                println!();
                println!("Please call `destroy --force` to delete these resources.");
            }
        }
    }
    Ok(())
}
