//! Gantry for AWS.
//!
//! Every resource in this module uses [`SdkConfig`] as its provider, so a
//! whole stack hangs off one `Store<SdkConfig>`. Credentials and region are
//! loaded once by the caller and passed in; nothing here resolves them
//! ambiently.

pub use aws_config::SdkConfig;

pub mod apprunner;
pub mod ec2;
pub mod iam;
pub mod rds;
