//! # Gantry
//!
//! Gantry is a library for describing AWS App Runner infrastructure as
//! plain Rust code. It grew out of deploying container services that need
//! VPC connectivity: the service itself, the VPC plumbing it egresses
//! through, the database it talks to, and the auto scaling configuration
//! that App Runner's declarative surface has no native construct for.
//!
//! ## Key pieces
//!
//! - **Resources**: anything with a create/update/delete lifecycle on a
//!   platform implements [`Resource`]. The [`aws`] module ships
//!   implementations for the App Runner stack.
//! - **The store**: [`Store`] compares your in-code definitions against
//!   per-resource state files to decide what needs creating, updating, or
//!   loading, then applies those actions strictly one at a time.
//! - **Remote values**: outputs the platform assigns (ARNs, endpoints) flow
//!   into downstream definitions through [`Remote`](remote::Remote),
//!   which also records the dependency between the two resources.
//! - **Custom lifecycles**: when a platform offers only a raw create/delete
//!   call pair, [`lifecycle`] wraps the pair into a single resource with a
//!   stable identity.
//!
//! ## Concepts
//!
//! Gantry operates on local and remote states of resources:
//!
//! - **Local state**: the desired state of the resource as written in Rust
//!   code.
//! - **Remote state**: the state of the resource as it exists on the
//!   platform, captured in a state file after each apply.
//!
//! A [`Store`] uses the two to decide the necessary actions. Run order is
//! deliberately boring: forward actions run in declaration order, and
//! destroys run afterwards, each resource torn down before anything it
//! depends on. Every action is a blocking round trip to the control plane;
//! nothing runs concurrently.
//!
//! ## Error handling
//!
//! Fallible operations return a `Result` with the crate-wide [`Error`]
//! enum. Resource implementations surface their own error types, which the
//! store boxes into the matching [`Error`] variant along with the resource
//! name.

use std::{future::Future, ops::Deref, pin::Pin};

use snafu::prelude::*;
use tokio::io::AsyncWriteExt;

pub use gantry_derive::HasDependencies;

pub mod aws;
mod has_dependencies_impl;
pub mod lifecycle;
pub mod remote;
#[cfg(test)]
mod test;

use remote::{Migrated, OutputCell, OutputRegistry, Remote};

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + Send + Sync + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
pub enum Error {
    #[snafu(display("{source}:\n{}",
                source.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Other {
        // anyhow::Error is not a std Error, so it can't be a snafu source.
        #[snafu(source(false))]
        source: anyhow::Error,
    },

    #[snafu(display("Could not read state file '{path:?}': {source}"))]
    StateFileRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not delete state file '{path:?}': {source}"))]
    StateFileDelete {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize state of '{name}': {source}"))]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not deserialize state of '{name}': {source}"))]
    Deserialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not order destroys: {msg}"))]
    DestroyOrder { msg: String },

    #[snafu(display("Could not create file {path:?}: {source}"))]
    CreateFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write file {path:?}: {source}"))]
    WriteFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Remote value of {ty:?} is unresolved. Depends on {depends_on}"))]
    RemoteUnresolved {
        ty: &'static str,
        depends_on: String,
    },

    #[snafu(display("Could not find a resource by the name '{name}'"))]
    MissingResource { name: String },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' read and import: {error}"))]
    Import {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' update: {error}"))]
    Update {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Missing previous remote value '{name}'"))]
    Load { name: String },

    #[snafu(display(
        "Loading '{id}' would clobber an existing value in the state file, \
        and these values are not the same"
    ))]
    Clobber { id: String },

    #[snafu(display("Could not downcast"))]
    Downcast,

    #[snafu(display("Missing state file for '{id}'"))]
    MissingStateFile { id: String },

    #[snafu(display("Could not scan state directory '{path:?}': {source}"))]
    ScanStateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        Error::Other { source }
    }
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// IaC resources.
///
/// Represents a resource created on a platform (ie AWS, Digital Ocean, etc).
#[allow(unreachable_code)]
pub trait Resource:
    core::fmt::Debug
    + Clone
    + PartialEq
    + HasDependencies
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
    /// Type of the platform/resource provider.
    ///
    /// For example `aws_config::SdkConfig` in the case of amazon web services.
    type Provider;

    /// Errors that may occur interacting with the provider.
    type Error: UserError;

    /// The remote type of this resource, which we can use to fill in
    /// [`Remote`] values in other resources.
    type Output: core::fmt::Debug
        + Clone
        + PartialEq
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static;

    /// Creates a new resource on the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// It allows you to define only the methods you need. However, take care when
    /// using this in contexts like long-running daemons, as calling an unimplemented
    /// method will cause a panic.
    fn create(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::create is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Reads the current state of the resource from the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// It allows you to define only the methods you need. However, take care when
    /// using this in contexts like long-running daemons, as calling an unimplemented
    /// method will cause a panic.
    fn read(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::read is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Updates an existing resource on the platform.
    ///
    /// Takes the previous local and remote states of the resource and
    /// returns the updated remote state.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// It allows you to define only the methods you need. However, take care when
    /// using this in contexts like long-running daemons, as calling an unimplemented
    /// method will cause a panic.
    fn update(
        &self,
        _provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::update is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Deletes a resource from the platform.
    ///
    /// Takes the previous remote state of the resource. Implementations
    /// should treat the platform's "not found" as success so that a
    /// teardown interrupted halfway can be retried cleanly.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// It allows you to define only the methods you need. However, take care when
    /// using this in contexts like long-running daemons, as calling an unimplemented
    /// method will cause a panic.
    fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        unimplemented!(
            "Resource::delete is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }
}

#[derive(Clone, Default, Debug)]
pub struct Dependencies {
    /// Specifies a dependency on a `Resource`.
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.join(", "))
    }
}

impl Dependencies {
    /// A dependency on the resource declared with `id`.
    pub fn from_id(id: String) -> Self {
        Dependencies { inner: vec![id] }
    }

    pub fn merge(self, other: Self) -> Self {
        Dependencies {
            inner: [self.inner, other.inner].concat(),
        }
    }
}

/// Tracks dependencies between resources.
///
/// This trait can be derived, and has a default implementation that
/// reports zero dependencies.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

/// `Create`, `Load` and `Update` result in a resource being kept in the
/// state directory.
///
/// `Destroy` removes the resource and its state file.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    Load,
    Create,
    Read,
    Update,
    Destroy,
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Load => "load",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Destroy => "destroy",
        })
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct StateFileRecord {
    name: String,
    local: serde_json::Value,
    remote: serde_json::Value,
    /// The Rust type name of the resource (via `std::any::type_name::<T>()`).
    /// Used for orphan detection and auto-deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_name: Option<String>,
    /// The resource IDs this resource depends on.
    /// Used for ordering destroys correctly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependencies: Option<Vec<String>>,
}

impl StateFileRecord {
    async fn save(
        &self,
        resource_id: &str,
        state_dir: impl AsRef<std::path::Path>,
    ) -> Result<(), Error> {
        let path = state_file_path(resource_id, &state_dir);
        log::info!("storing {resource_id} to {path:?}");

        let contents = serde_json::to_string_pretty(self).context(SerializeSnafu {
            name: format!("storing {}", resource_id),
        })?;

        // Ensure the parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(&parent)
                .await
                .context(CreateFileSnafu { path: parent })?;
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .context(CreateFileSnafu { path: path.clone() })?;
        file.write_all(contents.as_bytes())
            .await
            .context(WriteFileSnafu { path: path.clone() })?;
        Ok(())
    }
}

/// A resource declared in the current run.
///
/// Dereferences to the local definition. Use [`Declared::remote`] to map
/// the resource's output into downstream definitions.
#[derive(Clone, Debug)]
pub struct Declared<L, R> {
    /// Name of the resource from the user's perspective
    name: String,
    /// Local definition in _code_
    local_definition: L,
    action: Action,
    pub(crate) cell: OutputCell<R>,
}

impl<L, R> Deref for Declared<L, R> {
    type Target = L;

    fn deref(&self) -> &Self::Target {
        &self.local_definition
    }
}

impl<L, R> AsRef<L> for Declared<L, R> {
    fn as_ref(&self) -> &L {
        &self.local_definition
    }
}

impl<T> Declared<T, T::Output>
where
    T: Resource,
    T::Output: Clone,
{
    /// Map a remote value to use in local definitions.
    pub fn remote<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: impl Fn(&T::Output) -> X + 'static,
    ) -> Remote<X> {
        Remote::new(self, f)
    }

    /// Return the action that will be applied to this resource.
    ///
    /// This is useful if you need to trigger invalidations or anything else
    /// based on whether a resource is created, updated, deleted, etc.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The ID this resource was declared with.
    pub fn id(&self) -> &str {
        &self.name
    }
}

/// The path to an individual resource state file.
fn state_file_path(name: &str, state_dir: impl AsRef<std::path::Path>) -> std::path::PathBuf {
    state_dir.as_ref().join(format!("{name}.json"))
}

/// Extract `depends_on` resource IDs from a serialized local definition.
///
/// Walks the JSON tree looking for `{"depends_on": "..."}` patterns,
/// which is how [`Remote`] serializes via its proxy.
fn extract_depends_on_from_json(value: &serde_json::Value) -> Vec<String> {
    let mut deps = Vec::new();
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(dep)) = map.get("depends_on") {
                // Literal remotes serialize with an empty depends_on.
                if !dep.is_empty() {
                    deps.push(dep.clone());
                }
            }
            for v in map.values() {
                deps.extend(extract_depends_on_from_json(v));
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr {
                deps.extend(extract_depends_on_from_json(v));
            }
        }
        _ => {}
    }
    deps
}

type RunFn<Provider> = Box<
    dyn FnOnce(
        // Resource platform provider
        &'_ Provider,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + '_>>,
>;

struct RunAction<'a, Provider, T: Resource<Provider = Provider>> {
    provider: &'a Provider,
    state_dir: std::path::PathBuf,
    /// Name of the resource being acted on.
    resource_id: String,
    action: Action,
    local_definition_code: T,
    local_definition_stored: Option<T>,
    cell: OutputCell<T::Output>,
}

impl<Provider, T: Resource<Provider = Provider>> RunAction<'_, Provider, T> {
    async fn run(self) -> Result<()> {
        let Self {
            provider,
            state_dir,
            resource_id,
            action,
            local_definition_code,
            local_definition_stored,
            cell,
        } = self;
        log::info!("{action} '{resource_id}':");

        async fn save<T: Resource>(
            resource_id: &str,
            local_definition_code: T,
            cell: &OutputCell<T::Output>,
            state_dir: impl AsRef<std::path::Path>,
        ) -> Result<(), Error> {
            let deps: Vec<String> = local_definition_code.dependencies().into_iter().collect();
            let record = StateFileRecord {
                name: resource_id.to_owned(),
                local: serde_json::to_value(&local_definition_code).context(SerializeSnafu {
                    name: format!("state {resource_id}"),
                })?,
                remote: serde_json::to_value(
                    cell.get().context(LoadSnafu { name: resource_id })?,
                )
                .context(SerializeSnafu {
                    name: format!("state {resource_id} remote"),
                })?,
                type_name: Some(std::any::type_name::<T>().to_owned()),
                dependencies: if deps.is_empty() { None } else { Some(deps) },
            };
            record.save(resource_id, state_dir).await?;
            Ok(())
        }

        match action {
            Action::Load => {
                save(&resource_id, local_definition_code, &cell, state_dir).await?;
            }
            Action::Create => {
                let value = local_definition_code
                    .create(provider)
                    .await
                    .map_err(|error| Error::Create {
                        name: resource_id.to_owned(),
                        error: Box::new(error),
                    })?;
                cell.set(Some(value));
                save(&resource_id, local_definition_code, &cell, state_dir).await?;
            }
            Action::Read => {
                let value = local_definition_code
                    .read(provider)
                    .await
                    .map_err(|error| Error::Import {
                        name: resource_id.to_owned(),
                        error: Box::new(error),
                    })?;
                cell.set(Some(value));
                save(&resource_id, local_definition_code, &cell, state_dir).await?;
            }
            Action::Update => {
                let previous_local = local_definition_stored.ok_or_else(|| Error::Load {
                    name: resource_id.clone(),
                })?;
                let previous_remote = cell.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                if previous_local == local_definition_code {
                    log::warn!(
                        "Skipping '{resource_id}' update as the local value has not changed.\n\
                        If you require an update, consider adding a sentinel value."
                    );
                } else {
                    let cmp =
                        pretty_assertions::Comparison::new(&previous_local, &local_definition_code);
                    let change_string = format!("{cmp}")
                        .lines()
                        .map(|line| format!("  {line}"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    log::info!("updating '{resource_id}':\n{change_string}");
                    let output = local_definition_code
                        .update(provider, &previous_local, &previous_remote)
                        .await
                        .map_err(|error| Error::Update {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    cell.set(Some(output));
                    save(&resource_id, local_definition_code, &cell, state_dir).await?;
                }
            }
            Action::Destroy => {
                log::debug!("running destroy action on {resource_id}");
                let previous_remote = cell.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                local_definition_code
                    .delete(provider, &previous_remote)
                    .await
                    .map_err(|error| Error::Destroy {
                        name: resource_id.to_owned(),
                        error: Box::new(error),
                    })?;

                log::info!("  {resource_id} is destroyed");
                let path = state_file_path(&resource_id, &state_dir);
                log::info!("  removing {resource_id} state file {path:?}");
                tokio::fs::remove_file(&path)
                    .await
                    .context(StateFileDeleteSnafu { path })?;
                cell.set(None);
            }
        }

        log::info!("  success!");
        Ok(())
    }
}

/// A resource scheduled for destruction.
///
/// Dereferences to the last stored local definition.
pub struct Retired<T: Resource> {
    local: T,
    remote: T::Output,
}

impl<T: Resource> Deref for Retired<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.local
    }
}

impl<T: Resource> Retired<T> {
    /// Map a remote value of a resource scheduled to be destroyed into a
    /// permanent field of another resource.
    pub fn migrate<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: fn(&T::Output) -> X,
    ) -> Migrated<X> {
        Migrated(f(&self.remote))
    }
}

/// One scheduled unit of work in a plan.
struct Step<Provider> {
    id: String,
    action: Action,
    type_name: Option<String>,
    is_orphan: bool,
    /// IDs this resource depends on; used to order destroys.
    dependencies: Vec<String>,
    run: RunFn<Provider>,
}

/// A type-erased delete function for a specific resource type.
///
/// Constructed automatically when a resource type is first used (via
/// [`Store::resource`], [`Store::import`], [`Store::load`], or
/// [`Store::destroy`]), or manually via [`Store::register`]. Produces a
/// [`RunFn`] that reads the state file, deserializes it into the concrete
/// type, calls `T::delete()`, and removes the file.
struct ResourceDeleter<Provider> {
    make_run_fn: Box<
        dyn Fn(
            std::path::PathBuf, // state_dir
            String,             // resource_id
        ) -> RunFn<Provider>,
    >,
}

/// A single planned action for a resource.
#[derive(Clone, Debug)]
pub struct PlannedAction {
    /// The resource ID.
    pub id: String,
    /// The action to be taken.
    pub action: Action,
    /// The Rust type name, if known.
    pub type_name: Option<String>,
    /// Whether this is an auto-detected orphan.
    pub is_orphan: bool,
}

/// A plan of actions produced by [`Store::plan`].
///
/// Inspect the plan before passing it to [`Store::apply`] to execute.
/// Actions are listed in execution order.
pub struct Plan<Provider> {
    /// The planned actions, in execution order.
    pub actions: Vec<PlannedAction>,
    /// Resources that appear orphaned but could not be auto-deleted
    /// (unregistered type or missing `type_name` in the state file).
    pub warnings: Vec<String>,
    /// Internal: the scheduled steps, in execution order.
    steps: Vec<RunFn<Provider>>,
}

impl<Provider> core::fmt::Display for Plan<Provider> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            f.write_str("No changes.\n")?;
            return Ok(());
        }
        for (i, action) in self.actions.iter().enumerate() {
            let orphan_marker = if action.is_orphan { " (orphan)" } else { "" };
            let ty = action.type_name.as_deref().unwrap_or("unknown");
            writeln!(
                f,
                "  {}. {} '{}' [{}]{}",
                i + 1,
                action.action,
                action.id,
                ty,
                orphan_marker
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "  WARNING: {warning}")?;
        }
        Ok(())
    }
}

/// Order destroys so every resource is destroyed before anything it
/// depends on.
fn order_destroys<Provider>(mut pending: Vec<Step<Provider>>) -> Result<Vec<Step<Provider>>> {
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        // A destroy may run once no other pending destroy depends on it.
        let pos = pending.iter().position(|candidate| {
            !pending
                .iter()
                .any(|other| other.id != candidate.id && other.dependencies.contains(&candidate.id))
        });
        match pos {
            Some(pos) => ordered.push(pending.remove(pos)),
            None => {
                let ids = pending
                    .iter()
                    .map(|step| step.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return DestroyOrderSnafu {
                    msg: format!("dependency cycle among: {ids}"),
                }
                .fail();
            }
        }
    }
    Ok(ordered)
}

struct PreviouslyStored<T: Resource> {
    action: Action,
    resource: Option<(T, T::Output)>,
}

pub struct Store<T> {
    state_dir: std::path::PathBuf,
    provider: T,
    outputs: OutputRegistry,
    forward: Vec<Step<T>>,
    destroys: Vec<Step<T>>,
    deleters: std::collections::HashMap<String, ResourceDeleter<T>>,
}

impl<P: 'static> Store<P> {
    fn read_from_state<T: Resource<Provider = P>>(
        state_dir: impl AsRef<std::path::Path>,
        id: &str,
    ) -> Result<(T, T::Output)> {
        let path = state_file_path(id, state_dir.as_ref());
        snafu::ensure!(path.exists(), MissingStateFileSnafu { id: id.to_owned() });

        log::debug!("{path:?} exists, reading '{id}' from it");
        let contents = std::fs::read_to_string(&path).context(StateFileReadSnafu {
            path: path.to_path_buf(),
        })?;
        let record: StateFileRecord = serde_json::from_str(&contents).context(DeserializeSnafu {
            name: id.to_owned(),
        })?;
        log::trace!("read state file record as {}", std::any::type_name::<T>());
        let stored_definition: T =
            serde_json::from_value(record.local).context(DeserializeSnafu {
                name: id.to_owned(),
            })?;

        let remote_value: T::Output =
            serde_json::from_value(record.remote).context(DeserializeSnafu {
                name: format!("remote {id}"),
            })?;
        Ok((stored_definition, remote_value))
    }

    pub fn new(state_dir: impl AsRef<std::path::Path>, provider: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            provider,
            outputs: Default::default(),
            forward: vec![],
            destroys: vec![],
            deleters: Default::default(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Ensure a resource type is registered for orphan auto-deletion.
    fn ensure_registered<T>(&mut self)
    where
        T: Resource<Provider = P>,
    {
        let type_name = std::any::type_name::<T>();
        if self.deleters.contains_key(type_name) {
            return;
        }
        self.deleters.insert(
            type_name.to_owned(),
            ResourceDeleter {
                make_run_fn: Box::new(|state_dir, resource_id| {
                    Box::new(move |provider: &P| {
                        Box::pin(async move {
                            let (local, remote): (T, T::Output) =
                                Self::read_from_state(&state_dir, &resource_id)?;
                            log::info!("destroy '{resource_id}' (orphan auto-delete):");
                            local.delete(provider, &remote).await.map_err(|error| {
                                Error::Destroy {
                                    name: resource_id.clone(),
                                    error: Box::new(error),
                                }
                            })?;
                            let path = state_file_path(&resource_id, &state_dir);
                            log::info!("  removing {resource_id} state file {path:?}");
                            tokio::fs::remove_file(&path)
                                .await
                                .context(StateFileDeleteSnafu { path })?;
                            log::info!("  {resource_id} destroyed");
                            Ok(())
                        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                    })
                }),
            },
        );
    }

    /// Register a resource type for automatic orphan detection and deletion.
    ///
    /// ## Note
    ///
    /// Resource types are **automatically registered** whenever they are
    /// used via [`Store::resource`], [`Store::import`], [`Store::load`], or
    /// [`Store::destroy`]. You only need to call this method for resource
    /// types that are **not** declared in the current run but may still
    /// have orphaned state files from a previous apply.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: Resource<Provider = P>,
    {
        self.ensure_registered::<T>();
        self
    }

    fn read_file<T>(&self, id: &str) -> Result<(T, T::Output), Error>
    where
        T: Resource<Provider = P>,
    {
        Self::read_from_state(&self.state_dir, id)
    }

    fn define_resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        action: Action,
        stored_definition: Option<T>,
        output: Option<T::Output>,
    ) -> Result<Declared<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.ensure_registered::<T>();
        let id = id.as_ref();

        // Every dependency must have been declared first. This is what
        // guarantees an upstream handle is resolved before the dependent
        // definition is submitted.
        let dependencies: Vec<String> = local_definition.dependencies().into_iter().collect();
        for dep in dependencies.iter() {
            snafu::ensure!(
                self.outputs.get(dep).is_some(),
                MissingResourceSnafu { name: dep.clone() }
            );
        }

        let (cell, _ty) = self.outputs.declare::<T::Output>(id, action)?;
        cell.set(output);

        let run: RunFn<T::Provider> = Box::new({
            let resource_id = id.to_owned();
            let state_dir = self.state_dir.clone();
            let cell = cell.clone();
            let local_definition_code = local_definition.clone();
            let local_definition_stored = stored_definition.clone();
            move |provider: &T::Provider| {
                Box::pin(
                    RunAction {
                        provider,
                        state_dir,
                        resource_id,
                        action,
                        local_definition_code,
                        local_definition_stored,
                        cell,
                    }
                    .run(),
                )
            }
        });

        log::debug!("scheduling {action} {id}");
        self.forward.push(Step {
            id: id.to_owned(),
            action,
            type_name: Some(std::any::type_name::<T>().to_owned()),
            is_orphan: false,
            dependencies,
            run,
        });

        Ok(Declared {
            name: id.to_owned(),
            local_definition,
            action,
            cell,
        })
    }

    /// Read the stored previous definition and determine the action.
    fn determine_action_from_previously_stored<T>(
        &self,
        local_definition: &T,
        id: &str,
    ) -> Result<PreviouslyStored<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        match self.read_file(id) {
            Ok((stored_definition, output)) => {
                // This has already been created and stored, so this is
                // either a simple load, or an update.
                log::debug!("  {output:?}");
                let action = if *local_definition != stored_definition {
                    log::debug!("  local resource has changed, so this remote is now stale");
                    Action::Update
                } else {
                    // Check if any upstream dependencies are "stale"
                    // (updated or deleted), which would cause this resource
                    // to possibly require an update.
                    let mut may_need_update = false;
                    for dep in local_definition.dependencies() {
                        let output = self.outputs.get(&dep).context(LoadSnafu { name: dep })?;
                        if output.action != Action::Load {
                            may_need_update = true;
                            break;
                        }
                    }
                    if may_need_update {
                        Action::Update
                    } else {
                        Action::Load
                    }
                };

                Ok(PreviouslyStored {
                    action,
                    resource: Some((stored_definition, output)),
                })
            }
            Err(Error::MissingStateFile { id }) => {
                log::debug!("state file '{id}' does not exist, creating a new resource");
                Ok(PreviouslyStored {
                    action: Action::Create,
                    resource: None,
                })
            }
            Err(e) => {
                log::error!("could not define resource '{id}': {e}");
                Err(e)
            }
        }
    }

    /// Defines a resource.
    ///
    /// Depending on the result of comparing `local_definition` to the one
    /// on file (if it exists), the resource will either be created on the
    /// platform, updated on the platform, or loaded from its state file.
    ///
    /// To import an existing resource from a platform, use [`Store::import`].
    pub fn resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<Declared<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        let PreviouslyStored { action, resource } =
            self.determine_action_from_previously_stored(&local_definition, id)?;
        let (local, remote) = resource
            .map(|(local, remote)| (Some(local), Some(remote)))
            .unwrap_or_default();
        self.define_resource(id, local_definition, action, local, remote)
    }

    /// Defines a pre-existing resource, importing it from the platform.
    ///
    /// This only needs to be used once in your infrastructure command.
    /// After the resource is imported and stored to a file it is
    /// recommended you make a code change to use [`Store::resource`].
    pub fn import<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<Declared<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.define_resource(id, local_definition, Action::Read, None, None)
    }

    /// Defines a pre-existing resource, directly writing it to its state
    /// file, without querying the platform.
    ///
    /// ## Errors
    /// Errs if `force_overwrite` is `false` _and_ a stored resource already
    /// exists. This is done to prevent accidental clobbering.
    pub fn load<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        remote_definition: T::Output,
        force_overwrite: bool,
    ) -> Result<Declared<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        if let Ok((stored_definition, output)) = self.read_file(id) {
            if local_definition != stored_definition || remote_definition != output {
                if force_overwrite {
                    log::warn!(
                        "loading '{id}' is clobbering a different stored value, \
                        but `force_overwrite` is `true`"
                    );
                } else {
                    let err = ClobberSnafu { id: id.to_owned() }.build();
                    log::error!("{err}");
                    return Err(err);
                }
            }
        }
        self.define_resource(
            id,
            local_definition,
            Action::Load,
            None,
            Some(remote_definition),
        )
    }

    /// Destroys a resource.
    ///
    /// The resource's last stored definition and output are returned as a
    /// [`Retired`], whose [`Retired::migrate`] lets dependents keep values
    /// the destroyed resource produced.
    pub fn destroy<T>(&mut self, id: impl AsRef<str>) -> Result<Retired<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.ensure_registered::<T>();
        let id = id.as_ref();
        let (local, remote) = self.read_file::<T>(id)?;
        let (cell, _ty) = self.outputs.declare::<T::Output>(id, Action::Destroy)?;
        cell.set(Some(remote.clone()));

        let dependencies: Vec<String> = local.dependencies().into_iter().collect();
        let run: RunFn<P> = Box::new({
            let resource_id = id.to_owned();
            let state_dir = self.state_dir.clone();
            let local = local.clone();
            let cell = cell.clone();
            move |provider| {
                Box::pin(
                    RunAction {
                        provider,
                        state_dir,
                        resource_id,
                        action: Action::Destroy,
                        local_definition_code: local,
                        local_definition_stored: None,
                        cell,
                    }
                    .run(),
                )
            }
        });

        log::debug!("scheduling destroy {id}");
        self.destroys.push(Step {
            id: id.to_owned(),
            action: Action::Destroy,
            type_name: Some(std::any::type_name::<T>().to_owned()),
            is_orphan: false,
            dependencies,
            run,
        });

        Ok(Retired { local, remote })
    }

    /// Forget every declared resource, keeping the type registry.
    ///
    /// A following [`Store::plan`] will treat every state file as an
    /// orphan, scheduling a full teardown.
    pub fn clear_resources(&mut self) {
        self.outputs.clear();
        self.forward.clear();
        self.destroys.clear();
    }

    /// Scan the state directory and build an execution plan.
    ///
    /// Compares declared resources (from [`Store::resource`],
    /// [`Store::destroy`], etc.) against state files on disk. Resources
    /// found on disk but not declared are flagged as orphans.
    ///
    /// Orphans whose types are registered (automatically on first use, or
    /// via [`Store::register`]) are scheduled for deletion. Unregistered
    /// orphans produce warnings.
    ///
    /// Forward actions run in declaration order; destroys run afterwards,
    /// each resource destroyed before anything it depends on.
    pub fn plan(&mut self) -> Result<Plan<P>> {
        let mut warnings = Vec::new();

        // Collect declared resource IDs before scanning for orphans.
        let declared_ids = self.outputs.declared_ids();

        let mut destroys = std::mem::take(&mut self.destroys);

        // Scan the state directory for .json files to detect orphans
        let state_dir = self.state_dir.clone();
        if state_dir.exists() {
            let entries = std::fs::read_dir(&state_dir).context(ScanStateDirSnafu {
                path: state_dir.clone(),
            })?;

            for entry in entries {
                let entry = entry.context(ScanStateDirSnafu {
                    path: state_dir.clone(),
                })?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let file_stem = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(s) => s.to_owned(),
                    None => continue,
                };

                if declared_ids.contains(&file_stem) {
                    continue; // Not an orphan
                }

                // This is an orphan — read its metadata
                let contents =
                    std::fs::read_to_string(&path).context(StateFileReadSnafu { path: &path })?;
                let record: StateFileRecord =
                    serde_json::from_str(&contents).context(DeserializeSnafu {
                        name: file_stem.clone(),
                    })?;

                let type_name = record.type_name.clone();

                if let Some(ref tn) = type_name {
                    if let Some(deleter) = self.deleters.get(tn) {
                        log::info!(
                            "orphan detected: '{file_stem}' (type: {tn}), scheduling auto-delete"
                        );

                        // Register the orphan so a second state file
                        // naming it as a dependency orders correctly.
                        let (cell, _ty) = self
                            .outputs
                            .declare::<serde_json::Value>(&file_stem, Action::Destroy)?;
                        cell.set(Some(record.remote.clone()));

                        // Use the explicit dependencies field if available,
                        // otherwise fall back to parsing depends_on out of
                        // the stored local definition.
                        let dependencies = record
                            .dependencies
                            .clone()
                            .unwrap_or_else(|| extract_depends_on_from_json(&record.local));

                        let run = (deleter.make_run_fn)(self.state_dir.clone(), file_stem.clone());
                        destroys.push(Step {
                            id: file_stem,
                            action: Action::Destroy,
                            type_name: type_name.clone(),
                            is_orphan: true,
                            dependencies,
                            run,
                        });

                        continue;
                    }
                }

                // Can't auto-delete: the resource type wasn't used in this
                // run and wasn't manually registered, so we don't have a
                // deleter.
                let msg = match &type_name {
                    Some(tn) => format!(
                        "Orphaned resource '{file_stem}' (type: {tn}) found in the state \
                        directory but its type is not known to this run. Call \
                        `store.register::<{tn}>()` to enable automatic deletion, or use \
                        `store.destroy::<{tn}>(\"{file_stem}\")` to delete it explicitly."
                    ),
                    None => format!(
                        "Orphaned resource '{file_stem}' found in the state directory but \
                        its state file has no type_name. Use \
                        `store.destroy(\"{file_stem}\")` to delete it explicitly."
                    ),
                };
                log::warn!("{msg}");
                warnings.push(msg);
            }
        }

        // Forward actions keep declaration order; destroys are ordered so
        // dependents go first.
        let forward = std::mem::take(&mut self.forward);
        let destroys = order_destroys(destroys)?;

        let mut actions = Vec::with_capacity(forward.len() + destroys.len());
        let mut steps = Vec::with_capacity(forward.len() + destroys.len());
        for step in forward.into_iter().chain(destroys) {
            actions.push(PlannedAction {
                id: step.id,
                action: step.action,
                type_name: step.type_name,
                is_orphan: step.is_orphan,
            });
            steps.push(step.run);
        }

        Ok(Plan {
            actions,
            warnings,
            steps,
        })
    }

    /// Execute a plan previously built by [`Store::plan`].
    ///
    /// Steps run strictly one at a time, in plan order. The first failure
    /// aborts the run; state files for completed steps are already saved,
    /// so a follow-up plan picks up where this one stopped.
    pub async fn apply(&mut self, plan: Plan<P>) -> Result<()> {
        for (i, run) in plan.steps.into_iter().enumerate() {
            log::debug!("applying step {i}");
            run(&self.provider).await?;
        }
        Ok(())
    }
}
