//! Custom resource lifecycles.
//!
//! Some platform capabilities exist only as a pair of imperative calls —
//! create this, delete that — with no declarative resource in between.
//! [`CustomResource`] wraps such a pair into a single resource with a
//! stable identity: the handle returned by the create call. The App Runner
//! auto scaling configuration in
//! [`aws::apprunner`](crate::aws::apprunner) is built on it.

use std::future::Future;

use snafu::prelude::*;

use crate::UserError;

/// Outcome of a provider delete action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The provider removed the resource.
    Deleted,
    /// The provider had no record of the handle.
    ///
    /// Treated as success, so that a teardown interrupted halfway can be
    /// retried cleanly.
    NotFound,
}

/// A specification rejected before any control-plane call was made.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("invalid specification: {reason}"))]
#[snafu(visibility(pub))]
pub struct InvalidSpec {
    reason: String,
}

/// Errors raised by [`CustomResource`].
#[derive(Debug, Snafu)]
pub enum LifecycleError {
    /// The specification was rejected before any call was made.
    #[snafu(display("{source}"))]
    Validation { source: InvalidSpec },

    #[snafu(display(
        "resource already created as '{handle}'; construct a new wrapper to recreate"
    ))]
    AlreadyCreated { handle: String },

    #[snafu(display("no handle: the resource was never created"))]
    MissingHandle,

    #[snafu(display("creation response is missing the resource identifier"))]
    MissingIdentifier,

    #[snafu(display("create call failed: {error}"))]
    CreateCall { error: Box<dyn UserError> },

    #[snafu(display("delete call failed: {error}"))]
    DeleteCall { error: Box<dyn UserError> },
}

/// The pair of control-plane calls a [`CustomResource`] is assembled from.
///
/// Implementations own whatever client and credentials the calls need —
/// nothing is resolved ambiently, which keeps the wrapper testable with a
/// substitute pair.
pub trait ActionPair {
    /// Parameters of the resource to be created. Immutable once submitted.
    type Spec;

    /// The structured response of the create call.
    type Response;

    /// Errors surfaced by the underlying calls.
    type Error: UserError;

    /// Reject malformed specifications before any call leaves the process.
    fn validate(_spec: &Self::Spec) -> Result<(), InvalidSpec> {
        Ok(())
    }

    /// Issue the creation call.
    fn create(
        &self,
        spec: &Self::Spec,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>>;

    /// Extract the resource identifier from the creation response.
    ///
    /// Returns `None` when the response is missing the expected field.
    fn identifier(response: &Self::Response) -> Option<String>;

    /// Issue the deletion call for `handle`.
    ///
    /// Implementations map the provider's "not found" to
    /// [`DeleteOutcome::NotFound`] instead of erroring.
    fn delete(&self, handle: &str)
        -> impl Future<Output = Result<DeleteOutcome, Self::Error>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum State {
    Uncreated,
    Created { handle: String },
    Deleted { handle: String },
}

/// A resource emulated on top of a create/delete call pair.
///
/// The wrapper moves through `Uncreated -> Created -> Deleted`, exactly
/// once each way. Recreating a deleted resource takes a new wrapper; the
/// old handle stays readable for bookkeeping.
pub struct CustomResource<A: ActionPair> {
    actions: A,
    state: State,
}

impl<A: ActionPair> CustomResource<A> {
    /// A wrapper for a resource that does not exist yet.
    pub fn new(actions: A) -> Self {
        Self {
            actions,
            state: State::Uncreated,
        }
    }

    /// Rebuild a wrapper for a resource created by an earlier run, from
    /// its persisted handle.
    ///
    /// ## Errors
    /// Errs if `handle` is empty — deletion must never be issued without a
    /// real identity.
    pub fn resume(actions: A, handle: impl Into<String>) -> Result<Self, LifecycleError> {
        let handle = handle.into();
        snafu::ensure!(!handle.is_empty(), MissingHandleSnafu);
        Ok(Self {
            actions,
            state: State::Created { handle },
        })
    }

    /// Issue the create call and record the returned identity.
    ///
    /// Fails without calling out if the spec is invalid or if this wrapper
    /// already created its resource. Failures are never retried here;
    /// whether to retry the whole provisioning run is the caller's call.
    pub async fn create(&mut self, spec: &A::Spec) -> Result<String, LifecycleError> {
        match &self.state {
            State::Created { handle } | State::Deleted { handle } => {
                return AlreadyCreatedSnafu {
                    handle: handle.clone(),
                }
                .fail();
            }
            State::Uncreated => {}
        }
        A::validate(spec).context(ValidationSnafu)?;
        let response = self
            .actions
            .create(spec)
            .await
            .map_err(|error| LifecycleError::CreateCall {
                error: Box::new(error),
            })?;
        let handle = A::identifier(&response)
            .filter(|handle| !handle.is_empty())
            .context(MissingIdentifierSnafu)?;
        log::info!("  created '{handle}'");
        self.state = State::Created {
            handle: handle.clone(),
        };
        Ok(handle)
    }

    /// Issue the delete call with the stored handle.
    ///
    /// Idempotent once created: the provider reporting "not found" counts
    /// as success. Any other failure is surfaced, since silently leaving
    /// an orphaned resource behind is worse than a loud teardown abort.
    pub async fn delete(&mut self) -> Result<(), LifecycleError> {
        let handle = match &self.state {
            State::Uncreated => return MissingHandleSnafu.fail(),
            State::Created { handle } | State::Deleted { handle } => handle.clone(),
        };
        match self.actions.delete(&handle).await {
            Ok(DeleteOutcome::Deleted) => log::info!("  deleted '{handle}'"),
            Ok(DeleteOutcome::NotFound) => {
                log::debug!("  '{handle}' was already gone, treating as deleted");
            }
            Err(error) => {
                return Err(LifecycleError::DeleteCall {
                    error: Box::new(error),
                });
            }
        }
        self.state = State::Deleted { handle };
        Ok(())
    }

    /// The underlying action pair.
    pub fn actions(&self) -> &A {
        &self.actions
    }

    /// The identity returned by the create call.
    pub fn handle(&self) -> Result<&str, LifecycleError> {
        match &self.state {
            State::Uncreated => MissingHandleSnafu.fail(),
            State::Created { handle } | State::Deleted { handle } => Ok(handle),
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct ScalingSpec {
        name: String,
        min_size: i32,
        max_size: i32,
    }

    struct FakeConfiguration {
        arn: Option<String>,
    }

    /// Mirrors the nesting of a real create response: the identifier sits
    /// one level down, and either level may be absent.
    struct FakeResponse {
        configuration: Option<FakeConfiguration>,
    }

    #[derive(Default)]
    struct FakePlane {
        create_calls: Cell<usize>,
        delete_calls: RefCell<Vec<String>>,
        live: Cell<bool>,
        omit_identifier: bool,
    }

    impl ActionPair for FakePlane {
        type Spec = ScalingSpec;
        type Response = FakeResponse;
        type Error = String;

        fn validate(spec: &ScalingSpec) -> Result<(), InvalidSpec> {
            snafu::ensure!(
                spec.max_size >= spec.min_size,
                InvalidSpecSnafu {
                    reason: format!(
                        "max size {} is below min size {}",
                        spec.max_size, spec.min_size
                    ),
                }
            );
            Ok(())
        }

        async fn create(&self, spec: &ScalingSpec) -> Result<FakeResponse, String> {
            self.create_calls.set(self.create_calls.get() + 1);
            self.live.set(true);
            Ok(FakeResponse {
                configuration: if self.omit_identifier {
                    None
                } else {
                    Some(FakeConfiguration {
                        arn: Some(format!("arn:fake:scaling/{}", spec.name)),
                    })
                },
            })
        }

        fn identifier(response: &FakeResponse) -> Option<String> {
            response.configuration.as_ref()?.arn.clone()
        }

        async fn delete(&self, handle: &str) -> Result<DeleteOutcome, String> {
            self.delete_calls.borrow_mut().push(handle.to_owned());
            if self.live.replace(false) {
                Ok(DeleteOutcome::Deleted)
            } else {
                Ok(DeleteOutcome::NotFound)
            }
        }
    }

    fn spec() -> ScalingSpec {
        ScalingSpec {
            name: "web".to_owned(),
            min_size: 1,
            max_size: 3,
        }
    }

    #[tokio::test]
    async fn create_then_handle() {
        let mut rez = CustomResource::new(FakePlane::default());
        let handle = rez.create(&spec()).await.unwrap();
        assert_eq!("arn:fake:scaling/web", handle);
        assert_eq!("arn:fake:scaling/web", rez.handle().unwrap());
    }

    #[tokio::test]
    async fn double_create_is_a_caller_error() {
        let mut rez = CustomResource::new(FakePlane::default());
        rez.create(&spec()).await.unwrap();
        let err = rez.create(&spec()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyCreated { .. }), "{err}");
        assert_eq!(1, rez.actions.create_calls.get());
    }

    #[tokio::test]
    async fn delete_without_create_fails() {
        let mut rez = CustomResource::new(FakePlane::default());
        let err = rez.delete().await.unwrap_err();
        assert!(matches!(err, LifecycleError::MissingHandle), "{err}");
        assert!(rez.actions.delete_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let mut rez = CustomResource::new(FakePlane::default());
        let handle = rez.create(&spec()).await.unwrap();
        rez.delete().await.unwrap();
        // The second delete observes "not found" on the provider side and
        // still succeeds.
        rez.delete().await.unwrap();
        assert_eq!(vec![handle.clone(), handle], rez.actions.delete_calls.into_inner());
    }

    #[tokio::test]
    async fn validation_happens_before_any_call() {
        let mut rez = CustomResource::new(FakePlane::default());
        let err = rez
            .create(&ScalingSpec {
                name: "web".to_owned(),
                min_size: 3,
                max_size: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation { .. }), "{err}");
        assert_eq!(0, rez.actions.create_calls.get());
        // A rejected spec leaves the wrapper usable.
        rez.create(&spec()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_identifier_in_response() {
        let mut rez = CustomResource::new(FakePlane {
            omit_identifier: true,
            ..Default::default()
        });
        let err = rez.create(&spec()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::MissingIdentifier), "{err}");
        // The create call did go out; the response just lacked the field.
        assert_eq!(1, rez.actions.create_calls.get());
    }

    #[tokio::test]
    async fn resume_requires_a_handle() {
        let err = CustomResource::resume(FakePlane::default(), "").unwrap_err();
        assert!(matches!(err, LifecycleError::MissingHandle), "{err}");
    }

    #[tokio::test]
    async fn resume_then_delete() {
        let plane = FakePlane::default();
        plane.live.set(true);
        let mut rez = CustomResource::resume(plane, "arn:fake:scaling/web").unwrap();
        rez.delete().await.unwrap();
        assert_eq!(
            vec!["arn:fake:scaling/web".to_owned()],
            rez.actions.delete_calls.into_inner()
        );
    }
}
