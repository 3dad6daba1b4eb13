use crate::{self as gantry, *};

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Registry {
    name: String,
}

impl HasDependencies for Registry {}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct RegistryInfo {
    url: String,
}

impl Resource for Registry {
    type Provider = ();

    type Error = String;

    type Output = RegistryInfo;

    async fn create(&self, (): &Self::Provider) -> Result<Self::Output, Self::Error> {
        Ok(RegistryInfo {
            url: format!("reg://{}", self.name),
        })
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        self.create(provider).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        self.create(provider).await
    }

    async fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
struct App {
    image: Remote<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct AppInfo {
    service_id: String,
}

impl Resource for App {
    type Provider = ();
    type Error = Error;
    type Output = AppInfo;

    async fn create(&self, (): &Self::Provider) -> Result<Self::Output, Self::Error> {
        let image = self.image.get()?;
        Ok(AppInfo {
            service_id: format!("service-{image}"),
        })
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        self.create(provider).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        self.create(provider).await
    }

    async fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

async fn test_dir(name: &str) -> std::path::PathBuf {
    let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("test_output")
        .join(name);
    if path.exists() {
        tokio::fs::remove_dir_all(&path).await.unwrap();
    }
    tokio::fs::create_dir_all(&path).await.unwrap();
    path
}

fn ids<P>(plan: &Plan<P>) -> Vec<&str> {
    plan.actions.iter().map(|a| a.id.as_str()).collect()
}

#[tokio::test]
async fn sanity() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("sanity").await;

    fn run_infra(store: &mut Store<()>, registry_name: &str) -> Declared<App, AppInfo> {
        let registry = store
            .resource(
                "registry",
                Registry {
                    name: registry_name.to_owned(),
                },
            )
            .unwrap();
        let app_a = store
            .resource(
                "app-a",
                App {
                    image: registry.remote(|r| format!("{}/site:latest", r.url)),
                },
            )
            .unwrap();
        let _app_b = store
            .resource(
                "app-b",
                App {
                    image: registry.remote(|r| format!("{}/worker:latest", r.url)),
                },
            )
            .unwrap();
        app_a
    }

    let mut store = Store::new(&path, ());
    let app_a = run_infra(&mut store, "hub");
    assert_eq!(Action::Create, app_a.action());
    let plan = store.plan().unwrap();
    assert!(plan.warnings.is_empty());
    assert_eq!(
        vec!["registry", "app-a", "app-b"],
        ids(&plan),
        "forward actions run in declaration order"
    );
    store.apply(plan).await.unwrap();
    assert!(path.join("registry.json").exists());
    assert!(path.join("app-a.json").exists());
    assert!(path.join("app-b.json").exists());
    assert_eq!(
        "service-reg://hub/site:latest",
        app_a.remote(|a| a.service_id.clone()).get().unwrap()
    );

    // A second run with no changes loads everything from state files.
    let mut store = Store::new(&path, ());
    let app_a = run_infra(&mut store, "hub");
    assert_eq!(Action::Load, app_a.action());
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();

    // Renaming the registry updates it and marks dependents stale.
    let mut store = Store::new(&path, ());
    let app_a = run_infra(&mut store, "hub-renamed");
    assert_eq!(
        Action::Update,
        app_a.action(),
        "`app_a` should update in response to the registry updating"
    );
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();

    // The new registry url flowed through to the app's stored output.
    let (_, info): (App, AppInfo) = Store::<()>::read_from_state(&path, "app-a").unwrap();
    assert_eq!("service-reg://hub-renamed/site:latest", info.service_id);
}

#[tokio::test]
async fn empty_plan_has_no_changes() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("empty_plan").await;

    let mut store = Store::new(&path, ());
    let plan = store.plan().unwrap();
    assert!(plan.actions.is_empty());
    assert_eq!("No changes.\n", plan.to_string());
}

#[tokio::test]
async fn import_reads_from_the_platform() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("import").await;

    let mut store = Store::new(&path, ());
    let registry = store
        .import(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
        )
        .unwrap();
    assert_eq!(Action::Read, registry.action());
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();

    assert!(path.join("registry.json").exists());
    let (_, info): (Registry, RegistryInfo) =
        Store::<()>::read_from_state(&path, "registry").unwrap();
    assert_eq!("reg://hub", info.url);
}

#[tokio::test]
async fn load_writes_state_without_calling_out() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("load").await;

    let mut store = Store::new(&path, ());
    store
        .load(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
            RegistryInfo {
                url: "reg://elsewhere".to_owned(),
            },
            false,
        )
        .unwrap();
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();

    let (_, info): (Registry, RegistryInfo) =
        Store::<()>::read_from_state(&path, "registry").unwrap();
    assert_eq!("reg://elsewhere", info.url);

    // Loading the same values again is an idempotent no-op...
    let mut store = Store::new(&path, ());
    store
        .load(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
            RegistryInfo {
                url: "reg://elsewhere".to_owned(),
            },
            false,
        )
        .unwrap();

    // ...but loading a different value without `force_overwrite` would
    // clobber the stored one.
    let mut store = Store::new(&path, ());
    let err = store
        .load(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
            RegistryInfo {
                url: "reg://somewhere-else".to_owned(),
            },
            false,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Clobber { .. }), "{err}");
}

#[tokio::test]
async fn undeclared_dependency_is_an_error() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("undeclared_dep").await;

    let mut store = Store::new(&path, ());
    let registry = store
        .resource(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
        )
        .unwrap();
    let image = registry.remote(|r| r.url.clone());

    // A store that never declared the registry can't resolve the remote.
    let mut other = Store::new(&path, ());
    let err = other.resource("app", App { image }).unwrap_err();
    assert!(matches!(err, Error::MissingResource { .. }), "{err}");
}

#[tokio::test]
async fn destroys_run_dependents_first() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("destroy_order").await;

    let mut store = Store::new(&path, ());
    let registry = store
        .resource(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
        )
        .unwrap();
    let _app = store
        .resource(
            "app",
            App {
                image: registry.remote(|r| r.url.clone()),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();

    // Declare the destroys in the wrong order on purpose.
    let mut store = Store::new(&path, ());
    let _registry = store.destroy::<Registry>("registry").unwrap();
    let _app = store.destroy::<App>("app").unwrap();
    let plan = store.plan().unwrap();
    assert_eq!(
        vec!["app", "registry"],
        ids(&plan),
        "the app must be destroyed before the registry it depends on"
    );
    store.apply(plan).await.unwrap();
    assert!(!path.join("registry.json").exists());
    assert!(!path.join("app.json").exists());
}

// In order to delete the registry, which has a downstream dependent, we
// must remove the registry as a dependency of that dependent. We do this by
// migrating the app to a resource type whose image field is a pinned value
// that serializes the same way.
#[tokio::test]
async fn migrate_away_from_a_destroyed_resource() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("migrate").await;

    let mut store = Store::new(&path, ());
    let registry = store
        .resource(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
        )
        .unwrap();
    let _app = store
        .resource(
            "app",
            App {
                image: registry.remote(|r| r.url.clone()),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct PinnedApp {
        // Here we got rid of the `Remote`
        image: Migrated<String>,
    }

    impl HasDependencies for PinnedApp {}

    impl Resource for PinnedApp {
        type Provider = ();
        type Error = Error;
        type Output = AppInfo;

        async fn create(&self, (): &Self::Provider) -> Result<Self::Output, Self::Error> {
            Ok(AppInfo {
                service_id: format!("service-{}", *self.image),
            })
        }

        async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
            self.create(provider).await
        }

        async fn update(
            &self,
            provider: &Self::Provider,
            _previous_local: &Self,
            _previous_remote: &Self::Output,
        ) -> Result<Self::Output, Self::Error> {
            self.create(provider).await
        }

        async fn delete(
            &self,
            _provider: &Self::Provider,
            _previous_remote: &Self::Output,
        ) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    let mut store = Store::new(&path, ());
    let registry = store.destroy::<Registry>("registry").unwrap();
    let app = store
        .resource(
            "app",
            PinnedApp {
                image: registry.migrate(|r| r.url.clone()),
            },
        )
        .unwrap();
    // The pinned value deserializes equal to the stored one, so the app
    // reloads; re-saving its state file is what sheds the dependency.
    assert_eq!(Action::Load, app.action());
    let plan = store.plan().unwrap();
    assert_eq!(
        vec!["app", "registry"],
        ids(&plan),
        "the app re-saves before the registry is destroyed"
    );
    store.apply(plan).await.unwrap();
    assert!(!path.join("registry.json").exists());
    assert!(path.join("app.json").exists());
}

/// Verify that resource types are automatically registered for orphan
/// auto-deletion when used via [`Store::resource`], without any explicit
/// [`Store::register`] call.
#[tokio::test]
async fn auto_register_orphan_delete() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("auto_reg").await;

    // Step 1: Create two registries.
    let mut store = Store::new(&path, ());
    let _a = store
        .resource(
            "registry-a",
            Registry {
                name: "alpha".to_owned(),
            },
        )
        .unwrap();
    let _b = store
        .resource(
            "registry-b",
            Registry {
                name: "beta".to_owned(),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    assert!(plan.warnings.is_empty(), "no warnings on first apply");
    store.apply(plan).await.unwrap();

    // Both state files should exist.
    assert!(path.join("registry-a.json").exists());
    assert!(path.join("registry-b.json").exists());

    // Step 2: New store that only declares registry-a.
    // registry-b should be auto-detected as an orphan and scheduled for
    // deletion because Registry was auto-registered via the
    // `store.resource()` call for registry-a — no explicit `register()`.
    let mut store = Store::new(&path, ());
    let _a = store
        .resource(
            "registry-a",
            Registry {
                name: "alpha".to_owned(),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    assert!(
        plan.warnings.is_empty(),
        "no warnings expected: {:#?}",
        plan.warnings
    );
    let orphan = plan
        .actions
        .iter()
        .find(|a| a.id == "registry-b")
        .expect("registry-b should appear in the plan");
    assert_eq!(orphan.action, Action::Destroy);
    assert!(orphan.is_orphan);
    store.apply(plan).await.unwrap();

    // registry-b's state file should be gone.
    assert!(!path.join("registry-b.json").exists());
    // registry-a should still be there.
    assert!(path.join("registry-a.json").exists());
}

/// Verify that orphaned resources of an unknown type (not used in the
/// current run and not manually registered) produce a warning suggesting
/// `store.register()`.
#[tokio::test]
async fn unknown_orphan_warning() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("unknown_orphan").await;

    // Step 1: Create a registry so there's a state file on disk.
    let mut store = Store::new(&path, ());
    let _registry = store
        .resource(
            "my-registry",
            Registry {
                name: "lonely".to_owned(),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();
    assert!(path.join("my-registry.json").exists());

    // Step 2: New store that declares NO resources at all.
    // The registry's type was never used in this run, so there's no
    // deleter. plan() should produce a warning.
    let mut store = Store::new(&path, ());
    let plan = store.plan().unwrap();
    assert_eq!(plan.warnings.len(), 1, "expected exactly one warning");
    assert!(
        plan.warnings[0].contains("my-registry"),
        "warning should mention the orphan id"
    );
    assert!(
        plan.warnings[0].contains("register"),
        "warning should suggest register()"
    );

    // The state file should still exist (not auto-deleted).
    assert!(path.join("my-registry.json").exists());
}

/// Verify that [`Store::clear_resources`] forgets declared resources but
/// preserves the type registry, enabling a "destroy everything" workflow.
#[tokio::test]
async fn clear_and_destroy_all() {
    let _ = env_logger::builder().try_init();
    let path = test_dir("clear_destroy").await;

    // Step 1: Create a registry and an app.
    let mut store = Store::new(&path, ());
    let registry = store
        .resource(
            "registry",
            Registry {
                name: "hub".to_owned(),
            },
        )
        .unwrap();
    let _app = store
        .resource(
            "app",
            App {
                image: registry.remote(|r| r.url.clone()),
            },
        )
        .unwrap();
    let plan = store.plan().unwrap();
    store.apply(plan).await.unwrap();
    assert!(path.join("registry.json").exists());
    assert!(path.join("app.json").exists());

    // Step 2: Same store instance — clear resources then plan.
    // Types are still registered from the resource() calls above, so
    // plan() should schedule both as orphan destroys with no warnings,
    // dependents first.
    store.clear_resources();
    let plan = store.plan().unwrap();
    assert!(
        plan.warnings.is_empty(),
        "no warnings: {:#?}",
        plan.warnings
    );
    assert_eq!(
        vec!["app", "registry"],
        ids(&plan),
        "expected the app to be destroyed before the registry: {:#?}",
        plan.actions,
    );
    for action in &plan.actions {
        assert_eq!(action.action, Action::Destroy);
        assert!(action.is_orphan);
    }
    store.apply(plan).await.unwrap();

    // Both state files should be gone.
    assert!(!path.join("registry.json").exists());
    assert!(!path.join("app.json").exists());
}
