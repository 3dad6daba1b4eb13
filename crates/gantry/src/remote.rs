//! Values resolved from the control plane.
//!
//! A [`Remote`] is a value that only becomes known after the provider has
//! created or read the resource it belongs to, such as an ARN or an
//! endpoint address.

use std::{
    any::Any,
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Mutex},
};

use snafu::OptionExt;

use crate::HasDependencies;

use super::{Action, Declared, Dependencies, DowncastSnafu, Error, RemoteUnresolvedSnafu, Resource};

type MapFn<X> = Arc<dyn Fn(&Arc<dyn Any>) -> Result<X, Error>>;

#[derive(Clone)]
enum RemoteInner<X> {
    Init {
        depends_on: String,
        last_known_value: Option<X>,
    },
    Cell {
        depends_on: String,
        map: MapFn<X>,
        // OutputCell<T::Output>
        cell: Arc<dyn Any>,
    },
}

impl<X: std::fmt::Debug> std::fmt::Debug for RemoteInner<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init {
                depends_on,
                last_known_value,
            } => f
                .debug_struct("Init")
                .field("depends_on", depends_on)
                .field("last_known_value", last_known_value)
                .finish(),
            Self::Cell {
                depends_on,
                map: _,
                cell,
            } => f
                .debug_struct("Cell")
                .field("depends_on", depends_on)
                .field("cell", cell)
                .finish(),
        }
    }
}

/// A value owned by a resource's remote output.
///
/// Obtained through [`Declared::remote`](crate::Declared::remote), or
/// through [`Remote::literal`] for fixed values that need to sit in a
/// `Remote`-typed field.
#[derive(Clone)]
pub struct Remote<X> {
    inner: RemoteInner<X>,
}

impl<X: Clone + core::fmt::Debug + 'static> std::fmt::Debug for Remote<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let depends_on = match &self.inner {
            RemoteInner::Init { depends_on, .. } => depends_on,
            RemoteInner::Cell { depends_on, .. } => depends_on,
        };
        f.debug_struct("Remote")
            .field("depends_on", depends_on)
            .field("value", &self.get().ok())
            .finish()
    }
}

impl<X: Clone + core::fmt::Debug + PartialEq + 'static> PartialEq for Remote<X> {
    fn eq(&self, other: &Self) -> bool {
        if let Ok(here) = self.get() {
            if let Ok(there) = other.get() {
                here == there
            } else {
                false
            }
        } else {
            false
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RemoteProxy<T> {
    depends_on: String,
    last_known_value: Option<T>,
}

impl<X: serde::Serialize + Clone + core::fmt::Debug + 'static> serde::Serialize for Remote<X> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let proxy = RemoteProxy {
            last_known_value: self.get().ok(),
            depends_on: match &self.inner {
                RemoteInner::Init { depends_on, .. } => depends_on.clone(),
                RemoteInner::Cell { depends_on, .. } => depends_on.clone(),
            },
        };
        proxy.serialize(serializer)
    }
}

impl<'de, X: serde::Deserialize<'de>> serde::Deserialize<'de> for Remote<X> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let RemoteProxy {
            depends_on,
            last_known_value,
        } = RemoteProxy::<X>::deserialize(deserializer)?;

        Ok(Remote {
            inner: RemoteInner::Init {
                depends_on,
                last_known_value,
            },
        })
    }
}

impl<X: Clone + core::fmt::Debug + 'static> Remote<X> {
    pub(crate) fn new<T: Resource>(
        resource: &Declared<T, T::Output>,
        map: impl Fn(&T::Output) -> X + 'static,
    ) -> Self {
        log::trace!(
            "creating mapping of a remote resource '{}'",
            resource.cell.depends_on
        );
        let depends_on = resource.cell.depends_on.clone();
        Self {
            inner: RemoteInner::Cell {
                map: Arc::new({
                    let depends_on = depends_on.clone();
                    move |any: &Arc<dyn Any>| {
                        // UNWRAP: safe because this is an invariant
                        let cell = any.downcast_ref::<OutputCell<T::Output>>().unwrap();
                        let t_output = cell.get().context(RemoteUnresolvedSnafu {
                            ty: core::any::type_name::<X>(),
                            depends_on: depends_on.clone(),
                        })?;
                        Ok(map(&t_output))
                    }
                }),
                depends_on,
                cell: Arc::new(resource.cell.clone()),
            },
        }
    }

    /// A fixed value that does not depend on any resource output.
    ///
    /// Useful for fields such as service environment variables, where
    /// constants and resolved outputs sit side by side.
    pub fn literal(value: X) -> Self {
        Self {
            inner: RemoteInner::Init {
                depends_on: String::new(),
                last_known_value: Some(value),
            },
        }
    }

    pub fn get(&self) -> Result<X, Error> {
        match &self.inner {
            RemoteInner::Init {
                depends_on,
                last_known_value,
            } => {
                log::trace!("remote returning last known value: {last_known_value:?}");
                Ok(last_known_value.clone().context(RemoteUnresolvedSnafu {
                    ty: core::any::type_name::<X>(),
                    depends_on: depends_on.clone(),
                })?)
            }
            RemoteInner::Cell {
                map,
                cell,
                depends_on: _,
            } => map(cell),
        }
    }

    pub fn map<Y>(&self, f: impl Fn(X) -> Y + 'static) -> Remote<Y> {
        match &self.inner {
            RemoteInner::Init {
                depends_on,
                last_known_value,
            } => Remote {
                inner: RemoteInner::Init {
                    depends_on: depends_on.clone(),
                    last_known_value: last_known_value.clone().map(f),
                },
            },
            RemoteInner::Cell {
                depends_on,
                map,
                cell,
            } => Remote {
                inner: RemoteInner::Cell {
                    depends_on: depends_on.clone(),
                    cell: cell.clone(),
                    map: Arc::new({
                        let map = map.clone();
                        move |any: &Arc<dyn Any>| {
                            let x = map(any)?;
                            Ok(f(x))
                        }
                    }),
                },
            },
        }
    }
}

impl<X> HasDependencies for Remote<X> {
    fn dependencies(&self) -> Dependencies {
        let depends_on = match &self.inner {
            RemoteInner::Init { depends_on, .. } => depends_on,
            RemoteInner::Cell { depends_on, .. } => depends_on,
        };
        // Literals carry no dependency.
        if depends_on.is_empty() {
            Dependencies::default()
        } else {
            Dependencies::from_id(depends_on.clone())
        }
    }
}

/// Shared slot holding a resource's remote output once it is known.
#[derive(Debug)]
pub(crate) struct OutputCell<T> {
    pub(crate) depends_on: String,
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for OutputCell<T> {
    fn clone(&self) -> Self {
        Self {
            depends_on: self.depends_on.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> OutputCell<T> {
    pub fn get(&self) -> Option<T> {
        self.inner.lock().unwrap().clone()
    }

    pub fn set(&self, value: Option<T>) {
        *self.inner.lock().unwrap() = value;
    }
}

pub(crate) struct DeclaredOutput {
    pub(crate) ty: &'static str,
    pub(crate) action: Action,
    pub(crate) cell: Box<dyn core::any::Any>,
}

/// Registry of all resource outputs declared in the current run.
#[derive(Default)]
pub(crate) struct OutputRegistry {
    cells: HashMap<String, DeclaredOutput>,
}

impl core::fmt::Display for OutputRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, output) in self.cells.iter() {
            f.write_fmt(format_args!(
                "name:'{name}' action:{action} ty:{ty}\n",
                action = output.action,
                ty = output.ty,
            ))?;
        }
        Ok(())
    }
}

impl OutputRegistry {
    /// Returns the `OutputCell<T>` for `id`, creating one if necessary.
    ///
    /// ## Errors
    /// Errs if a cell by the given name exists but is of a different type
    /// than the type requested.
    pub fn declare<T: Any>(
        &mut self,
        id: &str,
        action: Action,
    ) -> Result<(OutputCell<T>, &'static str), Error> {
        log::trace!(
            "requested output cell '{id}' of type {}",
            core::any::type_name::<T>()
        );
        let output = self.cells.entry(id.to_owned()).or_insert_with(|| {
            log::trace!("   but one doesn't exist, so we're creating a new entry");
            DeclaredOutput {
                ty: std::any::type_name::<T>(),
                action,
                cell: Box::new(OutputCell::<T> {
                    depends_on: id.to_owned(),
                    inner: Default::default(),
                }),
            }
        });
        let cell: &OutputCell<T> = output.cell.downcast_ref().context(DowncastSnafu)?;
        Ok((cell.clone(), output.ty))
    }

    /// Returns the declared output with the given name.
    pub fn get(&self, id: &str) -> Option<&DeclaredOutput> {
        self.cells.get(id)
    }

    /// Returns the set of all declared resource IDs.
    pub fn declared_ids(&self) -> std::collections::HashSet<String> {
        self.cells.keys().cloned().collect()
    }

    /// Forget every declaration, e.g. to plan a full teardown.
    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum MigratedProxy<T> {
    Remote(RemoteProxy<T>),
    Local(T),
}

/// A value carried over from a resource that is being destroyed.
///
/// Replacing a [`Remote`] field with a `Migrated` field severs the
/// dependency while keeping the last known value, letting dependents
/// outlive the resource that produced it.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(try_from = "MigratedProxy<T>")]
pub struct Migrated<T>(pub(crate) T);

impl<T> Deref for Migrated<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> TryFrom<MigratedProxy<T>> for Migrated<T> {
    type Error = &'static str;

    fn try_from(value: MigratedProxy<T>) -> Result<Self, Self::Error> {
        log::trace!("read a migrated {}", std::any::type_name::<T>());
        match value {
            MigratedProxy::Remote(RemoteProxy {
                depends_on: _,
                last_known_value,
            }) => {
                log::trace!("  from a previous remote");
                if let Some(value) = last_known_value {
                    Ok(Migrated(value))
                } else {
                    Err("Missing last known value")
                }
            }
            MigratedProxy::Local(t) => Ok(Migrated(t)),
        }
    }
}

impl<T: serde::Serialize> serde::Serialize for Migrated<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrate_ser() {
        let migrated = Migrated("arn:aws:apprunner:us-east-1:000:service/site".to_string());
        let s = serde_json::to_string_pretty(&migrated).unwrap();
        assert_eq!("\"arn:aws:apprunner:us-east-1:000:service/site\"", &s);

        let proxy = MigratedProxy::Remote(RemoteProxy {
            depends_on: "db-cluster".into(),
            last_known_value: Some("bookcase.cluster-xyz.us-east-1.rds.amazonaws.com".to_string()),
        });
        let s = serde_json::to_string_pretty(&proxy).unwrap();
        println!("{s}");
    }

    #[test]
    fn migrate_de() {
        let s = serde_json::json!({
          "depends_on": "db-cluster",
          "last_known_value": "bookcase.cluster-xyz.us-east-1.rds.amazonaws.com"
        });
        let migrated: Migrated<String> = serde_json::from_value(s).unwrap();
        assert_eq!(
            "bookcase.cluster-xyz.us-east-1.rds.amazonaws.com",
            migrated.as_str()
        );
    }

    #[test]
    fn literal_roundtrip() {
        let lit = Remote::literal("3000".to_string());
        assert_eq!("3000", lit.get().unwrap());
        assert!(lit.dependencies().into_iter().next().is_none());

        let s = serde_json::to_string(&lit).unwrap();
        let back: Remote<String> = serde_json::from_str(&s).unwrap();
        assert_eq!("3000", back.get().unwrap());
    }
}
