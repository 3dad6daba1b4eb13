//! Implementations of HasDependencies for primitives.

use crate::{self as gantry, HasDependencies};

macro_rules! go {
    ($type: ty) => {
        impl HasDependencies for $type {}
    };
}

go!(String);
go!(u8);
go!(i8);
go!(u16);
go!(i16);
go!(u32);
go!(i32);
go!(u64);
go!(i64);
go!(u128);
go!(i128);
go!(f32);
go!(f64);
go!(bool);
go!(serde_json::Value);
go!(std::path::PathBuf);

// Rust tuples only implement Default for up to 12 elements, as of now
gantry_derive::impl_has_dependencies_tuples!((A,));
gantry_derive::impl_has_dependencies_tuples!((A, B));
gantry_derive::impl_has_dependencies_tuples!((A, B, C));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G, H));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G, H, I));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G, H, I, J));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G, H, I, J, K));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G, H, I, J, K, L));
gantry_derive::impl_has_dependencies_tuples!((A, B, C, D, E, F, G, H, I, J, K, L, M));

impl<T: HasDependencies> HasDependencies for Vec<T> {
    fn dependencies(&self) -> gantry::Dependencies {
        self.iter()
            .fold(gantry::Dependencies::default(), |acc, item| {
                acc.merge(item.dependencies())
            })
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::HashMap<K, V> {
    fn dependencies(&self) -> gantry::Dependencies {
        self.values()
            .fold(gantry::Dependencies::default(), |acc, item| {
                acc.merge(item.dependencies())
            })
    }
}

impl<V: HasDependencies> HasDependencies for std::collections::HashSet<V> {
    fn dependencies(&self) -> gantry::Dependencies {
        self.iter()
            .fold(gantry::Dependencies::default(), |acc, item| {
                acc.merge(item.dependencies())
            })
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::BTreeMap<K, V> {
    fn dependencies(&self) -> gantry::Dependencies {
        self.values()
            .fold(gantry::Dependencies::default(), |acc, item| {
                acc.merge(item.dependencies())
            })
    }
}

impl<V: HasDependencies> HasDependencies for std::collections::BTreeSet<V> {
    fn dependencies(&self) -> gantry::Dependencies {
        self.iter()
            .fold(gantry::Dependencies::default(), |acc, item| {
                acc.merge(item.dependencies())
            })
    }
}

impl<V: HasDependencies> HasDependencies for Option<V> {
    fn dependencies(&self) -> gantry::Dependencies {
        self.iter()
            .fold(gantry::Dependencies::default(), |acc, item| {
                acc.merge(item.dependencies())
            })
    }
}
