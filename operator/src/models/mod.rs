//! Stored record types: the two preview records plus the workload kinds the
//! orchestrators materialise.

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::models::Resource for $ty {
            const KIND: $crate::models::Kind = $kind;

            fn meta(&self) -> &$crate::models::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::models::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;

pub mod environment;
pub mod instance;
pub mod meta;
pub mod workload;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use environment::Environment;
pub use instance::{Instance, Phase};
pub use meta::{Labels, ObjectMeta};

/// Record kinds known to the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Environment,
    Instance,
    Deployment,
    Service,
    Ingress,
    Job,
    Pod,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Environment => "Environment",
            Kind::Instance => "Instance",
            Kind::Deployment => "Deployment",
            Kind::Service => "Service",
            Kind::Ingress => "Ingress",
            Kind::Job => "Job",
            Kind::Pod => "Pod",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed record with `metadata` plus a kind-specific body.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }
}
