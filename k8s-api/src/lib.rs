#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gateway;
pub mod labels;

pub use self::labels::Selector;
pub use k8s_openapi::api::{
    self,
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{Namespace, Pod, PodSpec, PodStatus, Service, ServiceSpec},
};
pub use kube::api::{ObjectMeta, ResourceExt};
