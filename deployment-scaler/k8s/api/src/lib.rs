#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod store;

pub use self::store::KubeStore;
pub use k8s_openapi::api::apps::v1::Deployment;
pub use kube::Client;
