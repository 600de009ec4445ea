#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use deployment_scaler_core as core;
pub use deployment_scaler_http as http;
pub use deployment_scaler_k8s_api as k8s;
pub use deployment_scaler_k8s_index as index;
pub use deployment_scaler_k8s_scale as scale;

mod args;
mod deployments;

pub use self::{args::Args, deployments::Deployments};
