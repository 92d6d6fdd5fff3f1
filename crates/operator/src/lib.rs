pub mod config;
pub mod connection;
pub mod controller;
pub mod crd;
pub mod istio;
pub mod knative;
pub mod registry;
pub mod sync;

pub use crd::deployment::{
    ModelDeployment, ModelDeploymentSpec, ModelDeploymentState, ModelDeploymentStatus,
};
pub use crd::route::{
    ModelDeploymentTarget, ModelRoute, ModelRouteSpec, ModelRouteState, ModelRouteStatus,
};
