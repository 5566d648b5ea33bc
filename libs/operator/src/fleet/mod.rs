pub mod client;
pub mod fake;
pub mod types;

pub use client::{ClusterInfo, FleetClient, KubeFleetClient};
pub use types::{
    Bundle, BundleDeployment, BundleSpec, BundleTarget, Cluster, HelmOptions, ObservabilityMarker,
    ScanMarker,
};
