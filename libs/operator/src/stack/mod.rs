pub mod controller;
pub mod reconcile;
