// Admin surface called by the external control plane.

pub mod admin;

pub use admin::router;
