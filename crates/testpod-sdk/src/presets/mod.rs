//! Ready-made option groups for common services.
//!
//! Each preset bundles the image, environment, port, readiness conditions,
//! DSN provider and startup gate its service needs. Gates and provisioning
//! coordinators are shared by every container of a family in the process.

pub mod mysql;
pub mod postgres;
