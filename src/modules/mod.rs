// src/modules/mod.rs
//! Vendor automation module resolution
//!
//! Chooses a version-consistent set of vendor modules from a possibly
//! conflicting local install and renders the scripts that load them.

pub mod resolver;
pub mod version;

pub use resolver::{
    InstalledModule, ModuleDescriptor, ModuleLoadPlan, ModuleResolver, SkippedModule,
};
pub use version::ModuleVersion;
