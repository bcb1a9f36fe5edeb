//! Model layer consumed by the likelihood engine.
//!
//! Parameterization and sampling of these models live outside the engine;
//! here they are plain values the delegates upload to the backend.

pub mod branch;
pub mod eigen;
pub mod site;
pub mod substitution;

pub use branch::{BranchMapping, BranchModel, EpochModel};
pub use eigen::EigenDecomposition;
pub use site::SiteRateModel;
pub use substitution::SubstitutionModel;
