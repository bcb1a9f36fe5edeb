//! Incremental phylogenetic likelihood engine.
//!
//! Computes the log-likelihood of aligned sequence data on a rooted binary
//! tree by Felsenstein pruning, recomputing only what a proposal changed:
//!
//! * [`buffer`] double-buffers every per-node quantity so a rejected
//!   proposal is undone by flipping offsets back.
//! * [`traversal`] turns dirty nodes into child-before-parent operations.
//! * [`process`] materializes transition matrices, convolving epoch
//!   branches through a bounded scratch pool.
//! * [`delegate`] runs one evaluation cycle, including the rescaling state
//!   machine in [`rescaling`], for one or many partitions.
//! * [`likelihood`] is the public entry point with the bounded retry loop.
//!
//! Numeric work goes through the [`backend::ComputeBackend`] trait;
//! [`backend::CpuBackend`] is the reference implementation.
//!
//! ```no_run
//! use phylo_engine::prelude::*;
//!
//! # fn main() -> phylo_engine::Result<()> {
//! let tree = Tree::from_newick("((A:0.1,B:0.1):0.1,C:0.2);")?;
//! let patterns = Patterns::from_nucleotides(&[("A", "ACGT"), ("B", "ACGA"), ("C", "ACTT")])?;
//! let config = LikelihoodConfig::from_env()?;
//! let delegate = DataLikelihoodDelegate::new(
//!     &tree,
//!     &patterns,
//!     BranchModel::homogeneous(SubstitutionModel::jukes_cantor(4)?),
//!     SiteRateModel::uniform(),
//!     CpuBackend::new(),
//!     &config,
//! )?;
//! let mut likelihood = TreeDataLikelihood::new(tree, delegate, &config)?;
//! let log_likelihood = likelihood.evaluate()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod delegate;
pub mod error;
pub mod likelihood;
pub mod model;
pub mod patterns;
pub mod process;
pub mod rescaling;
pub mod simulation;
pub mod traversal;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use error::{BackendError, Error, Result};

pub mod prelude {
    pub use crate::backend::{ComputeBackend, CpuBackend, OperationReport};
    pub use crate::config::{LikelihoodConfig, RescalingScheme};
    pub use crate::delegate::{
        DataLikelihoodDelegate, LikelihoodDelegate, MultiPartitionDelegate, PartitionSpec,
    };
    pub use crate::likelihood::{EvaluationStats, TreeDataLikelihood};
    pub use crate::model::{BranchModel, SiteRateModel, SubstitutionModel};
    pub use crate::patterns::Patterns;
    pub use crate::traversal::TraversalType;
    pub use crate::tree::Tree;
}
