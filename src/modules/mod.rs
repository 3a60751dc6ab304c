//! Neural network building blocks for OverFlow
//!
//! - Log-domain tensor arithmetic and host-side matrix factorisation
//! - Seeded dropout, prenet and WaveNet stacks
//! - The three invertible layers of a flow block (ActNorm, InvConvNear, coupling)

pub mod actnorm;
pub mod conv;
pub mod coupling;
pub mod dropout;
pub mod invconv;
pub mod linalg;
pub mod logmath;
pub mod prenet;
pub mod wavenet;

pub use actnorm::ActNorm;
pub use conv::Conv1d;
pub use coupling::{CouplingBlock, CouplingConfig};
pub use dropout::Dropout;
pub use invconv::InvConvNear;
pub use linalg::HostMatrix;
pub use prenet::Prenet;
pub use wavenet::WaveNet;
