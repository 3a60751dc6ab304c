//! Model implementations for OverFlow
//!
//! Architecture:
//! - AlignmentModel: neural HMM (prenet, LSTM memory, parameter network) with
//!   exact forward-algorithm likelihood and sequential sampling
//! - FlowDecoder: squeeze + [ActNorm, InvConvNear, coupling] blocks
//! - OverFlow: feature embedding, encoder, HMM and decoder combined

pub mod emission;
pub mod flow_decoder;
pub mod forward_algorithm;
pub mod hmm;
pub mod overflow;

pub use emission::{EmissionNetwork, EmissionStep};
pub use flow_decoder::{FlowDecoder, FlowOutput, ReverseOutput};
pub use forward_algorithm::ForwardTable;
pub use hmm::{AlignmentModel, LikelihoodOutcome, Likelihoods, SampleOutcome, SampleTrace};
pub use overflow::{InputSequence, OverFlow, Synthesis, TrainingLoss};
