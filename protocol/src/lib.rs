//! Ledger-anchored federated learning protocol
//!
//! Shared vocabulary of the three long-running processes: the round
//! coordinator, the verification bot and the participant agent. They share
//! no memory; everything they agree on lives in this crate or on the ledger.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐ submitUpdate(hash) ┌────────┐  contributions(r, p)  ┌───────────┐
//!  │Participant│───────────────────►│ Ledger │◄──────────────────────│    Bot    │
//!  └───────────┘                    └────────┘   validateAndPay(p)   └───────────┘
//!        │ POST /upload                 ▲                                  │
//!        ▼                              │ startNewRound()                  │
//!  ┌───────────┐                        │        POST /webhook/verify_...  │
//!  │Coordinator│────────────────────────┘◄─────────────────────────────────┘
//!  └───────────┘
//! ```
//!
//! ## Round flow
//! - The participant commits the SHA-256 of its artifact on the ledger, then
//!   uploads the artifact to the coordinator (unverified)
//! - The bot matches the local artifact digest against the commitment,
//!   pays the reward and calls the coordinator webhook
//! - Once enough contributions are verified the coordinator averages them,
//!   evaluates the global model and asks the ledger for the next round

pub mod aggregate;
pub mod artifact;
pub mod dataset;
pub mod eval;
pub mod ledger;
pub mod model;
pub mod types;

pub use aggregate::{fed_avg, AggregateError};
pub use artifact::ArtifactKey;
pub use dataset::Dataset;
pub use eval::{Evaluator, ReferenceEvaluator};
pub use ledger::{Commitment, LedgerConfig, LedgerError, LedgerOracle};
pub use model::ModelParams;
pub use types::*;
