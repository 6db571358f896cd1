pub mod classifier;
pub mod config;
pub mod decision;
pub mod gate;
pub mod ledger;
pub mod residents;

// Re-export oracle types for convenience
pub use facegate_oracle::{
    CallContext, CancelHandle, CancelSignal, ErrorKind, ImagePayload, RecognitionClient,
    RecognitionOutcome, ResidentId,
};
pub use gate::{AccessGate, FaceResult, GateError};
