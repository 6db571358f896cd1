pub mod cancel;
pub mod client;
pub mod outcome;
pub mod wire;

// Re-export commonly used types
pub use cancel::{CallContext, CancelHandle, CancelSignal};
pub use client::{HttpRecognitionClient, RecognitionClient};
pub use outcome::{
    Confidence, Distance, ErrorKind, ImagePayload, OracleFailure, RecognitionOutcome,
    RecognitionRequest, RequestMode, ResidentId,
};
