//! Waveform Similarity Overlap-Add (WSOLA) time stretching.
//!
//! The kernel is a pure function over non-interleaved channel buffers: it
//! never allocates global state, takes a cooperative cancellation token, and
//! is safe to run on any thread. Output length scales by `1/tempo` while the
//! frequency structure of the input is preserved.

pub mod cancel;
pub mod ncc;
pub mod stretch;
pub mod window;

pub use cancel::CancellationToken;
pub use ncc::{best_alignment, normalized_cross_correlation};
pub use stretch::{stretch, StretchOutcome, StretchParams, StretchedBlock};
pub use window::hann_window;
