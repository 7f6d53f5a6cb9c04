//! Video delivery: fragment assembly, padded frame buffers and the
//! hand-off to the consumer's callback.
//!
//! | Module      | Purpose                                             |
//! |-------------|-----------------------------------------------------|
//! | `frame`     | `VideoFrame` padded buffer and the `FramePool`       |
//! | `assembler` | Current-frame-only fragment reassembly               |
//! | `pipeline`  | Receive task, loss accounting, delivery thread       |

pub mod assembler;
pub mod frame;
pub mod pipeline;

pub use assembler::{AssemblerStats, CompletedFrame, FrameAssembler, MAX_FRAME_SIZE};
pub use frame::{DEFAULT_POOL_SIZE, FramePool, VIDEO_BUFFER_PADDING_SIZE, VideoFrame};
pub use pipeline::{LossTracker, RECOMMENDED_CALLBACK_BUDGET, VideoCallback, VideoStats};
