//! Volumetric (3-D) convolution by unfold and grouped matrix multiply.
//!
//! Every image of a batch is unfolded into a patch matrix (`vol2row`), multiplied group by
//! group with the filter bank, and gradients fold the patch matrix back (`row2vol`).
//!
//! Design principles:
//! 1. Plans are pure functions of tensor extents and are fully checked before any buffer is
//!    touched.
//! 2. No multi thread support - one call runs sequentially on the calling thread.

pub mod backend;
pub mod context;
pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod dtype;
pub mod init;
pub mod ops;
mod pipeline;
pub mod plan;
pub mod tensor;

#[cfg(test)]
pub(crate) mod tests;

pub use context::{with_default_context, Context, ContextConfig};
pub use ops::{conv3d_backward, conv3d_forward};
pub use plan::Conv3dParams;
pub use tensor::{Device, Dtype, Error, Scalar, Stage, Tensor};
