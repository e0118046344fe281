mod all_close;
mod conv3d;
mod fill_with_zeros;
mod to_device;

pub use conv3d::{conv3d_backward, conv3d_forward};
