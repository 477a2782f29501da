pub mod compositor;
pub mod session;

pub use compositor::{composite, normalize, BlendMode, BlendParams, Colormap};
pub use session::{FusedSlice, FusionMode, FusionSession};
