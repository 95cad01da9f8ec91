mod health;
mod render;
mod sweep;

pub use health::run_health;
pub use render::{run_render, RenderArgs};
pub use sweep::run_sweep;
