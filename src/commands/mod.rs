mod repair;
mod show;

pub use repair::repair;
pub use show::{render_tree, show};
