pub mod build;
pub mod exclude;
pub mod split;
pub mod unfork;

pub mod util;
