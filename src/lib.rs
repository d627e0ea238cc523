use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod align;
pub mod beam;
pub mod data;
pub mod decode;
pub mod encoder;
pub mod engine;
pub mod labels;
pub mod model;
pub mod score;
pub mod sql;
pub mod train;
