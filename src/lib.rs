use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod accumulator;
pub mod datafile;
pub mod dataset;
pub mod plan;
pub mod row;
pub mod sweep;
