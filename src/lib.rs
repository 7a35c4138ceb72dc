//! Android DEX bytecode post-processor building blocks: the keep-rule
//! configuration front end, the basic-block instrumentation engine, and the
//! inter-dex packing engine, over a lean interned IR.

pub mod cfg;
pub mod instrument;
pub mod interdex;
pub mod ir;
pub mod rules;
