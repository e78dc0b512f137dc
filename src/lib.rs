pub mod affine;
pub mod alloc;
pub mod assign;
pub mod buckets;
pub mod common;
pub mod expr;
pub mod graph;
pub mod infer;
pub mod lower;
pub mod pipeline;
pub mod placement;
pub mod saturate;
pub mod search;
