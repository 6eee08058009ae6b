pub mod ast;
pub mod compiler;
pub mod filter;

pub use ast::{AccessField, BoolQuery, Field, Query, Scalar};
pub use compiler::{compile, compile_access, compile_ids, compile_sort};
pub use filter::*;
