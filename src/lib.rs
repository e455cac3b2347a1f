pub mod args;
pub mod binio;
pub mod bpe;
pub mod dictionary;
pub mod embedder;
pub mod error;
pub mod loss;
pub mod matrix;
pub mod meter;
pub mod model;
pub mod parser;
pub mod pq;
pub mod sent;
pub mod syntax;
pub mod vector;

#[allow(non_camel_case_types)]
pub type real = f32; // Precision of float numbers

pub use args::{Args, LossName, ModelName};
pub use dictionary::{Dictionary, EntryKind, KindSet};
pub use embedder::Embedder;
pub use error::{Error, Result};
