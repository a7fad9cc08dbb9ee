//! Turning source files into chunk texts: cleaning, the processed copy and
//! chunking.

pub mod chunker;
pub mod preprocess;

pub use chunker::{CharChunker, Chunker};
pub use preprocess::{preprocess_file, processed_file_name, processed_path, ProcessedDocument, TextCleaner};
