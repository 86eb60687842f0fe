pub mod extractor;
pub mod pipeline;
