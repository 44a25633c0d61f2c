//! Concrete `Provider` implementations.

pub mod cloud_openai;
pub mod local_http;

pub use cloud_openai::CloudOpenAiProvider;
pub use local_http::LocalHttpProvider;
