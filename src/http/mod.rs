//! HTTP transport and a cached client built on it.

mod cached_client;
mod client;
mod resource;

pub use cached_client::CachedHttpClient;
pub use client::HttpClient;
pub use resource::UrlResource;
