mod resolver;
mod transport;

pub use resolver::ManifestResolver;
pub use transport::{ByteStream, HttpSource, RemoteSource};
