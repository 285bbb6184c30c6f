use std::io;

/// Fatal startup failures. Per-packet problems are logged and resolved with
/// a verdict instead of being surfaced here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open netfilter queue {queue}: {source}")]
    OpenQueue {
        queue: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to initialize resolver: {0}")]
    Resolver(#[from] hickory_resolver::error::ResolveError),
}
