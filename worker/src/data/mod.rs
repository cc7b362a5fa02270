mod catalog;
mod loader;
mod pipeline;
mod prefetch;
mod shuffle;

pub use catalog::{Catalog, Entry};
pub use loader::{ExampleLoader, ImageLoader};
pub use pipeline::{Batch, TrainStream, ValidationStream};
pub use prefetch::Prefetcher;
pub use shuffle::ShuffleBuffer;
