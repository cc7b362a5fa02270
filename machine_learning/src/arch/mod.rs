mod classifier;
pub mod layers;
pub mod loss;
mod model;

pub use classifier::Classifier;
pub use model::Model;
