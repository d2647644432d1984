pub mod bayes;
pub mod matcher;
pub mod spatial;
pub mod temporal;
pub mod vector;

pub use matcher::{AvlMatcher, ShapeFilter};
pub use vector::SpatialVectorCollection;
