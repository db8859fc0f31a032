pub mod db;
pub mod feature;
pub mod geometry;
pub mod models;
pub mod normalize;
pub mod reference;

pub use models::{BoundingBox, TractRecord, TractRow, normalize_geoid};
pub use normalize::normalize;
