pub mod annotate;
pub mod geometry;
pub mod index;
pub mod join;
pub mod nearest;
