//! Manager/worker session pairs.

pub mod repository;

pub use repository::PairRepository;
