pub mod config;
pub mod curve;
pub mod db;
pub mod keys;
pub mod matcher;
pub mod planner;
pub mod sections;
pub mod similarity;
pub mod transitions;

/// Dimension of the track "vibe" embeddings produced by the analysis pipeline
pub const EMBEDDING_DIM: usize = 512;

/// Application name for XDG paths
pub const APP_NAME: &str = "mixplan";
