pub mod anchor;
pub mod audio;
pub mod config;
pub mod manifest;
pub mod render;
pub mod sampling;
pub mod selection;
pub mod stats;
pub mod table;

/// Method name of ground-truth rows
pub const REFERENCE_METHOD: &str = "Ref";

/// Application name for XDG paths
pub const APP_NAME: &str = "stimset";
