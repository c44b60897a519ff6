pub mod collaborators;
pub mod commands;
pub mod config;
pub mod kustomize;
pub mod patch;
pub mod split;
pub mod state;
pub mod telemetry;
pub mod unfork;
