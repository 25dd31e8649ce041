pub mod admin;
pub mod core;
pub mod directory;
pub mod evaluations;
pub mod grades;
pub mod periods;
pub mod settings;
pub mod submissions;
