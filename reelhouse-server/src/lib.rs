//! # Reelhouse Server
//!
//! HTTP control surface for artifact generation. Clients submit jobs
//! (thumbnails, probed metadata, hover previews, subtitles, face data) for
//! one or more media files, poll their progress, and cancel them. A
//! background idle worker fills in whatever artifacts are still missing
//! whenever nobody else is waiting.

pub mod api;
pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
