pub mod events;
pub mod providers;
pub mod render;
pub mod runs;
pub mod scenes;
pub mod state;

pub use render::RenderedResult;
pub use scenes::{Scene, SceneStatus, COVER_SCENE_ID, SCENE_COUNT};
pub use state::{ProcessingState, Stage};
