//! GitHub-style API fetch layer: the generic loader scaffold and the
//! paginated fetch behaviour.

pub mod errors;
pub mod loader;
pub mod pageable;

pub use errors::FetchError;
pub use loader::{EntityLoader, JsonMap, LoadBehaviour, LoadContext, LoadResult, PageState};
pub use pageable::PageableBehaviour;
