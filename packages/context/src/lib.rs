// ABOUTME: Conversational context resolution with a persistence-backed cache
// ABOUTME: Fetch engine honoring trigger, skip and error semantics per variable definition

pub mod cache;
pub mod resolver;
pub mod storage;
pub mod types;

pub use cache::{CacheError, ContextCache};
pub use resolver::{validate_headers, ContextResolver, ResolveOptions, ResolverError};
pub use storage::{CacheEntry, ContextStorage, StorageError};
pub use types::{
    ContextConfig, ContextVariableDef, ErroredDefinition, FetchConfig, ResolutionResult,
    SkippedDefinition, Trigger,
};
