#![forbid(unsafe_code)]
//! Snapcache public API facade.
//!
//! Re-exports the dictionary, its scope plumbing and shared types through a
//! single crate for downstream consumers.
//!
//! ```
//! use snapcache::{ScopeContext, SnapDictionary};
//!
//! let dict: SnapDictionary<&str, u32> = SnapDictionary::new();
//! dict.set("hits", 1)?;
//! let before = dict.create_snapshot();
//!
//! let scope = ScopeContext::shared();
//! dict.get_scoped_write_lock(&scope)?.set("hits", 2)?;
//! scope.scope_exit(true);
//!
//! assert_eq!(before.get(&"hits").as_deref(), Some(&1));
//! assert_eq!(dict.create_snapshot().get(&"hits").as_deref(), Some(&2));
//! # Ok::<(), snapcache::SnapError>(())
//! ```

pub use snap_dict::*;
pub use snap_scope::{Contextual, ScopeContextual, get_contextual};
