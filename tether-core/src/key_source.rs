//! Where an entity's cache path comes from.

use std::fmt;
use std::sync::Arc;

/// Whether a key is being derived for a single record or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRole {
    Record,
    Group,
}

/// Inputs available to a key source.
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub kind: &'a str,
    pub role: EntityRole,
    /// Record identifier; `None` for groups and new records.
    pub id: Option<&'a str>,
}

/// Entity-supplied key function.
pub type KeyFn = Arc<dyn Fn(&KeyContext<'_>) -> Option<String> + Send + Sync>;

/// Source of the path half of a cache key.
#[derive(Clone)]
pub enum KeySource {
    /// A fixed path.
    Path(String),
    /// A REST-style resource root. Records resolve to `root/id`, groups to
    /// `root`. A record without an id does not resolve.
    Resource { root: String },
    /// A custom key function.
    Custom(KeyFn),
}

impl KeySource {
    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }

    pub fn resource(root: impl Into<String>) -> Self {
        Self::Resource { root: root.into() }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&KeyContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Resolve the path for an entity. Empty paths resolve to `None`.
    pub fn resolve(&self, ctx: &KeyContext<'_>) -> Option<String> {
        let path = match self {
            Self::Path(path) => Some(path.clone()),
            Self::Resource { root } => match (ctx.role, ctx.id) {
                (EntityRole::Group, _) => Some(root.clone()),
                (EntityRole::Record, Some(id)) if !id.is_empty() => {
                    Some(format!("{}/{}", root.trim_end_matches('/'), id))
                }
                (EntityRole::Record, _) => None,
            },
            Self::Custom(f) => f(ctx),
        };
        path.filter(|p| !p.is_empty())
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Resource { root } => f.debug_struct("Resource").field("root", root).finish(),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}
