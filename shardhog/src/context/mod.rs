//! Context registry.
//!
//! A context is a small integer tag identifying a schema "slot": which
//! table kind its rows live in, how values are stored, how the object
//! relates to others. The registry is populated once at startup and
//! read-only afterwards; plans consult it on every operation.

pub mod flags;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::storage::{SerialSchema, StorageClass};

/// The table kinds a context can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Node,
    Property,
    Alias,
    Relationship,
    Name,
    Edge,
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Node => "node",
            TableKind::Property => "property",
            TableKind::Alias => "alias",
            TableKind::Relationship => "relationship",
            TableKind::Name => "name",
            TableKind::Edge => "edge",
        }
    }
}

/// Search class for name contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchClass {
    Prefix,
    Phonetic,
}

/// One end of a relationship: a fixed context, or a union of candidate
/// contexts the caller picks from at create-time.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Fixed(i32),
    Union(HashSet<i32>),
}

impl Endpoint {
    /// Resolve the concrete endpoint context for a call. A supplied
    /// context always wins; a union endpoint requires one.
    pub fn resolve(&self, ctx: i32, supplied: Option<i32>) -> Result<i32, crate::Error> {
        match (self, supplied) {
            (Endpoint::Fixed(fixed), None) => Ok(*fixed),
            (Endpoint::Fixed(_), Some(supplied)) => Ok(supplied),
            (Endpoint::Union(_), None) => Err(crate::Error::MissingContext(ctx)),
            (Endpoint::Union(set), Some(supplied)) => {
                if set.contains(&supplied) {
                    Ok(supplied)
                } else {
                    Err(crate::Error::BadContext(supplied))
                }
            }
        }
    }

    fn members(&self) -> Vec<i32> {
        match self {
            Endpoint::Fixed(ctx) => vec![*ctx],
            Endpoint::Union(set) => set.iter().copied().collect(),
        }
    }
}

/// Static metadata attached to a context, shaped by its table kind.
#[derive(Debug, Clone)]
pub enum ContextMeta {
    Node {
        base_ctx: Option<i32>,
        storage: StorageClass,
        schema: Option<Arc<dyn SerialSchema>>,
    },
    Property {
        base_ctx: i32,
        storage: StorageClass,
        schema: Option<Arc<dyn SerialSchema>>,
    },
    Alias {
        base_ctx: i32,
    },
    Relationship {
        base_ctx: Endpoint,
        rel_ctx: Endpoint,
        directed: bool,
        storage: StorageClass,
        schema: Option<Arc<dyn SerialSchema>>,
    },
    Name {
        base_ctx: i32,
        search: SearchClass,
        phonetic_loose: bool,
    },
    Edge {
        base_ctx: i32,
    },
}

impl ContextMeta {
    pub fn table_kind(&self) -> TableKind {
        match self {
            ContextMeta::Node { .. } => TableKind::Node,
            ContextMeta::Property { .. } => TableKind::Property,
            ContextMeta::Alias { .. } => TableKind::Alias,
            ContextMeta::Relationship { .. } => TableKind::Relationship,
            ContextMeta::Name { .. } => TableKind::Name,
            ContextMeta::Edge { .. } => TableKind::Edge,
        }
    }

    fn related(&self) -> Vec<i32> {
        match self {
            ContextMeta::Node { base_ctx, .. } => base_ctx.iter().copied().collect(),
            ContextMeta::Property { base_ctx, .. }
            | ContextMeta::Alias { base_ctx, .. }
            | ContextMeta::Name { base_ctx, .. }
            | ContextMeta::Edge { base_ctx, .. } => vec![*base_ctx],
            ContextMeta::Relationship {
                base_ctx, rel_ctx, ..
            } => {
                let mut all = base_ctx.members();
                all.extend(rel_ctx.members());
                all
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate context value: {0}")]
    DuplicateContext(i32),

    #[error("context {ctx} references unregistered context {related}")]
    UnknownRelated { ctx: i32, related: i32 },

    #[error("context {0} is not registered")]
    UnknownContext(i32),

    #[error("flag {flag} is already registered for context {ctx}")]
    DuplicateFlag { ctx: i32, flag: u16 },

    #[error("flag {0} is out of range (1..=32)")]
    FlagRange(u16),

    #[error("union endpoint for context {0} is empty")]
    EmptyUnion(i32),
}

/// The context registry. Built at startup, then frozen behind an `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    contexts: HashMap<i32, ContextMeta>,
    flags: HashMap<i32, HashSet<u16>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context. Related contexts must already be registered;
    /// duplicate values are an error.
    pub fn set_context(&mut self, ctx: i32, meta: ContextMeta) -> Result<(), Error> {
        if self.contexts.contains_key(&ctx) {
            return Err(Error::DuplicateContext(ctx));
        }

        if let ContextMeta::Relationship {
            base_ctx, rel_ctx, ..
        } = &meta
        {
            for endpoint in [base_ctx, rel_ctx] {
                if let Endpoint::Union(set) = endpoint {
                    if set.is_empty() {
                        return Err(Error::EmptyUnion(ctx));
                    }
                }
            }
        }

        for related in meta.related() {
            if !self.contexts.contains_key(&related) {
                return Err(Error::UnknownRelated { ctx, related });
            }
        }

        self.contexts.insert(ctx, meta);
        Ok(())
    }

    /// Register a flag value (1-based bit position) for a context.
    pub fn set_flag(&mut self, ctx: i32, flag: u16) -> Result<(), Error> {
        if !(1..=32).contains(&flag) {
            return Err(Error::FlagRange(flag));
        }
        if !self.contexts.contains_key(&ctx) {
            return Err(Error::UnknownContext(ctx));
        }
        if !self.flags.entry(ctx).or_default().insert(flag) {
            return Err(Error::DuplicateFlag { ctx, flag });
        }
        Ok(())
    }

    pub fn meta(&self, ctx: i32) -> Option<&ContextMeta> {
        self.contexts.get(&ctx)
    }

    pub fn table_kind(&self, ctx: i32) -> Option<TableKind> {
        self.meta(ctx).map(|meta| meta.table_kind())
    }

    /// The meta for `ctx`, which must target `kind`.
    pub fn expect(&self, ctx: i32, kind: TableKind) -> Result<&ContextMeta, crate::Error> {
        match self.meta(ctx) {
            Some(meta) if meta.table_kind() == kind => Ok(meta),
            _ => Err(crate::Error::BadContext(ctx)),
        }
    }

    /// Table name of a context's kind, for error messages.
    pub fn kind_name(&self, ctx: i32) -> &'static str {
        self.table_kind(ctx).map(|kind| kind.name()).unwrap_or("?")
    }

    pub fn storage(&self, ctx: i32) -> Option<StorageClass> {
        match self.meta(ctx)? {
            ContextMeta::Node { storage, .. }
            | ContextMeta::Property { storage, .. }
            | ContextMeta::Relationship { storage, .. } => Some(*storage),
            _ => None,
        }
    }

    pub fn schema(&self, ctx: i32) -> Option<&Arc<dyn SerialSchema>> {
        match self.meta(ctx)? {
            ContextMeta::Node { schema, .. }
            | ContextMeta::Property { schema, .. }
            | ContextMeta::Relationship { schema, .. } => schema.as_ref(),
            _ => None,
        }
    }

    pub fn search(&self, ctx: i32) -> Option<SearchClass> {
        match self.meta(ctx)? {
            ContextMeta::Name { search, .. } => Some(*search),
            _ => None,
        }
    }

    pub fn phonetic_loose(&self, ctx: i32) -> bool {
        matches!(
            self.meta(ctx),
            Some(ContextMeta::Name {
                phonetic_loose: true,
                ..
            })
        )
    }

    pub fn directed(&self, ctx: i32) -> Result<bool, crate::Error> {
        match self.meta(ctx) {
            Some(ContextMeta::Relationship { directed, .. }) => Ok(*directed),
            _ => Err(crate::Error::BadContext(ctx)),
        }
    }

    /// The base context a row at `ctx` hangs off, if one is fixed.
    pub fn base_ctx(&self, ctx: i32) -> Option<i32> {
        match self.meta(ctx)? {
            ContextMeta::Node { base_ctx, .. } => *base_ctx,
            ContextMeta::Property { base_ctx, .. }
            | ContextMeta::Alias { base_ctx, .. }
            | ContextMeta::Name { base_ctx, .. }
            | ContextMeta::Edge { base_ctx, .. } => Some(*base_ctx),
            ContextMeta::Relationship { base_ctx, .. } => match base_ctx {
                Endpoint::Fixed(fixed) => Some(*fixed),
                Endpoint::Union(_) => None,
            },
        }
    }

    pub(crate) fn registered_flags(&self, ctx: i32) -> Option<&HashSet<u16>> {
        self.flags.get(&ctx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duplicate_context() {
        let mut registry = Registry::new();
        registry
            .set_context(
                1,
                ContextMeta::Node {
                    base_ctx: None,
                    storage: StorageClass::Null,
                    schema: None,
                },
            )
            .unwrap();
        let err = registry.set_context(
            1,
            ContextMeta::Node {
                base_ctx: None,
                storage: StorageClass::Null,
                schema: None,
            },
        );
        assert!(matches!(err, Err(Error::DuplicateContext(1))));
    }

    #[test]
    fn test_related_must_exist() {
        let mut registry = Registry::new();
        let err = registry.set_context(5, ContextMeta::Alias { base_ctx: 1 });
        assert!(matches!(
            err,
            Err(Error::UnknownRelated { ctx: 5, related: 1 })
        ));
    }

    #[test]
    fn test_union_resolution() {
        let endpoint = Endpoint::Union([1, 2].into_iter().collect());
        assert_eq!(endpoint.resolve(7, Some(2)).unwrap(), 2);
        assert!(matches!(
            endpoint.resolve(7, None),
            Err(crate::Error::MissingContext(7))
        ));
        assert!(matches!(
            endpoint.resolve(7, Some(3)),
            Err(crate::Error::BadContext(3))
        ));
    }

    #[test]
    fn test_flag_registration() {
        let mut registry = Registry::new();
        registry
            .set_context(
                1,
                ContextMeta::Node {
                    base_ctx: None,
                    storage: StorageClass::Null,
                    schema: None,
                },
            )
            .unwrap();
        registry.set_flag(1, 1).unwrap();
        assert!(matches!(
            registry.set_flag(1, 1),
            Err(Error::DuplicateFlag { ctx: 1, flag: 1 })
        ));
        assert!(matches!(registry.set_flag(1, 33), Err(Error::FlagRange(33))));
        assert!(matches!(
            registry.set_flag(2, 1),
            Err(Error::UnknownContext(2))
        ));
    }
}
