//! Flag codec: sets of 1-based flag values ↔ bitmaps.

use std::collections::HashSet;

use super::Registry;
use crate::Error;

impl Registry {
    /// Convert a set of flag values to a bitmap. Every flag must be
    /// registered for `ctx`.
    pub fn flags_to_int(&self, ctx: i32, flags: &[u16]) -> Result<u32, Error> {
        if self.meta(ctx).is_none() {
            return Err(Error::BadContext(ctx));
        }

        let registered = self.registered_flags(ctx);
        let mut bitmap = 0u32;
        for flag in flags {
            if !registered.map(|set| set.contains(flag)).unwrap_or(false) {
                return Err(Error::BadFlag { flag: *flag, ctx });
            }
            bitmap |= 1 << (flag - 1);
        }

        Ok(bitmap)
    }

    /// Convert a bitmap back to the set of registered flag values.
    /// Bits not registered for `ctx` are dropped.
    pub fn int_to_flags(&self, ctx: i32, bitmap: u32) -> Result<HashSet<u16>, Error> {
        if self.meta(ctx).is_none() {
            return Err(Error::BadContext(ctx));
        }

        let registered = self.registered_flags(ctx);
        let mut flags = HashSet::new();
        for flag in 1..=32u16 {
            if bitmap & (1 << (flag - 1)) != 0
                && registered.map(|set| set.contains(&flag)).unwrap_or(false)
            {
                flags.insert(flag);
            }
        }

        Ok(flags)
    }
}

#[cfg(test)]
mod test {
    use crate::context::{ContextMeta, Registry};
    use crate::storage::StorageClass;

    fn registry() -> Registry {
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
        for flag in [1, 2, 5] {
            registry.set_flag(1, flag).unwrap();
        }
        registry
    }

    #[test]
    fn test_round_trip() {
        let registry = registry();
        let bitmap = registry.flags_to_int(1, &[1, 5]).unwrap();
        assert_eq!(bitmap, 0b10001);
        let flags = registry.int_to_flags(1, bitmap).unwrap();
        assert_eq!(flags, [1, 5].into_iter().collect());
    }

    #[test]
    fn test_bad_flag() {
        let registry = registry();
        assert!(matches!(
            registry.flags_to_int(1, &[3]),
            Err(crate::Error::BadFlag { flag: 3, ctx: 1 })
        ));
    }

    #[test]
    fn test_unregistered_bits_dropped() {
        let registry = registry();
        // bit 3 (flag 4) isn't registered
        let flags = registry.int_to_flags(1, 0b1011).unwrap();
        assert_eq!(flags, [1, 2].into_iter().collect());
    }
}
