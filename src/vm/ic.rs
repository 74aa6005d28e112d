/// Inline caches for virtual and interface call sites.
///
/// A call site remembers which method the receiver's runtime class selected
/// last time, so repeated calls on the same classes skip the superclass and
/// interface walk.
use std::sync::Arc;

use super::class::{ClassId, Method};

/// Maximum number of receiver classes a polymorphic site remembers.
pub const POLYMORPHIC_LIMIT: usize = 4;

/// Cache state for inline caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No receiver class recorded yet
    Uninitialized,
    /// Single receiver class observed (fastest path)
    Monomorphic,
    /// 2-4 receiver classes observed
    Polymorphic,
    /// More than 4 receiver classes observed (cache disabled)
    Megamorphic,
}

/// Inline cache for a single call site.
#[derive(Debug, Clone)]
pub struct InlineCache {
    pub state: CacheState,
    /// Observed (receiver class, selected method) pairs.
    entries: Vec<(ClassId, Arc<Method>)>,
}

impl InlineCache {
    pub fn new() -> Self {
        Self {
            state: CacheState::Uninitialized,
            entries: Vec::new(),
        }
    }

    /// Method previously selected for `class`, if the cache holds one.
    #[inline]
    pub fn check(&self, class: ClassId) -> Option<Arc<Method>> {
        match self.state {
            CacheState::Uninitialized | CacheState::Megamorphic => None,
            CacheState::Monomorphic | CacheState::Polymorphic => self
                .entries
                .iter()
                .find(|(c, _)| *c == class)
                .map(|(_, m)| Arc::clone(m)),
        }
    }

    /// Record a selection.
    pub fn update(&mut self, class: ClassId, method: Arc<Method>) {
        match self.state {
            CacheState::Uninitialized => {
                self.entries.push((class, method));
                self.state = CacheState::Monomorphic;
            }
            CacheState::Monomorphic | CacheState::Polymorphic => {
                if self.entries.iter().any(|(c, _)| *c == class) {
                    return;
                }
                if self.entries.len() < POLYMORPHIC_LIMIT {
                    self.entries.push((class, method));
                    self.state = CacheState::Polymorphic;
                } else {
                    // Too many receiver classes
                    self.state = CacheState::Megamorphic;
                    self.entries.clear();
                }
            }
            CacheState::Megamorphic => {}
        }
    }
}

impl Default for InlineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::MethodDef;

    fn method(name: &str) -> Arc<Method> {
        let def = MethodDef {
            name: name.to_string(),
            descriptor: "()V".to_string(),
            ..Default::default()
        };
        Arc::new(Method::new(ClassId(0), "demo/A", 0, def).unwrap())
    }

    #[test]
    fn test_ic_uninitialized() {
        let ic = InlineCache::new();
        assert_eq!(ic.state, CacheState::Uninitialized);
        assert!(ic.check(ClassId(1)).is_none());
    }

    #[test]
    fn test_ic_monomorphic() {
        let mut ic = InlineCache::new();
        ic.update(ClassId(42), method("a"));

        assert_eq!(ic.state, CacheState::Monomorphic);
        assert_eq!(ic.check(ClassId(42)).unwrap().name, "a");
        assert!(ic.check(ClassId(99)).is_none());
    }

    #[test]
    fn test_ic_polymorphic() {
        let mut ic = InlineCache::new();
        ic.update(ClassId(1), method("a"));
        ic.update(ClassId(2), method("b"));
        ic.update(ClassId(2), method("ignored"));
        ic.update(ClassId(3), method("c"));

        assert_eq!(ic.state, CacheState::Polymorphic);
        assert_eq!(ic.check(ClassId(2)).unwrap().name, "b");
        assert_eq!(ic.check(ClassId(3)).unwrap().name, "c");
    }

    #[test]
    fn test_ic_megamorphic() {
        let mut ic = InlineCache::new();
        for i in 1..=POLYMORPHIC_LIMIT as u32 {
            ic.update(ClassId(i), method("m"));
        }
        assert_eq!(ic.state, CacheState::Polymorphic);
        ic.update(ClassId(99), method("m"));

        assert_eq!(ic.state, CacheState::Megamorphic);
        assert!(ic.check(ClassId(1)).is_none());
        // Megamorphic sites stop recording.
        ic.update(ClassId(1), method("m"));
        assert!(ic.check(ClassId(1)).is_none());
    }
}
