use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use fixedbitset::FixedBitSet;

use crate::component::ComponentIndex;
use crate::error::{EcsError, Result};

/// Shape of a matcher, derived from which index sets are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherKind {
    /// Only allOf indices.
    AllOf,
    /// Only anyOf indices.
    AnyOf,
    /// Any combination involving noneOf, or allOf together with anyOf.
    Compound,
}

/// Predicate over component presence: AllOf / AnyOf / NoneOf.
///
/// Index sets are de-duplicated and kept sorted, so equality and hashing
/// ignore the order in which indices were supplied. Matchers are the key of
/// the context's group cache.
///
/// # Example
///
/// ```
/// use entitas_ecs::Matcher;
///
/// let a = Matcher::all_of([2, 1]).none_of([4, 3]);
/// let b = Matcher::all_of([1, 2, 2]).none_of([3, 4]);
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "AllOf(1, 2).NoneOf(3, 4)");
/// ```
#[derive(Clone, Default)]
pub struct Matcher {
    all_of: Vec<ComponentIndex>,
    any_of: Vec<ComponentIndex>,
    none_of: Vec<ComponentIndex>,
    /// Sorted union of all three sets.
    indices: OnceLock<Arc<[ComponentIndex]>>,
    /// Optional display names, indexed by component index.
    component_names: Option<Arc<[String]>>,
}

fn normalized(indices: impl IntoIterator<Item = ComponentIndex>) -> Vec<ComponentIndex> {
    let mut v: Vec<_> = indices.into_iter().collect();
    v.sort_unstable();
    v.dedup();
    v
}

fn merge_into(target: &mut Vec<ComponentIndex>, extra: impl IntoIterator<Item = ComponentIndex>) {
    target.extend(extra);
    target.sort_unstable();
    target.dedup();
}

impl Matcher {
    /// Matches entities that have every one of `indices`.
    pub fn all_of(indices: impl IntoIterator<Item = ComponentIndex>) -> Self {
        Self {
            all_of: normalized(indices),
            ..Default::default()
        }
    }

    /// Matches entities that have at least one of `indices`.
    pub fn any_of(indices: impl IntoIterator<Item = ComponentIndex>) -> Self {
        Self {
            any_of: normalized(indices),
            ..Default::default()
        }
    }

    /// Builds an AllOf matcher from single-index matchers.
    ///
    /// Fails with [`EcsError::InvalidMatcherMerge`] if any input has more
    /// than one index of its own.
    pub fn all_of_matchers<'a>(matchers: impl IntoIterator<Item = &'a Matcher>) -> Result<Self> {
        let (indices, names) = Self::merge_single_index(matchers)?;
        let mut merged = Self::all_of(indices);
        merged.component_names = names;
        Ok(merged)
    }

    /// Builds an AnyOf matcher from single-index matchers.
    pub fn any_of_matchers<'a>(matchers: impl IntoIterator<Item = &'a Matcher>) -> Result<Self> {
        let (indices, names) = Self::merge_single_index(matchers)?;
        let mut merged = Self::any_of(indices);
        merged.component_names = names;
        Ok(merged)
    }

    fn merge_single_index<'a>(
        matchers: impl IntoIterator<Item = &'a Matcher>,
    ) -> Result<(Vec<ComponentIndex>, Option<Arc<[String]>>)> {
        let mut indices = Vec::new();
        let mut names = None;
        for m in matchers {
            let own = m.indices();
            if own.len() != 1 {
                return Err(EcsError::InvalidMatcherMerge(m.to_string()));
            }
            indices.push(own[0]);
            if names.is_none() {
                names = m.component_names.clone();
            }
        }
        Ok((indices, names))
    }

    /// Adds allOf indices, mutating this matcher.
    pub fn and_all_of(mut self, indices: impl IntoIterator<Item = ComponentIndex>) -> Self {
        merge_into(&mut self.all_of, indices);
        self.invalidate();
        self
    }

    /// Adds anyOf indices, mutating this matcher.
    pub fn and_any_of(mut self, indices: impl IntoIterator<Item = ComponentIndex>) -> Self {
        merge_into(&mut self.any_of, indices);
        self.invalidate();
        self
    }

    /// Adds exclusion indices, mutating this matcher.
    pub fn none_of(mut self, indices: impl IntoIterator<Item = ComponentIndex>) -> Self {
        merge_into(&mut self.none_of, indices);
        self.invalidate();
        self
    }

    /// Attaches component names used by [`Display`](fmt::Display).
    ///
    /// Names do not take part in equality or hashing.
    pub fn with_component_names(mut self, names: Arc<[String]>) -> Self {
        self.component_names = Some(names);
        self
    }

    pub(crate) fn set_component_names(&mut self, names: Arc<[String]>) {
        self.component_names = Some(names);
    }

    pub fn component_names(&self) -> Option<&[String]> {
        self.component_names.as_deref()
    }

    fn invalidate(&mut self) {
        self.indices = OnceLock::new();
    }

    pub fn all_of_indices(&self) -> &[ComponentIndex] {
        &self.all_of
    }

    pub fn any_of_indices(&self) -> &[ComponentIndex] {
        &self.any_of
    }

    pub fn none_of_indices(&self) -> &[ComponentIndex] {
        &self.none_of
    }

    /// Sorted union of every index the matcher mentions. Cached.
    pub fn indices(&self) -> Arc<[ComponentIndex]> {
        self.indices
            .get_or_init(|| {
                let mut all = self.all_of.clone();
                merge_into(&mut all, self.any_of.iter().copied());
                merge_into(&mut all, self.none_of.iter().copied());
                all.into()
            })
            .clone()
    }

    pub fn kind(&self) -> MatcherKind {
        match (
            self.all_of.is_empty(),
            self.any_of.is_empty(),
            self.none_of.is_empty(),
        ) {
            (false, true, true) => MatcherKind::AllOf,
            (true, false, true) => MatcherKind::AnyOf,
            _ => MatcherKind::Compound,
        }
    }

    /// `true` when neither allOf nor anyOf constrain membership.
    pub fn is_empty(&self) -> bool {
        self.all_of.is_empty() && self.any_of.is_empty()
    }

    /// Tests a component presence mask.
    pub fn matches_mask(&self, mask: &FixedBitSet) -> bool {
        let has = |i: &ComponentIndex| mask.contains(*i);
        (self.all_of.is_empty() || self.all_of.iter().all(has))
            && (self.any_of.is_empty() || self.any_of.iter().any(has))
            && (self.none_of.is_empty() || !self.none_of.iter().any(has))
    }

    fn write_set(
        &self,
        f: &mut fmt::Formatter<'_>,
        prefix: &str,
        set: &[ComponentIndex],
    ) -> fmt::Result {
        write!(f, "{prefix}(")?;
        for (n, index) in set.iter().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            match self.component_names.as_deref().and_then(|names| names.get(*index)) {
                Some(name) => f.write_str(name)?,
                None => write!(f, "{index}")?,
            }
        }
        f.write_str(")")
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.all_of == other.all_of && self.any_of == other.any_of && self.none_of == other.none_of
    }
}

impl Eq for Matcher {}

impl Hash for Matcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.all_of.hash(state);
        self.any_of.hash(state);
        self.none_of.hash(state);
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (prefix, set) in [
            ("AllOf", &self.all_of),
            ("AnyOf", &self.any_of),
            ("NoneOf", &self.none_of),
        ] {
            if set.is_empty() {
                continue;
            }
            if wrote {
                f.write_str(".")?;
            }
            self.write_set(f, prefix, set)?;
            wrote = true;
        }
        if !wrote {
            f.write_str("AllOf()")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matcher({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    const A: usize = 1;
    const B: usize = 2;
    const C: usize = 3;
    const D: usize = 4;

    fn hash_of(m: &Matcher) -> u64 {
        let mut h = DefaultHasher::new();
        m.hash(&mut h);
        h.finish()
    }

    fn mask(indices: &[usize]) -> FixedBitSet {
        let mut m = FixedBitSet::with_capacity(5);
        for &i in indices {
            m.insert(i);
        }
        m
    }

    #[test]
    fn indices_are_deduplicated_union() {
        let m = Matcher::all_of([A, A, B]).none_of([B, C, C]);
        assert_eq!(&*m.indices(), &[A, B, C]);
        assert_eq!(m.all_of_indices(), &[A, B]);
        assert_eq!(m.none_of_indices(), &[B, C]);

        let m = Matcher::all_of([A, B]).and_any_of([C, D]);
        assert_eq!(&*m.indices(), &[A, B, C, D]);
        assert_eq!(m.any_of_indices(), &[C, D]);
    }

    #[test]
    fn indices_are_cached_until_mutated() {
        let m = Matcher::all_of([A, B]);
        assert!(Arc::ptr_eq(&m.indices(), &m.indices()));

        let m = m.none_of([C]);
        assert_eq!(&*m.indices(), &[A, B, C]);
    }

    #[test]
    fn matching_rules() {
        let all_ab = Matcher::all_of([A, B]);
        assert!(!all_ab.matches_mask(&mask(&[A])));
        assert!(all_ab.matches_mask(&mask(&[A, B])));
        assert!(all_ab.matches_mask(&mask(&[A, B, C])));

        let any_ab = Matcher::any_of([A, B]);
        assert!(!any_ab.matches_mask(&mask(&[C])));
        assert!(any_ab.matches_mask(&mask(&[B])));

        let all_none = Matcher::all_of([A, B]).none_of([C, D]);
        assert!(all_none.matches_mask(&mask(&[A, B])));
        assert!(!all_none.matches_mask(&mask(&[A, B, C])));

        let any_none = Matcher::any_of([A, B]).none_of([C, D]);
        assert!(any_none.matches_mask(&mask(&[A])));
        assert!(!any_none.matches_mask(&mask(&[A, B, C])));

        let all_any = Matcher::all_of([A, B]).and_any_of([C, D]);
        assert!(!all_any.matches_mask(&mask(&[A, B])));
        assert!(all_any.matches_mask(&mask(&[A, B, C])));
    }

    #[test]
    fn merges_single_index_matchers() {
        let merged = Matcher::all_of_matchers([
            &Matcher::all_of([A]),
            &Matcher::all_of([A]),
            &Matcher::all_of([B]),
        ])
        .unwrap();
        assert_eq!(merged, Matcher::all_of([A, B]));

        let merged =
            Matcher::any_of_matchers([&Matcher::any_of([C]), &Matcher::any_of([B])]).unwrap();
        assert_eq!(merged.any_of_indices(), &[B, C]);
        assert_eq!(merged.kind(), MatcherKind::AnyOf);
    }

    #[test]
    fn merging_multi_index_matcher_fails() {
        let err = Matcher::all_of_matchers([&Matcher::all_of([A, B])]).unwrap_err();
        assert!(matches!(err, EcsError::InvalidMatcherMerge(_)));
        assert!(Matcher::any_of_matchers([&Matcher::any_of([A, B])]).is_err());
    }

    #[test]
    fn equality_ignores_order_and_kind_is_consistent() {
        let m1 = Matcher::all_of([A, B]).and_any_of([C, D]).none_of([4, 3]);
        let m2 = Matcher::all_of([B, A]).and_any_of([D, C]).none_of([3, 4]);
        assert_eq!(m1, m2);
        assert_eq!(hash_of(&m1), hash_of(&m2));

        assert_ne!(Matcher::all_of([A, B]), Matcher::any_of([A, B]));
        assert_ne!(Matcher::all_of([A]), Matcher::all_of([A]).none_of([B]));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Matcher::all_of([A, B]).to_string(), "AllOf(1, 2)");
        assert_eq!(Matcher::any_of([A, B]).to_string(), "AnyOf(1, 2)");
        assert_eq!(
            Matcher::any_of([A, B]).none_of([C, D]).to_string(),
            "AnyOf(1, 2).NoneOf(3, 4)"
        );
        assert_eq!(
            Matcher::all_of([A, B]).and_any_of([C, D]).to_string(),
            "AllOf(1, 2).AnyOf(3, 4)"
        );
    }

    #[test]
    fn display_uses_component_names() {
        let names: Arc<[String]> = ["one", "two", "three", "four", "five"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let m = Matcher::all_of([A, B])
            .none_of([C, D])
            .with_component_names(names.clone());
        assert_eq!(m.to_string(), "AllOf(two, three).NoneOf(four, five)");

        let merged = Matcher::all_of_matchers([
            &Matcher::all_of([A]).with_component_names(names.clone()),
            &Matcher::all_of([B]),
        ])
        .unwrap();
        assert_eq!(merged.to_string(), "AllOf(two, three)");
    }
}
