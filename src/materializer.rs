//! Row → domain object hydration.
//!
//! A [`RowParser`] turns one [`Row`] into one domain object. Parsers resolve foreign-key
//! sub-objects through the [`ForeignKeyCache`] of the current [`ParseContext`], so rows that
//! share a parent share one `Arc` of it. The context lives for one query execution only and
//! its cache is cleared when the execution starts and again when it finishes.

use crate::diagnostics::CallerIdentity;
use crate::row::{Row, ValueExtractionError};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Foreign-key sub-objects already built during the current query, keyed by type and id.
#[derive(Default)]
pub struct ForeignKeyCache {
    entries: HashMap<(TypeId, i64), Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for ForeignKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignKeyCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ForeignKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Any + Send + Sync>(&self, id: i64) -> Option<Arc<T>> {
        self.entries
            .get(&(TypeId::of::<T>(), id))
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    /// Cached `T` for `id`, building and caching it with `build` on first use.
    ///
    /// # Errors
    ///
    /// Propagates the error of `build`; nothing is cached then.
    pub fn get_or_try_insert<T, F>(&mut self, id: i64, build: F) -> Result<Arc<T>, ValueExtractionError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, ValueExtractionError>,
    {
        if let Some(hit) = self.get::<T>(id) {
            return Ok(hit);
        }
        let built = Arc::new(build()?);
        self.entries
            .insert((TypeId::of::<T>(), id), Arc::clone(&built) as Arc<dyn Any + Send + Sync>);
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Per-execution state handed to every [`RowParser::parse`] call.
#[derive(Debug, Default)]
pub struct ParseContext {
    caller: Option<CallerIdentity>,
    resolve_foreign_keys: bool,
    cache: ForeignKeyCache,
}

impl ParseContext {
    pub fn new(caller: Option<CallerIdentity>, resolve_foreign_keys: bool) -> Self {
        Self {
            caller,
            resolve_foreign_keys,
            cache: ForeignKeyCache::new(),
        }
    }

    pub fn caller(&self) -> Option<&CallerIdentity> {
        self.caller.as_ref()
    }

    /// Whether foreign-key sub-objects should be built from joined columns of the row rather
    /// than left as bare ids.
    pub fn resolve_foreign_keys(&self) -> bool {
        self.resolve_foreign_keys
    }

    pub fn cache(&mut self) -> &mut ForeignKeyCache {
        &mut self.cache
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

/// Hydrates one row into one domain object.
pub trait RowParser {
    type Output;

    fn parse(&self, row: &Row, ctx: &mut ParseContext) -> Result<Self::Output, ValueExtractionError>;
}

impl<T, F> RowParser for F
where
    F: Fn(&Row, &mut ParseContext) -> Result<T, ValueExtractionError>,
{
    type Output = T;

    fn parse(&self, row: &Row, ctx: &mut ParseContext) -> Result<T, ValueExtractionError> {
        self(row, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::Value;

    #[derive(Debug, PartialEq)]
    struct Country {
        id: i64,
        code: String,
    }

    #[derive(Debug)]
    struct Accession {
        name: String,
        country: Option<Arc<Country>>,
    }

    struct AccessionParser;

    impl RowParser for AccessionParser {
        type Output = Accession;

        fn parse(&self, row: &Row, ctx: &mut ParseContext) -> Result<Accession, ValueExtractionError> {
            let country = match row.try_get_opt::<i64, _>("country_id")? {
                Some(id) if ctx.resolve_foreign_keys() => Some(ctx.cache().get_or_try_insert(id, || {
                    Ok(Country {
                        id,
                        code: row.try_get("country_code2")?,
                    })
                })?),
                _ => None,
            };
            Ok(Accession {
                name: row.try_get("name")?,
                country,
            })
        }
    }

    fn row(name: &str, country: i64, code: &str) -> Row {
        Row::from_pairs([
            ("name", Value::String(Some(name.to_string()))),
            ("country_id", Value::BigInt(Some(country))),
            ("country_code2", Value::String(Some(code.to_string()))),
        ])
    }

    #[test]
    fn test_shared_parent_resolved_once() {
        let mut ctx = ParseContext::new(None, true);
        let a = AccessionParser.parse(&row("A", 7, "DE"), &mut ctx).unwrap();
        let b = AccessionParser.parse(&row("B", 7, "XX"), &mut ctx).unwrap();
        let c = AccessionParser.parse(&row("C", 8, "FR"), &mut ctx).unwrap();

        let (a, b, c) = (a.country.unwrap(), b.country.unwrap(), c.country.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.code, "DE");
        assert_eq!(c.id, 8);
        assert_eq!(ctx.cached_count(), 2);
    }

    #[test]
    fn test_foreign_keys_left_unresolved_when_disabled() {
        let mut ctx = ParseContext::new(None, false);
        let a = AccessionParser.parse(&row("A", 7, "DE"), &mut ctx).unwrap();
        assert_eq!(a.name, "A");
        assert!(a.country.is_none());
        assert!(ctx.cache().is_empty());
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let mut cache = ForeignKeyCache::new();
        let err = cache
            .get_or_try_insert::<Country, _>(1, || Err(ValueExtractionError::NullValue))
            .unwrap_err();
        assert_eq!(err, ValueExtractionError::NullValue);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_keys_include_type() {
        let mut cache = ForeignKeyCache::new();
        cache.get_or_try_insert(1, || Ok(5u32)).unwrap();
        assert!(cache.get::<String>(1).is_none());
        assert_eq!(cache.get::<u32>(1).as_deref(), Some(&5));
    }

    #[test]
    fn test_closure_parser() {
        let parser = |row: &Row, _: &mut ParseContext| row.try_get::<String, _>("name");
        let mut ctx = ParseContext::default();
        assert_eq!(parser.parse(&row("A", 1, "DE"), &mut ctx).unwrap(), "A");
    }
}
