//! Local product cache.
//!
//! Keeps the branch catalog available for checkout while the backend is
//! unreachable. Replace-all semantics: each successful fetch overwrites the
//! whole cache in one transaction, so the cache is always a consistent view
//! of one catalog version.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProduct {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub variants: Vec<String>,
}

#[derive(Clone)]
pub struct ProductCache {
    db: Arc<DbState>,
}

impl ProductCache {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Overwrite the cache with a fresh catalog. Returns the stored count.
    pub fn replace_all(&self, products: &[CachedProduct]) -> CoreResult<usize> {
        let conn = self.db.lock()?;

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| CoreError::Storage(format!("begin transaction: {e}")))?;

        let result = (|| -> CoreResult<()> {
            conn.execute("DELETE FROM product_cache", [])
                .map_err(|e| CoreError::Storage(format!("clear product cache: {e}")))?;

            for product in products {
                let variants = serde_json::to_string(&product.variants)?;
                conn.execute(
                    "INSERT INTO product_cache (id, name, category, price, variants, cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
                    params![
                        product.id,
                        product.name,
                        product.category,
                        product.price,
                        variants,
                    ],
                )
                .map_err(|e| CoreError::Storage(format!("insert product: {e}")))?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| CoreError::Storage(format!("commit: {e}")))?;
                Ok(products.len())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn list(&self) -> CoreResult<Vec<CachedProduct>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, category, price, variants FROM product_cache ORDER BY name ASC",
            )
            .map_err(|e| CoreError::Storage(format!("prepare product list: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| CoreError::Storage(format!("query products: {e}")))?;

        let mut products = Vec::new();
        for row in rows.flatten() {
            let (id, name, category, price, variants) = row;
            products.push(CachedProduct {
                id,
                name,
                category,
                price,
                variants: serde_json::from_str(&variants).unwrap_or_default(),
            });
        }
        Ok(products)
    }

    pub fn count(&self) -> CoreResult<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM product_cache", [], |row| row.get(0))
            .map_err(|e| CoreError::Storage(format!("count products: {e}")))?;
        Ok(count as usize)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    fn product(id: &str, name: &str, price: f64) -> CachedProduct {
        CachedProduct {
            id: id.into(),
            name: name.into(),
            category: Some("tea".into()),
            price,
            variants: vec!["Regular".into(), "Large".into()],
        }
    }

    #[test]
    fn test_replace_all_roundtrip() {
        let cache = ProductCache::new(test_db());

        let stored = cache
            .replace_all(&[
                product("p-2", "Es Teh Original", 8_000.0),
                product("p-1", "Es Teh Susu", 10_000.0),
            ])
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(cache.count().unwrap(), 2);

        let listed = cache.list().unwrap();
        // ordered by name
        assert_eq!(listed[0].name, "Es Teh Original");
        assert_eq!(listed[1].name, "Es Teh Susu");
        assert_eq!(listed[0].variants, vec!["Regular", "Large"]);

        // a later fetch fully replaces the previous catalog
        cache
            .replace_all(&[product("p-3", "Lemon Tea", 12_000.0)])
            .unwrap();
        let listed = cache.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "p-3");
    }

    #[test]
    fn test_empty_catalog_clears_cache() {
        let cache = ProductCache::new(test_db());
        cache
            .replace_all(&[product("p-1", "Es Teh Susu", 10_000.0)])
            .unwrap();
        cache.replace_all(&[]).unwrap();
        assert_eq!(cache.count().unwrap(), 0);
    }
}
