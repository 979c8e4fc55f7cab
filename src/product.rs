//! Query results
//!
//! [`ProductRecord`] is built by an adapter from one wire-result item and is
//! immutable afterwards. [`QueryResult`] keeps records sorted by product id so
//! the order callers see never depends on provider-side ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Index, RangeBounds};

use crate::constraint::NameConstraint;

/// One downloadable product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    product_id: String,
    provider_index: String,
    acquisition_date: DateTime<Utc>,
    raw_metadata: serde_json::Value,
}

impl ProductRecord {
    /// Create a record
    pub fn new(
        product_id: impl Into<String>,
        provider_index: impl Into<String>,
        acquisition_date: DateTime<Utc>,
        raw_metadata: serde_json::Value,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            provider_index: provider_index.into(),
            acquisition_date,
            raw_metadata,
        }
    }

    /// Human-meaningful product name
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Opaque provider key used for downloads and metadata lookups
    pub fn provider_index(&self) -> &str {
        &self.provider_index
    }

    /// Sensing start
    pub fn acquisition_date(&self) -> DateTime<Utc> {
        self.acquisition_date
    }

    /// Provider payload exactly as returned on the wire
    pub fn raw_metadata(&self) -> &serde_json::Value {
        &self.raw_metadata
    }

    /// Look up a nested field of the raw payload by key path
    pub fn field(&self, path: &[&str]) -> Option<&serde_json::Value> {
        path.iter().try_fold(&self.raw_metadata, |node, key| node.get(*key))
    }
}

/// Products returned by one query, sorted by product id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ProductRecord>", into = "Vec<ProductRecord>")]
pub struct QueryResult {
    products: Vec<ProductRecord>,
}

impl From<Vec<ProductRecord>> for QueryResult {
    fn from(products: Vec<ProductRecord>) -> Self {
        Self::new(products)
    }
}

impl From<QueryResult> for Vec<ProductRecord> {
    fn from(result: QueryResult) -> Self {
        result.products
    }
}

impl QueryResult {
    /// Build a result, sorting records by product id
    pub fn new(mut products: Vec<ProductRecord>) -> Self {
        products.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Self { products }
    }

    /// Empty result
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of products
    pub fn len(&self) -> usize {
        self.products.len()
    }

    /// Whether the result holds no product
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Product at `index`, if any
    pub fn get(&self, index: usize) -> Option<&ProductRecord> {
        self.products.get(index)
    }

    /// Owned sub-result; shares nothing with `self`
    ///
    /// Out-of-range bounds are clamped instead of panicking.
    pub fn slice<R: RangeBounds<usize>>(&self, range: R) -> QueryResult {
        use std::ops::Bound;
        let len = self.products.len();
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .min(len);
        if start >= end {
            return QueryResult::empty();
        }
        QueryResult {
            products: self.products[start..end].to_vec(),
        }
    }

    /// Iterate in product-id order
    pub fn iter(&self) -> std::slice::Iter<'_, ProductRecord> {
        self.products.iter()
    }

    /// Product ids in order
    pub fn product_ids(&self) -> Vec<&str> {
        self.products.iter().map(|p| p.product_id()).collect()
    }

    /// Find a product by id
    pub fn find(&self, product_id: &str) -> Option<&ProductRecord> {
        self.products
            .binary_search_by(|p| p.product_id.as_str().cmp(product_id))
            .ok()
            .map(|i| &self.products[i])
    }

    /// Keep only products whose id satisfies `name`
    pub fn filter_name(&self, name: &NameConstraint) -> QueryResult {
        QueryResult {
            products: self
                .products
                .iter()
                .filter(|p| name.matches(&p.product_id))
                .cloned()
                .collect(),
        }
    }

    /// Consume into the underlying records
    pub fn into_vec(self) -> Vec<ProductRecord> {
        self.products
    }
}

impl Index<usize> for QueryResult {
    type Output = ProductRecord;

    fn index(&self, index: usize) -> &Self::Output {
        &self.products[index]
    }
}

impl IntoIterator for QueryResult {
    type Item = ProductRecord;
    type IntoIter = std::vec::IntoIter<ProductRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.products.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a ProductRecord;
    type IntoIter = std::slice::Iter<'a, ProductRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.products.iter()
    }
}

impl FromIterator<ProductRecord> for QueryResult {
    fn from_iter<T: IntoIterator<Item = ProductRecord>>(iter: T) -> Self {
        QueryResult::new(iter.into_iter().collect())
    }
}
