//! Cursor-driven walk over one key prefix.

use canopy_core::Context;
use canopy_store::{cursor, Cell, Page, PageRequest};

use crate::error::Result;
use crate::manager::EntityManager;

/// Walks a prefix in key order for one listing page.
///
/// Callers pull batches until they hold `limit` items or the prefix is
/// exhausted, skipping entries that no longer resolve. The cursor handed
/// back encodes the last key consumed, bound to `scope`.
pub(crate) struct Pager {
    prefix: String,
    scope: String,
    limit: usize,
    after: Option<String>,
    exhausted: bool,
}

impl Pager {
    pub fn new(
        em: &EntityManager,
        prefix: String,
        scope: String,
        page: &PageRequest,
    ) -> Result<Self> {
        let after = match &page.cursor {
            Some(token) => Some(cursor::decode(&scope, token)?),
            None => None,
        };
        Ok(Self {
            prefix,
            scope,
            limit: em.config().page_size(page.limit),
            after,
            exhausted: false,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether another batch is needed to fill `have` items.
    pub fn wants(&self, have: usize) -> bool {
        have < self.limit && !self.exhausted
    }

    pub async fn next_batch(
        &mut self,
        em: &EntityManager,
        ctx: &Context,
        have: usize,
    ) -> Result<Vec<Cell>> {
        let want = self.limit.saturating_sub(have).max(1);
        let cells = em
            .store()
            .scan(&self.prefix, self.after.as_deref(), want, ctx.timeout)
            .await?;
        if cells.len() < want {
            self.exhausted = true;
        }
        if let Some(last) = cells.last() {
            self.after = Some(last.key.clone());
        }
        Ok(cells)
    }

    /// Close the page, attaching a cursor only if more keys follow.
    pub async fn finish<T>(
        self,
        em: &EntityManager,
        ctx: &Context,
        items: Vec<T>,
    ) -> Result<Page<T>> {
        let cursor = match (&self.after, self.exhausted) {
            (Some(after), false) => {
                let more = em
                    .store()
                    .scan(&self.prefix, Some(after), 1, ctx.timeout)
                    .await?;
                (!more.is_empty()).then(|| cursor::encode(&self.scope, after))
            }
            _ => None,
        };
        Ok(Page { items, cursor })
    }
}
