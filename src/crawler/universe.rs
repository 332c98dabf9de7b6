//! Sources of the item universe

use crate::crawler::endpoint::{EndpointKind, QuoteListEndpoint};
use crate::crawler::parser::quote_list_count;
use crate::crawler::Fetcher;
use crate::state::{ItemDescriptor, Universe};
use crate::storage::{render_cell, RecordStore, RowFilter};
use crate::{HarvestError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Stock types walked by the quote-list job
pub const DEFAULT_STOCK_TYPES: [&str; 2] = ["sha", "sza"];

/// Supplies the ordered items for one run
#[async_trait]
pub trait UniverseSource: Send + Sync {
    /// Human-readable origin, for logs and `--dry-run`
    fn describe(&self) -> String;

    async fn load(&self) -> Result<Universe>;
}

/// Fixed symbol list from the command line
#[derive(Debug, Clone)]
pub struct StaticUniverse {
    symbols: Vec<String>,
}

impl StaticUniverse {
    pub fn new<S: AsRef<str>>(symbols: &[S]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Splits a comma-separated list
    pub fn parse(list: &str) -> Self {
        Self {
            symbols: list.split(',').map(|s| s.trim().to_string()).collect(),
        }
    }
}

#[async_trait]
impl UniverseSource for StaticUniverse {
    fn describe(&self) -> String {
        format!("{} symbols from the command line", self.symbols.len())
    }

    async fn load(&self) -> Result<Universe> {
        Ok(Universe::from_symbols(&self.symbols))
    }
}

/// Distinct values of one column in a stored table, in storage order
pub struct StoredUniverse {
    store: Arc<dyn RecordStore>,
    table: String,
    column: String,
}

impl StoredUniverse {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            column: column.into(),
        }
    }
}

#[async_trait]
impl UniverseSource for StoredUniverse {
    fn describe(&self) -> String {
        format!("{}.{} from {} storage", self.table, self.column, self.store.kind().as_str())
    }

    async fn load(&self) -> Result<Universe> {
        if !self.store.exists(&self.table)? {
            return Err(HarvestError::Universe(format!(
                "table '{}' does not exist; run the quote-list job first or pass --symbols",
                self.table
            )));
        }

        let rows = self.store.read(&self.table, &RowFilter::all())?;
        let symbols: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get(&self.column))
            .map(render_cell)
            .collect();

        if symbols.is_empty() && !rows.is_empty() {
            return Err(HarvestError::Universe(format!(
                "table '{}' has no column '{}'",
                self.table, self.column
            )));
        }

        Ok(Universe::from_symbols(&symbols))
    }
}

/// One item per quote-list page, per stock type
///
/// Page 1 of each stock type is fetched up front to learn the total count.
pub struct QuotePageUniverse {
    fetcher: Arc<Fetcher>,
    endpoint: QuoteListEndpoint,
    stock_types: Vec<String>,
}

impl QuotePageUniverse {
    pub fn new(fetcher: Arc<Fetcher>, endpoint: QuoteListEndpoint) -> Self {
        Self {
            fetcher,
            endpoint,
            stock_types: DEFAULT_STOCK_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_stock_types<S: AsRef<str>>(mut self, stock_types: &[S]) -> Self {
        self.stock_types = stock_types.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }
}

#[async_trait]
impl UniverseSource for QuotePageUniverse {
    fn describe(&self) -> String {
        format!("quote-list pages for {}", self.stock_types.join(", "))
    }

    async fn load(&self) -> Result<Universe> {
        let mut items = Vec::new();

        for stock_type in &self.stock_types {
            let params = self.endpoint.page_params(stock_type, 1);
            let payload = self.fetcher.fetch(EndpointKind::QuoteList, &params).await?;
            let count = quote_list_count(&payload.body)?;
            let pages = self.endpoint.page_count(count);

            tracing::info!(stock_type = %stock_type, count, pages, "Quote list size");

            items.extend((1..=pages).map(|page| {
                ItemDescriptor::new(format!("{}:{}", stock_type, page))
                    .with("stock_type", stock_type.clone())
                    .with("page", page.to_string())
            }));
        }

        Ok(Universe::new(items))
    }
}
