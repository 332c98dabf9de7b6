use std::collections::{BTreeMap, HashSet};

/// Immutable identity of one unit of harvest work
///
/// For symbol jobs the id is the symbol itself (`SH600000`); quote-list pages
/// use `<stock type>:<page>`. Metadata carries whatever the endpoint needs to
/// build its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
}

impl ItemDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Descriptor for a single instrument
    pub fn symbol(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self::new(symbol.clone()).with("symbol", symbol)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The instrument this item refers to, falling back to the id
    pub fn symbol_or_id(&self) -> &str {
        self.get("symbol").unwrap_or(&self.id)
    }
}

/// Ordered, duplicate-free sequence of items
#[derive(Debug, Clone, Default)]
pub struct Universe {
    items: Vec<ItemDescriptor>,
}

impl Universe {
    /// Builds a universe, dropping repeated ids and keeping the first occurrence
    pub fn new(items: impl IntoIterator<Item = ItemDescriptor>) -> Self {
        let mut seen = HashSet::new();
        let items = items
            .into_iter()
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        Self { items }
    }

    pub fn from_symbols<S: AsRef<str>>(symbols: &[S]) -> Self {
        Self::new(
            symbols
                .iter()
                .map(|s| s.as_ref().trim())
                .filter(|s| !s.is_empty())
                .map(ItemDescriptor::symbol),
        )
    }

    pub fn items(&self) -> &[ItemDescriptor] {
        &self.items
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
