//! Line items to bid on and their page layout

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::WizardError;

/// One line entry to be bid on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// 1-based, unique within the catalog
    pub item_number: u32,
    /// Wizard page the item appears on
    pub page: u32,
    /// 1..=page_size
    pub position_on_page: u32,
    pub description: String,
    pub unit_price: f64,
}

/// Raw item as delivered by the dispatch layer, before page placement is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSpec {
    pub item_number: u32,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub position_on_page: Option<u32>,
    pub description: String,
    pub unit_price: f64,
}

/// Ordered, validated list of items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    items: Vec<Item>,
    page_size: u32,
}

impl Catalog {
    /// Place each item on its page and check the catalog is coherent.
    pub fn new(specs: Vec<ItemSpec>, page_size: u32) -> Result<Self, WizardError> {
        if page_size == 0 {
            return Err(WizardError::InvalidArgument(
                "page size must be at least 1".to_string(),
            ));
        }

        let mut items = Vec::with_capacity(specs.len());
        let mut seen = std::collections::HashSet::new();
        for spec in specs {
            if spec.item_number == 0 {
                return Err(WizardError::InvalidArgument(
                    "item numbers are 1-based".to_string(),
                ));
            }
            if !seen.insert(spec.item_number) {
                return Err(WizardError::InvalidArgument(format!(
                    "duplicate item number {}",
                    spec.item_number
                )));
            }
            if !spec.unit_price.is_finite() || spec.unit_price < 0.0 {
                return Err(WizardError::InvalidArgument(format!(
                    "item {} has an invalid unit price",
                    spec.item_number
                )));
            }
            let page = spec
                .page
                .unwrap_or_else(|| spec.item_number.div_ceil(page_size));
            if page == 0 {
                return Err(WizardError::InvalidArgument(format!(
                    "item {} has page 0, pages are 1-based",
                    spec.item_number
                )));
            }
            let position_on_page = match spec.position_on_page {
                Some(position) => position,
                None => (page - 1)
                    .checked_mul(page_size)
                    .and_then(|offset| spec.item_number.checked_sub(offset))
                    .ok_or_else(|| {
                        WizardError::InvalidArgument(format!(
                            "item {} cannot sit on page {page} without an explicit position",
                            spec.item_number
                        ))
                    })?,
            };
            if position_on_page == 0 || position_on_page > page_size {
                return Err(WizardError::InvalidArgument(format!(
                    "item {} lands outside the page grid (page {page}, position {position_on_page})",
                    spec.item_number
                )));
            }
            items.push(Item {
                item_number: spec.item_number,
                page,
                position_on_page,
                description: clean_description(&spec.description),
                unit_price: spec.unit_price,
            });
        }
        items.sort_by_key(|i| i.item_number);
        Ok(Self { items, page_size })
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Items grouped by page, pages ascending, items in catalog order.
    pub fn by_page(&self) -> BTreeMap<u32, Vec<&Item>> {
        let mut pages: BTreeMap<u32, Vec<&Item>> = BTreeMap::new();
        for item in &self.items {
            pages.entry(item.page).or_default().push(item);
        }
        pages
    }

    /// Ascending list of pages holding at least one item
    pub fn pages(&self) -> Vec<u32> {
        self.by_page().into_keys().collect()
    }
}

/// Where in the per-item pipeline a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemPhase {
    PreValidation,
    Processing,
    PostValidation,
}

impl fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemPhase::PreValidation => "pre-validation",
            ItemPhase::Processing => "processing",
            ItemPhase::PostValidation => "post-validation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub item_number: u32,
    pub phase: ItemPhase,
    pub reason: String,
}

/// Aggregate result of a catalog run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub processed: Vec<u32>,
    pub failed: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn is_success(&self, catalog_len: usize) -> bool {
        self.processed.len() == catalog_len && self.failed.is_empty()
    }

    /// Record a result, replacing an earlier entry for the same item.
    ///
    /// A page revisited after an unexpected reload reprocesses its items; the
    /// latest outcome is the one that counts.
    pub fn record(&mut self, item_number: u32, outcome: Result<(), ItemFailure>) {
        self.processed.retain(|n| *n != item_number);
        self.failed.retain(|f| f.item_number != item_number);
        match outcome {
            Ok(()) => self.processed.push(item_number),
            Err(failure) => self.failed.push(failure),
        }
    }
}

/// Collapse line breaks, tabs and repeated spaces; the wizard's comment fields are single-line.
pub fn clean_description(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render a price the way the wizard's numeric fields hold it
pub fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{}", price as i64)
    } else {
        let s = format!("{price:.2}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Parse a price back from a field, tolerating thousands separators and a decimal comma.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // 1.234,5 → decimal comma
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(c), None) if cleaned.len() - c - 1 == 3 => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(d)) if cleaned.len() - d - 1 == 3 && cleaned.matches('.').count() >= 1 => {
            // 12.500 is a CLP thousands separator, not a fraction
            cleaned.replace('.', "")
        }
        _ => cleaned,
    };
    normalized.parse().ok()
}
