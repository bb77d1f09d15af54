//! Price Extraction
//!
//! Finds a price in a quote page by trying an ordered chain of strategies.
//! Structural CSS lookups come first; a full-document numeric scan is the
//! last resort. The first strategy that yields text wins.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use scraper::{Html, Selector};

/// CSS locations that have historically held the last price, in priority order.
pub const PRICE_SELECTORS: [&str; 5] = [
    "[data-symbol-short] .js-symbol-last",
    ".tv-symbol-price-quote__value",
    "[class*=\"priceValue\"]",
    "span[class*=\"lastPrice\"]",
    "div[class*=\"priceWrapper\"] span[class*=\"price-\"]:first-child",
];

/// Upper bound (exclusive) for a price accepted by the document scan.
const SCAN_MAX_PRICE: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Upper bound (exclusive) on the raw text length accepted by the document scan.
const SCAN_MAX_CHARS: usize = 20;

#[allow(clippy::expect_used)]
static BARE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[0-9,]+\.?[0-9]*\s*$").expect("bare number pattern is valid")
});

#[allow(clippy::expect_used)]
static ANY_ELEMENT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("*").expect("universal selector is valid"));

// =============================================================================
// Strategies
// =============================================================================

/// Selector error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CSS selector {css:?}: {reason}")]
pub struct InvalidSelector {
    /// The selector text.
    pub css: String,
    /// Parser message.
    pub reason: String,
}

/// One way of locating price text in a parsed page.
pub trait ExtractionStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Return candidate price text, or `None` if this strategy found nothing.
    fn extract(&self, document: &Html) -> Option<String>;
}

/// Takes the text of the first element matching a CSS selector.
///
/// Text that is empty after trimming counts as no match.
pub struct SelectorStrategy {
    css: String,
    selector: Selector,
}

impl SelectorStrategy {
    /// Compile a selector strategy.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSelector`] if the CSS cannot be parsed.
    pub fn new(css: &str) -> Result<Self, InvalidSelector> {
        let selector = Selector::parse(css).map_err(|e| InvalidSelector {
            css: css.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            css: css.to_string(),
            selector,
        })
    }
}

impl fmt::Debug for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SelectorStrategy").field(&self.css).finish()
    }
}

impl ExtractionStrategy for SelectorStrategy {
    fn name(&self) -> &str {
        &self.css
    }

    fn extract(&self, document: &Html) -> Option<String> {
        let element = document.select(&self.selector).next()?;
        let text: String = element.text().collect();
        // Whitespace-only text is a miss, so a blank placeholder element does
        // not stop the chain before a later strategy finds the price.
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Scans every element in document order for text that is a bare number.
///
/// A candidate must match `^\s*[0-9,]+\.?[0-9]*\s*$`, be shorter than 20
/// characters, and parse to a value in `(0, 1_000_000)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericScanStrategy;

impl NumericScanStrategy {
    /// Whether a single element's text qualifies as a price.
    #[must_use]
    pub fn accepts(text: &str) -> bool {
        let chars = text.chars().count();
        if chars == 0 || chars >= SCAN_MAX_CHARS || !BARE_NUMBER.is_match(text) {
            return false;
        }
        parse_price_text(text).is_some_and(|value| value < SCAN_MAX_PRICE)
    }
}

impl ExtractionStrategy for NumericScanStrategy {
    fn name(&self) -> &str {
        "numeric-scan"
    }

    fn extract(&self, document: &Html) -> Option<String> {
        document
            .select(&ANY_ELEMENT)
            .map(|element| element.text().collect::<String>())
            .find(|text| Self::accepts(text))
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Text found by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Name of the strategy that matched.
    pub strategy: String,
    /// The matched text.
    pub text: String,
}

/// Ordered chain of extraction strategies.
pub struct PriceExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl PriceExtractor {
    /// Create an extractor from an explicit strategy chain.
    #[must_use]
    pub fn new(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain: every price selector, then the document scan.
    #[must_use]
    pub fn default_chain() -> Self {
        let mut strategies: Vec<Box<dyn ExtractionStrategy>> = PRICE_SELECTORS
            .iter()
            .filter_map(|css| SelectorStrategy::new(css).ok())
            .map(|strategy| Box::new(strategy) as Box<dyn ExtractionStrategy>)
            .collect();
        strategies.push(Box::new(NumericScanStrategy));
        Self::new(strategies)
    }

    /// Number of strategies in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Run the chain and return the first text found.
    #[must_use]
    pub fn extract_text(&self, document: &Html) -> Option<Extraction> {
        self.strategies.iter().find_map(|strategy| {
            strategy.extract(document).map(|text| Extraction {
                strategy: strategy.name().to_string(),
                text,
            })
        })
    }

    /// Run the chain and parse the winning text.
    ///
    /// Returns `None` when no strategy matched or the text is not a positive
    /// number. Both are normal outcomes for a page that is still rendering.
    #[must_use]
    pub fn extract_price(&self, document: &Html) -> Option<Decimal> {
        let extraction = self.extract_text(document)?;
        let price = parse_price_text(&extraction.text);
        if price.is_none() {
            tracing::debug!(
                strategy = %extraction.strategy,
                text = %extraction.text,
                "Extracted text is not a price"
            );
        }
        price
    }

    /// Parse a page body and extract its price.
    #[must_use]
    pub fn extract_price_from_body(&self, body: &str) -> Option<Decimal> {
        let document = Html::parse_document(body);
        self.extract_price(&document)
    }
}

impl Default for PriceExtractor {
    fn default() -> Self {
        Self::default_chain()
    }
}

impl fmt::Debug for PriceExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}

/// Parse price text such as `"$1,234.56"`.
///
/// Thousands separators and every character outside `[0-9.]` are dropped,
/// then the longest leading `digits[.digits]` prefix is parsed. Only strictly
/// positive values are returned.
#[must_use]
pub fn parse_price_text(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut seen_dot = false;
    let end = cleaned
        .char_indices()
        .find(|&(_, c)| {
            if c == '.' {
                if seen_dot {
                    return true;
                }
                seen_dot = true;
            }
            false
        })
        .map_or(cleaned.len(), |(i, _)| i);

    let number = cleaned[..end].trim_end_matches('.');
    if !number.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }

    let number = if number.starts_with('.') {
        format!("0{number}")
    } else {
        number.to_string()
    };

    match number.parse::<Decimal>() {
        Ok(value) => (value > Decimal::ZERO).then_some(value),
        Err(e) => {
            // Runs beyond Decimal's 28 significant digits land here.
            tracing::debug!(text, number = %number, error = %e, "Unparsable price text");
            None
        }
    }
}
