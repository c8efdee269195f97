// 🧾 Receipt Models - Receipts, line items and the controlled vocabularies
// A receipt starts as raw OCR text and is enriched once the LLM output validates

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User the demo generators attach their receipts to
pub const DEMO_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Amount rounded to cents, half away from zero (`1.999` → `2.00`)
pub fn format_money(amount: Decimal) -> String {
    format!(
        "{:.2}",
        amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

// ============================================================================
// STATUS
// ============================================================================

/// Processing status of a receipt
///
/// pending → processing → processed | failed, and failed → pending on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl ReceiptStatus {
    pub const ALL: [ReceiptStatus; 4] = [
        ReceiptStatus::Pending,
        ReceiptStatus::Processing,
        ReceiptStatus::Processed,
        ReceiptStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Processing => "processing",
            ReceiptStatus::Processed => "processed",
            ReceiptStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ReceiptStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("Unknown receipt status: {}", s))
    }
}

// ============================================================================
// CATEGORY
// ============================================================================

/// Expense category assigned to each line item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Alimentation")]
    Alimentation,
    #[serde(rename = "Loisirs")]
    Loisirs,
    #[serde(rename = "Transport")]
    Transport,
    #[serde(rename = "Maison")]
    Maison,
    #[serde(rename = "Vêtements")]
    Vetements,
    #[serde(rename = "Santé")]
    Sante,
    #[serde(rename = "Factures")]
    Factures,
    #[serde(rename = "Technologie")]
    Technologie,
    #[serde(rename = "Autre")]
    Autre,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Alimentation,
        Category::Loisirs,
        Category::Transport,
        Category::Maison,
        Category::Vetements,
        Category::Sante,
        Category::Factures,
        Category::Technologie,
        Category::Autre,
    ];

    /// Stored label (also what the LLM must answer with)
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Alimentation => "Alimentation",
            Category::Loisirs => "Loisirs",
            Category::Transport => "Transport",
            Category::Maison => "Maison",
            Category::Vetements => "Vêtements",
            Category::Sante => "Santé",
            Category::Factures => "Factures",
            Category::Technologie => "Technologie",
            Category::Autre => "Autre",
        }
    }

    pub fn labels() -> Vec<&'static str> {
        Category::ALL.iter().map(|c| c.as_str()).collect()
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Autre
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == trimmed)
            .ok_or_else(|| {
                format!(
                    "Unknown category '{}', expected one of: {}",
                    trimmed,
                    Category::labels().join(", ")
                )
            })
    }
}

// ============================================================================
// RECEIPT + ITEM
// ============================================================================

/// A row of the `receipts` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Raw text extracted by OCR
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,

    pub status: ReceiptStatus,

    // Filled in once the LLM output validates
    pub merchant: Option<String>,
    pub receipt_date: Option<NaiveDate>,
    pub total_amount: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// How many times a processor claimed this receipt
    pub attempts: i64,
}

/// A row of the `items` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub receipt_id: String,
    pub name: String,
    /// Unit price
    pub price: Decimal,
    pub quantity: u32,
    pub category: Category,
}

impl Item {
    /// Saturates at `Decimal::MAX`; stored prices are bounded on ingestion
    pub fn line_total(&self) -> Decimal {
        self.price.saturating_mul(Decimal::from(self.quantity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in ReceiptStatus::ALL {
            assert_eq!(status.as_str().parse::<ReceiptStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ReceiptStatus>().is_err());
    }

    #[test]
    fn test_category_labels_keep_accents() {
        assert_eq!("Vêtements".parse::<Category>().unwrap(), Category::Vetements);
        assert_eq!(" Santé ".parse::<Category>().unwrap(), Category::Sante);
        assert!("Vetements".parse::<Category>().is_err());
        assert_eq!(Category::default(), Category::Autre);

        let json = serde_json::to_string(&Category::Sante).unwrap();
        assert_eq!(json, "\"Santé\"");
    }

    #[test]
    fn test_item_line_total() {
        let item = Item {
            id: "i1".to_string(),
            receipt_id: "r1".to_string(),
            name: "Baguette Tradition".to_string(),
            price: Decimal::new(125, 2),
            quantity: 3,
            category: Category::Alimentation,
        };
        assert_eq!(item.line_total(), Decimal::new(375, 2));
    }

    #[test]
    fn test_format_money_rounds_half_away_from_zero() {
        assert_eq!(format_money(Decimal::new(1999, 3)), "2.00");
        assert_eq!(format_money(Decimal::new(1235, 3)), "1.24");
        assert_eq!(format_money(Decimal::new(725, 2)), "7.25");
        assert_eq!(format_money(Decimal::new(7, 0)), "7.00");
    }
}
