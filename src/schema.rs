// 📐 Shape Layer - Structured output contract for the LLM
// The same shape is sent to the model as a JSON Schema and re-validated here,
// because a "strict" schema still lets through wrong sums and bad dates.

use crate::models::{format_money, Category};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub context: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>, context: &str) -> Self {
        ValidationError {
            field: field.into(),
            message: message.into(),
            context: context.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.context, self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult<T> = Result<T, Vec<ValidationError>>;

/// Flatten a list of errors into one line (stored as a receipt's failure reason)
pub fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// STRUCTURED DATA
// ============================================================================

/// A single line item extracted by the LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemData {
    pub name: String,
    pub quantity: u32,
    /// Unit price, never negative
    pub price: Decimal,
    pub category: Category,
}

impl ItemData {
    /// `None` when price × quantity does not fit in a Decimal
    pub fn line_total(&self) -> Option<Decimal> {
        self.price.checked_mul(Decimal::from(self.quantity))
    }
}

/// Validated LLM answer for one receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredReceiptData {
    pub merchant: String,
    pub receipt_date: NaiveDate,
    pub total_amount: Decimal,
    pub items: Vec<ItemData>,
}

/// Allowed gap between the item sum and the printed total
pub fn total_tolerance() -> Decimal {
    Decimal::new(2, 2)
}

/// Largest amount accepted for a total or a unit price
pub fn max_amount() -> Decimal {
    Decimal::new(1_000_000_000, 0)
}

impl StructuredReceiptData {
    /// Σ(price × quantity); `None` on overflow
    pub fn items_total(&self) -> Option<Decimal> {
        self.items
            .iter()
            .try_fold(Decimal::ZERO, |acc, item| acc.checked_add(item.line_total()?))
    }

    /// Cross-field check: Σ(price × quantity) must match the total within 0.02
    pub fn check_total_matches_items(&self) -> Result<(), ValidationError> {
        let mut calculated = Decimal::ZERO;
        for (index, item) in self.items.iter().enumerate() {
            let Some(next) = item.line_total().and_then(|line| calculated.checked_add(line)) else {
                return Err(ValidationError::new(
                    format!("items[{}].price", index),
                    "Amount out of range",
                    ITEM_CONTEXT,
                ));
            };
            calculated = next;
        }

        if (calculated - self.total_amount).abs() > total_tolerance() {
            return Err(ValidationError::new(
                "total_amount",
                format!(
                    "Sum of item totals ({}) does not match the receipt total amount ({}) within tolerance.",
                    format_money(calculated),
                    format_money(self.total_amount)
                ),
                RECEIPT_CONTEXT,
            ));
        }
        Ok(())
    }
}

// ============================================================================
// JSON SCHEMA (sent to the model)
// ============================================================================

pub const SCHEMA_NAME: &str = "structured_receipt";

/// Strict JSON Schema describing `StructuredReceiptData`
pub fn receipt_json_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "merchant": {
                "type": "string",
                "description": "The name of the merchant."
            },
            "receipt_date": {
                "type": "string",
                "description": "The date of the transaction (YYYY-MM-DD format)."
            },
            "total_amount": {
                "type": "number",
                "description": "The final total amount paid. Must be non-negative."
            },
            "items": {
                "type": "array",
                "description": "A list containing details of each item purchased.",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "The name of the item purchased."
                        },
                        "quantity": {
                            "type": "integer",
                            "description": "The quantity of the item purchased (must be 1 or more)."
                        },
                        "price": {
                            "type": "number",
                            "description": "The price for a single unit of the item. Must be non-negative."
                        },
                        "category": {
                            "type": "string",
                            "enum": Category::labels(),
                            "description": "The expense category assigned to this item."
                        }
                    },
                    "required": ["name", "quantity", "price", "category"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["merchant", "receipt_date", "total_amount", "items"],
        "additionalProperties": false
    })
}

// ============================================================================
// PARSING + VALIDATION
// ============================================================================

const RECEIPT_CONTEXT: &str = "Receipt";
const ITEM_CONTEXT: &str = "Item";

/// Convert the model's JSON answer into validated receipt data.
///
/// Every field problem is collected; the total/items cross-check only runs
/// once the individual fields are valid.
pub fn parse_structured_receipt(value: &Value) -> ValidationResult<StructuredReceiptData> {
    let Some(obj) = value.as_object() else {
        return Err(vec![ValidationError::new(
            "$",
            "Expected a JSON object",
            RECEIPT_CONTEXT,
        )]);
    };

    let mut errors = Vec::new();

    let merchant = collect(
        parse_non_empty_string(obj, "merchant", "merchant", RECEIPT_CONTEXT),
        &mut errors,
    );
    let receipt_date = collect(parse_receipt_date(obj), &mut errors);
    let total_amount = collect(
        required(obj, "total_amount", "total_amount", RECEIPT_CONTEXT)
            .and_then(|v| parse_amount(v, "total_amount", RECEIPT_CONTEXT, "Total amount")),
        &mut errors,
    );
    let items = parse_items(obj, &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }

    // All Some when no error was collected
    let (Some(merchant), Some(receipt_date), Some(total_amount), Some(items)) =
        (merchant, receipt_date, total_amount, items)
    else {
        return Err(errors);
    };

    let data = StructuredReceiptData {
        merchant,
        receipt_date,
        total_amount,
        items,
    };

    data.check_total_matches_items().map_err(|e| vec![e])?;

    Ok(data)
}

fn collect<T>(result: Result<T, ValidationError>, errors: &mut Vec<ValidationError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            errors.push(e);
            None
        }
    }
}

fn required<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    field: &str,
    context: &str,
) -> Result<&'a Value, ValidationError> {
    match obj.get(key) {
        Some(Value::Null) | None => Err(ValidationError::new(field, "Field required", context)),
        Some(value) => Ok(value),
    }
}

fn parse_non_empty_string(
    obj: &Map<String, Value>,
    key: &str,
    field: &str,
    context: &str,
) -> Result<String, ValidationError> {
    match required(obj, key, field, context)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::String(_) => Err(ValidationError::new(field, "Must not be empty", context)),
        _ => Err(ValidationError::new(field, "Expected a string", context)),
    }
}

fn parse_receipt_date(obj: &Map<String, Value>) -> Result<NaiveDate, ValidationError> {
    match required(obj, "receipt_date", "receipt_date", RECEIPT_CONTEXT)? {
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
            ValidationError::new("receipt_date", "Date must be in YYYY-MM-DD format", RECEIPT_CONTEXT)
        }),
        _ => Err(ValidationError::new(
            "receipt_date",
            "Date must be a string in YYYY-MM-DD format",
            RECEIPT_CONTEXT,
        )),
    }
}

/// Parse a money amount. Strings may carry `€`/`EUR` and a decimal comma.
pub fn parse_amount(
    value: &Value,
    field: &str,
    context: &str,
    label: &str,
) -> Result<Decimal, ValidationError> {
    let invalid = || ValidationError::new(field, format!("{} must be a valid number", label), context);

    let amount = match value {
        Value::Number(n) => decimal_from_str(&n.to_string()).ok_or_else(invalid)?,
        Value::String(s) => {
            let cleaned = s.replace('€', "").replace("EUR", "");
            let cleaned = cleaned.trim();
            let normalized = if cleaned.contains(',') && !cleaned.contains('.') {
                cleaned.replace(',', ".")
            } else {
                cleaned.to_string()
            };
            decimal_from_str(&normalized).ok_or_else(invalid)?
        }
        _ => return Err(invalid()),
    };

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(ValidationError::new(
            field,
            format!("{} must be non-negative", label),
            context,
        ));
    }

    if amount > max_amount() {
        return Err(ValidationError::new(
            field,
            format!("{} is out of range", label),
            context,
        ));
    }

    Ok(amount)
}

fn decimal_from_str(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

fn parse_quantity(value: &Value, field: &str) -> Result<u32, ValidationError> {
    let invalid = || {
        ValidationError::new(
            field,
            "Quantity must be a positive integer (1 or more)",
            ITEM_CONTEXT,
        )
    };

    let quantity: u64 = match value {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(q), _) => q,
            (None, Some(f)) if f.fract() == 0.0 && f >= 1.0 && f <= u32::MAX as f64 => f as u64,
            _ => return Err(invalid()),
        },
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if quantity == 0 {
        return Err(invalid());
    }
    u32::try_from(quantity).map_err(|_| invalid())
}

fn parse_items(obj: &Map<String, Value>, errors: &mut Vec<ValidationError>) -> Option<Vec<ItemData>> {
    let raw_items = match required(obj, "items", "items", RECEIPT_CONTEXT) {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            errors.push(ValidationError::new("items", "Expected a list", RECEIPT_CONTEXT));
            return None;
        }
        Err(e) => {
            errors.push(e);
            return None;
        }
    };

    if raw_items.is_empty() {
        errors.push(ValidationError::new(
            "items",
            "At least one item is required",
            RECEIPT_CONTEXT,
        ));
        return None;
    }

    let before = errors.len();
    let mut items = Vec::with_capacity(raw_items.len());

    for (index, raw) in raw_items.iter().enumerate() {
        let prefix = format!("items[{}]", index);
        let Some(item) = raw.as_object() else {
            errors.push(ValidationError::new(&prefix, "Expected an object", ITEM_CONTEXT));
            continue;
        };

        let name = collect(
            parse_non_empty_string(item, "name", &format!("{}.name", prefix), ITEM_CONTEXT),
            errors,
        );

        let quantity_field = format!("{}.quantity", prefix);
        let quantity = collect(
            required(item, "quantity", &quantity_field, ITEM_CONTEXT)
                .and_then(|v| parse_quantity(v, &quantity_field)),
            errors,
        );

        let price_field = format!("{}.price", prefix);
        let price = collect(
            required(item, "price", &price_field, ITEM_CONTEXT)
                .and_then(|v| parse_amount(v, &price_field, ITEM_CONTEXT, "Unit price")),
            errors,
        );

        let category_field = format!("{}.category", prefix);
        let category = collect(
            match item.get("category") {
                None | Some(Value::Null) => Ok(Category::default()),
                Some(Value::String(s)) => s
                    .parse::<Category>()
                    .map_err(|msg| ValidationError::new(&category_field, msg, ITEM_CONTEXT)),
                Some(_) => Err(ValidationError::new(
                    &category_field,
                    "Expected a string",
                    ITEM_CONTEXT,
                )),
            },
            errors,
        );

        if let (Some(name), Some(quantity), Some(price), Some(category)) =
            (name, quantity, price, category)
        {
            items.push(ItemData {
                name,
                quantity,
                price,
                category,
            });
        }
    }

    if errors.len() > before {
        None
    } else {
        Some(items)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> Value {
        json!({
            "merchant": "Carrefour",
            "receipt_date": "2024-03-15",
            "total_amount": 12.75,
            "items": [
                {"name": "Baguette Tradition", "quantity": 3, "price": 1.25, "category": "Alimentation"},
                {"name": "Lessive Ariel", "quantity": 1, "price": "9.00 €", "category": "Maison"}
            ]
        })
    }

    #[test]
    fn test_parse_valid_payload() {
        let data = parse_structured_receipt(&valid_payload()).unwrap();

        assert_eq!(data.merchant, "Carrefour");
        assert_eq!(data.receipt_date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert_eq!(data.total_amount, Decimal::new(1275, 2));
        assert_eq!(data.items.len(), 2);
        assert_eq!(data.items[1].price, Decimal::new(900, 2));
        assert_eq!(data.items[1].category, Category::Maison);
    }

    #[test]
    fn test_total_within_tolerance() {
        let mut payload = valid_payload();
        payload["total_amount"] = json!("12.77 EUR");
        assert!(parse_structured_receipt(&payload).is_ok());

        payload["total_amount"] = json!(12.78);
        let errors = parse_structured_receipt(&payload).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "total_amount");
        assert_eq!(
            errors[0].message,
            "Sum of item totals (12.75) does not match the receipt total amount (12.78) within tolerance."
        );
    }

    #[test]
    fn test_mismatch_message_rounds_to_cents() {
        let mut payload = valid_payload();
        payload["items"] = json!([{"name": "Ticket de Métro", "quantity": 1, "price": "1.999"}]);
        payload["total_amount"] = json!("5.005");

        let errors = parse_structured_receipt(&payload).unwrap_err();
        assert_eq!(
            errors[0].message,
            "Sum of item totals (2.00) does not match the receipt total amount (5.01) within tolerance."
        );
    }

    #[test]
    fn test_huge_amounts_are_rejected_not_panicking() {
        let mut payload = valid_payload();
        payload["items"] = json!([{"name": "Loyer", "quantity": 10, "price": "10000000000000000000000000000"}]);

        let errors = parse_structured_receipt(&payload).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "items[0].price");
        assert_eq!(errors[0].message, "Unit price is out of range");
    }

    #[test]
    fn test_item_sum_overflow_is_reported_on_the_item() {
        let data = StructuredReceiptData {
            merchant: "Fnac".to_string(),
            receipt_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            total_amount: Decimal::ONE,
            items: vec![
                ItemData {
                    name: "Album Musique".to_string(),
                    quantity: 1,
                    price: Decimal::ONE,
                    category: Category::Loisirs,
                },
                ItemData {
                    name: "Jeu Vidéo PS5".to_string(),
                    quantity: 10,
                    price: Decimal::MAX,
                    category: Category::Loisirs,
                },
            ],
        };

        assert_eq!(data.items_total(), None);
        let err = data.check_total_matches_items().unwrap_err();
        assert_eq!(err.field, "items[1].price");
        assert_eq!(err.message, "Amount out of range");
    }

    #[test]
    fn test_missing_category_defaults_to_autre() {
        let mut payload = valid_payload();
        payload["items"][0].as_object_mut().unwrap().remove("category");

        let data = parse_structured_receipt(&payload).unwrap();
        assert_eq!(data.items[0].category, Category::Autre);
    }

    #[test]
    fn test_collects_all_field_errors() {
        let payload = json!({
            "merchant": "   ",
            "receipt_date": "15/03/2024",
            "total_amount": -3,
            "items": [
                {"name": "", "quantity": 0, "price": "abc", "category": "Groceries"}
            ]
        });

        let errors = parse_structured_receipt(&payload).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"merchant"));
        assert!(fields.contains(&"receipt_date"));
        assert!(fields.contains(&"total_amount"));
        assert!(fields.contains(&"items[0].name"));
        assert!(fields.contains(&"items[0].quantity"));
        assert!(fields.contains(&"items[0].price"));
        assert!(fields.contains(&"items[0].category"));
    }

    #[test]
    fn test_empty_items_rejected() {
        let mut payload = valid_payload();
        payload["items"] = json!([]);

        let errors = parse_structured_receipt(&payload).unwrap_err();
        assert_eq!(errors[0].field, "items");
    }

    #[test]
    fn test_amount_parsing_variants() {
        let parse = |v: Value| parse_amount(&v, "price", ITEM_CONTEXT, "Unit price");

        assert_eq!(parse(json!("4,50 €")).unwrap(), Decimal::new(450, 2));
        assert_eq!(parse(json!(" 7.10EUR ")).unwrap(), Decimal::new(710, 2));
        assert_eq!(parse(json!(0)).unwrap(), Decimal::ZERO);
        assert!(parse(json!(true)).is_err());

        let negative = parse(json!("-1.00")).unwrap_err();
        assert_eq!(negative.message, "Unit price must be non-negative");
    }

    #[test]
    fn test_quantity_accepts_integral_values_only() {
        assert_eq!(parse_quantity(&json!(2), "q").unwrap(), 2);
        assert_eq!(parse_quantity(&json!(2.0), "q").unwrap(), 2);
        assert_eq!(parse_quantity(&json!("3"), "q").unwrap(), 3);
        assert!(parse_quantity(&json!(1.5), "q").is_err());
        assert!(parse_quantity(&json!(-1), "q").is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let errors = parse_structured_receipt(&json!(["not", "an", "object"])).unwrap_err();
        assert_eq!(errors[0].field, "$");
    }

    #[test]
    fn test_schema_lists_categories() {
        let schema = receipt_json_schema();
        let categories = schema["properties"]["items"]["items"]["properties"]["category"]["enum"]
            .as_array()
            .unwrap();

        assert_eq!(categories.len(), Category::ALL.len());
        assert!(categories.contains(&json!("Vêtements")));
        assert_eq!(schema["additionalProperties"], json!(false));
    }

    #[test]
    fn test_format_errors_joins_lines() {
        let errors = vec![
            ValidationError::new("merchant", "Field required", RECEIPT_CONTEXT),
            ValidationError::new("items", "Expected a list", RECEIPT_CONTEXT),
        ];
        assert_eq!(
            format_errors(&errors),
            "[Receipt] merchant: Field required; [Receipt] items: Expected a list"
        );
    }
}
