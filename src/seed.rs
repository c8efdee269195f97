// 🌱 Demo data - clean processed receipts and simulated OCR text
// Clean receipts are consistent: the total is always the sum of the items.

use crate::db::{self, NewItem, NewProcessedReceipt, SubmitOutcome};
use crate::models::{Category, DEMO_USER_ID};
use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use rand::Rng;
use rusqlite::Connection;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::info;

const ACTOR: &str = "seed";

const ITEMS_BY_CATEGORY: &[(Category, &[&str])] = &[
    (
        Category::Alimentation,
        &[
            "Baguette Tradition",
            "Lait UHT 1L",
            "Camembert Président",
            "Jambon Blanc Herta",
            "Pâtes Barilla",
            "Tomates Grappe",
            "Eau Evian 1.5L",
        ],
    ),
    (
        Category::Loisirs,
        &["Livre 'Dune'", "Jeu de société", "Place de cinéma UGC", "Album Musique", "Jeu Vidéo PS5"],
    ),
    (
        Category::Transport,
        &["Ticket de Métro", "Plein Essence SP98", "Billet de train SNCF", "Recharge Navigo"],
    ),
    (
        Category::Maison,
        &["Liquide Vaisselle", "Éponges Spontex", "Lessive Ariel", "Sacs Poubelle", "Ampoule LED"],
    ),
    (
        Category::Vetements,
        &["T-shirt en coton", "Jean Levis 501", "Chaussettes", "Pull en laine", "Baskets Adidas"],
    ),
    (
        Category::Sante,
        &["Boîte de Paracétamol", "Pansements", "Dentifrice Signal", "Bain de bouche"],
    ),
    (
        Category::Factures,
        &["Facture EDF", "Facture Internet Free", "Facture téléphone Orange", "Loyer"],
    ),
];

const MERCHANTS: &[&str] = &[
    "Carrefour",
    "Fnac",
    "Leclerc",
    "Amazon.fr",
    "Boulangerie",
    "TotalEnergies",
    "Pharmacie",
    "SNCF",
];

const STREETS: &[&str] = &[
    "12 rue de la République",
    "4 avenue Jean Jaurès",
    "87 boulevard Victor Hugo",
    "3 place du Marché",
];

const TOWNS: &[(&str, &str)] = &[
    ("69002", "LYON"),
    ("33000", "BORDEAUX"),
    ("44000", "NANTES"),
    ("31000", "TOULOUSE"),
];

const SEPARATOR: &str = "--------------------------------------";

/// Receipt layouts for simulated OCR text
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Template {
    Supermarket,
    GasStation,
    GenericStore,
}

impl Template {
    const ALL: [Template; 3] = [Template::Supermarket, Template::GasStation, Template::GenericStore];

    fn merchants(&self) -> &'static [&'static str] {
        match self {
            Template::Supermarket => &["Carrefour", "Leclerc", "Auchan"],
            Template::GasStation => &["TotalEnergies", "Esso"],
            Template::GenericStore => &["Fnac", "Pharmacie", "Boulangerie", "SNCF"],
        }
    }

    fn categories(&self) -> &'static [Category] {
        match self {
            Template::Supermarket => &[Category::Alimentation, Category::Maison, Category::Sante],
            Template::GasStation => &[Category::Transport],
            Template::GenericStore => &[
                Category::Loisirs,
                Category::Sante,
                Category::Alimentation,
                Category::Transport,
            ],
        }
    }
}

fn pick<'a, T, R: Rng + ?Sized>(rng: &mut R, choices: &'a [T]) -> &'a T {
    &choices[rng.gen_range(0..choices.len())]
}

fn item_names(category: Category) -> &'static [&'static str] {
    ITEMS_BY_CATEGORY
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, names)| *names)
        .unwrap_or(&["Article divers"])
}

fn random_price<R: Rng + ?Sized>(rng: &mut R, min_cents: i64, max_cents: i64) -> Decimal {
    Decimal::new(rng.gen_range(min_cents..=max_cents), 2)
}

// ============================================================================
// CLEAN DATA
// ============================================================================

/// Build one processed receipt dated within the year before `today`
pub fn generate_clean_receipt<R: Rng + ?Sized>(rng: &mut R, today: NaiveDate) -> NewProcessedReceipt {
    let item_count = rng.gen_range(2..=8);
    let items: Vec<NewItem> = (0..item_count)
        .map(|_| {
            let (category, names) = *pick(rng, ITEMS_BY_CATEGORY);
            NewItem {
                name: pick(rng, names).to_string(),
                price: random_price(rng, 50, 5000),
                quantity: rng.gen_range(1..=5),
                category,
            }
        })
        .collect();

    let total_amount = items
        .iter()
        .map(|item| item.price * Decimal::from(item.quantity))
        .sum();

    NewProcessedReceipt {
        user_id: DEMO_USER_ID.to_string(),
        merchant: pick(rng, MERCHANTS).to_string(),
        receipt_date: today - Duration::days(rng.gen_range(0..=365)),
        total_amount,
        items,
    }
}

/// Insert `count` clean processed receipts, returning their ids
pub fn generate_clean_data<R: Rng + ?Sized>(
    conn: &Connection,
    count: usize,
    rng: &mut R,
    today: NaiveDate,
) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let receipt = generate_clean_receipt(rng, today);
        let id = db::insert_processed_receipt(conn, &receipt, ACTOR)?;
        info!(
            receipt_id = %id,
            merchant = %receipt.merchant,
            items = receipt.items.len(),
            "clean receipt created"
        );
        ids.push(id);
    }
    Ok(ids)
}

// ============================================================================
// SIMULATED OCR
// ============================================================================

/// French-style receipt text as an OCR engine would return it
pub fn generate_receipt_text<R: Rng + ?Sized>(rng: &mut R, today: NaiveDate) -> String {
    let template = *pick(rng, &Template::ALL);
    render_receipt_text(rng, template, today)
}

pub fn render_receipt_text<R: Rng + ?Sized>(rng: &mut R, template: Template, today: NaiveDate) -> String {
    let merchant = *pick(rng, template.merchants());

    // Some day this year, up to today
    let date = today - Duration::days(rng.gen_range(0..today.ordinal0() as i64 + 1));
    let time = format!(
        "{:02}:{:02}:{:02}",
        rng.gen_range(7..22),
        rng.gen_range(0..60),
        rng.gen_range(0..60)
    );

    let mut total = Decimal::ZERO;
    let mut item_lines = String::new();
    for _ in 0..rng.gen_range(2..=5) {
        let category = *pick(rng, template.categories());
        let name = *pick(rng, item_names(category));
        let quantity: u32 = rng.gen_range(1..=3);
        let line_total = random_price(rng, 150, 4500) * Decimal::from(quantity);
        total += line_total;

        let item_line = format!("{} x {:<20}", quantity, name);
        item_lines.push_str(&format!("{:<25} {:.2} EUR\n", item_line, line_total));
    }

    let vat = (total * Decimal::new(20, 2)).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    let mut text = format!("{}\n", merchant.to_uppercase());
    if template == Template::Supermarket {
        let (postcode, town) = *pick(rng, TOWNS);
        text.push_str(&format!("{}\n{} {}\n", pick(rng, STREETS), postcode, town));
    }

    text.push_str(&format!("\nDate: {}   Heure: {}\n", date.format("%d/%m/%Y"), time));
    text.push_str(SEPARATOR);
    text.push('\n');
    text.push_str(&item_lines);
    text.push_str(SEPARATOR);
    text.push('\n');

    if template != Template::GasStation {
        text.push_str(&format!("SOUS-TOTAL                 {:.2} EUR\n", total));
        text.push_str(&format!("DONT TVA (20%)             {:.2} EUR\n", vat));
    }

    text.push_str(&format!("TOTAL A PAYER              {:.2} EUR\n\n", total));
    text.push_str("MERCI DE VOTRE VISITE\n");
    text
}

/// Insert `count` simulated OCR texts as pending receipts for the demo user
pub fn simulate_ocr_insertion<R: Rng + ?Sized>(
    conn: &Connection,
    count: usize,
    rng: &mut R,
    today: NaiveDate,
) -> Result<Vec<SubmitOutcome>> {
    let mut outcomes = Vec::with_capacity(count);
    for _ in 0..count {
        let text = generate_receipt_text(rng, today);
        let outcome = db::submit_receipt(conn, DEMO_USER_ID, &text, ACTOR)?;
        if let SubmitOutcome::Created(receipt) = &outcome {
            info!(receipt_id = %receipt.id, "raw receipt inserted");
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReceiptStatus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_clean_receipt_is_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let receipt = generate_clean_receipt(&mut rng, today());

            assert!((2..=8).contains(&receipt.items.len()));
            assert!(MERCHANTS.contains(&receipt.merchant.as_str()));
            assert!(receipt.receipt_date <= today());
            assert!(receipt.receipt_date >= today() - Duration::days(365));

            let sum: Decimal = receipt
                .items
                .iter()
                .map(|i| i.price * Decimal::from(i.quantity))
                .sum();
            assert_eq!(sum, receipt.total_amount);

            for item in &receipt.items {
                assert!(item_names(item.category).contains(&item.name.as_str()));
                assert!((1..=5).contains(&item.quantity));
            }
        }
    }

    #[test]
    fn test_generate_clean_data_inserts_processed_receipts() {
        let conn = setup();
        let mut rng = StdRng::seed_from_u64(1);

        let ids = generate_clean_data(&conn, 4, &mut rng, today()).unwrap();
        assert_eq!(ids.len(), 4);

        let processed = db::get_receipts_by_status(&conn, ReceiptStatus::Processed).unwrap();
        assert_eq!(processed.len(), 4);
        for receipt in processed {
            let items = db::get_items_for_receipt(&conn, &receipt.id).unwrap();
            let sum: Decimal = items.iter().map(|i| i.line_total()).sum();
            assert_eq!(Some(sum), receipt.total_amount);
        }
    }

    #[test]
    fn test_receipt_text_layout() {
        let mut rng = StdRng::seed_from_u64(3);

        let text = render_receipt_text(&mut rng, Template::Supermarket, today());
        assert!(text.contains("Date: "));
        assert!(text.contains("Heure: "));
        assert!(text.contains("SOUS-TOTAL"));
        assert!(text.contains("DONT TVA (20%)"));
        assert!(text.contains("TOTAL A PAYER"));
        assert!(text.ends_with("MERCI DE VOTRE VISITE\n"));
        assert!(text.contains(" EUR\n"));
        let first_line = text.lines().next().unwrap();
        assert_eq!(first_line, first_line.to_uppercase());

        let gas = render_receipt_text(&mut rng, Template::GasStation, today());
        assert!(!gas.contains("SOUS-TOTAL"));
        assert!(gas.contains("TOTAL A PAYER"));
    }

    #[test]
    fn test_simulate_ocr_insertion_creates_pending_receipts() {
        let conn = setup();
        let mut rng = StdRng::seed_from_u64(11);

        let outcomes = simulate_ocr_insertion(&conn, 3, &mut rng, today()).unwrap();
        assert_eq!(outcomes.len(), 3);

        let pending = db::get_receipts_by_status(&conn, ReceiptStatus::Pending).unwrap();
        assert_eq!(pending.len(), 3);
        for receipt in pending {
            assert_eq!(receipt.user_id, DEMO_USER_ID);
            assert!(receipt.extracted_text.unwrap().contains("TOTAL A PAYER"));
        }
    }
}
