// 📊 Spending Analytics - the numbers behind the dashboard
// Works on items joined with their receipt (`AnalysisRow`). Money stays Decimal;
// averages are rounded to cents and percentages to one decimal.
//
// Grouping uses BTreeMaps so ties always resolve to the alphabetically first key.

use crate::db::AnalysisRow;
use crate::models::{format_money, Category};
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// FILTER
// ============================================================================

/// Dashboard filter. `None` means "everything"; an empty list matches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub categories: Option<Vec<Category>>,
    pub merchants: Option<Vec<String>>,
}

impl Filter {
    /// Rows without a receipt date never match
    pub fn matches(&self, row: &AnalysisRow) -> bool {
        let Some(date) = row.receipt_date else {
            return false;
        };

        if self.start_date.is_some_and(|start| date < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| date > end) {
            return false;
        }

        if let Some(categories) = &self.categories {
            if !categories.contains(&row.category) {
                return false;
            }
        }

        if let Some(merchants) = &self.merchants {
            match &row.merchant {
                Some(merchant) if merchants.iter().any(|m| m == merchant) => {}
                _ => return false,
            }
        }

        true
    }

    pub fn apply(&self, rows: &[AnalysisRow]) -> Vec<AnalysisRow> {
        rows.iter().filter(|row| self.matches(row)).cloned().collect()
    }
}

/// Values available for filtering (the sidebar defaults)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterOptions {
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
    pub categories: Vec<Category>,
    pub merchants: Vec<String>,
}

pub fn filter_options(rows: &[AnalysisRow]) -> FilterOptions {
    let dates: Vec<NaiveDate> = rows.iter().filter_map(|r| r.receipt_date).collect();
    let categories: BTreeMap<&str, Category> = rows
        .iter()
        .map(|r| (r.category.as_str(), r.category))
        .collect();
    let merchants: BTreeSet<String> = rows.iter().filter_map(|r| r.merchant.clone()).collect();

    FilterOptions {
        min_date: dates.iter().min().copied(),
        max_date: dates.iter().max().copied(),
        categories: categories.into_values().collect(),
        merchants: merchants.into_iter().collect(),
    }
}

// ============================================================================
// KPIs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpis {
    pub total_spend: Decimal,
    pub receipt_count: usize,
    pub average_per_receipt: Decimal,
    pub top_category: Option<Category>,
}

pub fn kpis(rows: &[AnalysisRow]) -> Kpis {
    let total_spend: Decimal = rows.iter().map(|r| r.total_price).sum();
    let receipt_count = rows
        .iter()
        .map(|r| r.receipt_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    let average_per_receipt = if receipt_count > 0 {
        (total_spend / Decimal::from(receipt_count)).round_dp(2)
    } else {
        Decimal::ZERO
    };

    let top_category = spending_by_category(rows)
        .into_iter()
        .fold(None, |best: Option<CategorySpend>, current| match best {
            Some(b) if b.total >= current.total => Some(b),
            _ => Some(current),
        })
        .map(|c| c.category);

    Kpis {
        total_spend,
        receipt_count,
        average_per_receipt,
        top_category,
    }
}

// ============================================================================
// BREAKDOWNS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySpend {
    pub category: Category,
    pub total: Decimal,
}

/// Spend per category, ordered by label
pub fn spending_by_category(rows: &[AnalysisRow]) -> Vec<CategorySpend> {
    let mut totals: BTreeMap<&str, (Category, Decimal)> = BTreeMap::new();
    for row in rows {
        let entry = totals
            .entry(row.category.as_str())
            .or_insert((row.category, Decimal::ZERO));
        entry.1 += row.total_price;
    }

    totals
        .into_values()
        .map(|(category, total)| CategorySpend { category, total })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySpend {
    pub date: NaiveDate,
    pub total: Decimal,
}

/// Spend per day, oldest first
pub fn daily_spending(rows: &[AnalysisRow]) -> Vec<DailySpend> {
    let mut totals: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    for row in rows {
        if let Some(date) = row.receipt_date {
            *totals.entry(date).or_insert(Decimal::ZERO) += row.total_price;
        }
    }

    totals
        .into_iter()
        .map(|(date, total)| DailySpend { date, total })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MerchantStat {
    pub merchant: String,
    pub average_receipt: Decimal,
    pub dominant_category: Category,
}

/// Average receipt and dominant category per merchant, highest average first
pub fn merchant_stats(rows: &[AnalysisRow]) -> Vec<MerchantStat> {
    // merchant -> receipt -> total
    let mut receipt_totals: BTreeMap<&str, BTreeMap<&str, Decimal>> = BTreeMap::new();
    // merchant -> category label -> (category, total)
    let mut category_totals: BTreeMap<&str, BTreeMap<&str, (Category, Decimal)>> = BTreeMap::new();

    for row in rows {
        let Some(merchant) = row.merchant.as_deref() else {
            continue;
        };

        *receipt_totals
            .entry(merchant)
            .or_default()
            .entry(row.receipt_id.as_str())
            .or_insert(Decimal::ZERO) += row.total_price;

        category_totals
            .entry(merchant)
            .or_default()
            .entry(row.category.as_str())
            .or_insert((row.category, Decimal::ZERO))
            .1 += row.total_price;
    }

    let mut stats: Vec<MerchantStat> = receipt_totals
        .into_iter()
        .map(|(merchant, receipts)| {
            let sum: Decimal = receipts.values().copied().sum();
            let average_receipt = (sum / Decimal::from(receipts.len())).round_dp(2);

            let dominant_category = category_totals
                .get(merchant)
                .and_then(|categories| {
                    categories
                        .values()
                        .fold(None, |best: Option<(Category, Decimal)>, &(category, total)| match best {
                            Some(b) if b.1 >= total => Some(b),
                            _ => Some((category, total)),
                        })
                })
                .map(|(category, _)| category)
                .unwrap_or_default();

            MerchantStat {
                merchant: merchant.to_string(),
                average_receipt,
                dominant_category,
            }
        })
        .collect();

    // Stable: equal averages keep merchant order
    stats.sort_by(|a, b| b.average_receipt.cmp(&a.average_receipt));
    stats
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptSummary {
    pub receipt_id: String,
    pub receipt_date: NaiveDate,
    pub merchant: String,
    pub total: Decimal,
    /// e.g. `2024-06-03 - Carrefour (7.25€)`
    pub label: String,
}

/// One line per receipt, newest first
pub fn receipt_summaries(rows: &[AnalysisRow]) -> Vec<ReceiptSummary> {
    let mut totals: BTreeMap<(NaiveDate, &str, &str), Decimal> = BTreeMap::new();
    for row in rows {
        if let (Some(date), Some(merchant)) = (row.receipt_date, row.merchant.as_deref()) {
            *totals
                .entry((date, row.receipt_id.as_str(), merchant))
                .or_insert(Decimal::ZERO) += row.total_price;
        }
    }

    totals
        .into_iter()
        .rev()
        .map(|((date, receipt_id, merchant), total)| ReceiptSummary {
            receipt_id: receipt_id.to_string(),
            receipt_date: date,
            merchant: merchant.to_string(),
            total,
            label: format!("{} - {} ({}€)", date.format("%Y-%m-%d"), merchant, format_money(total)),
        })
        .collect()
}

// ============================================================================
// MONTHLY ANALYSIS (ignores the dashboard filter)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySpend {
    /// `YYYY-MM`
    pub month: String,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyAnalysis {
    pub current_month: String,
    pub current_month_spend: Decimal,
    pub previous_month: String,
    pub previous_month_spend: Decimal,
    /// Mean over months strictly before the current one that have data
    pub average_monthly_spend: Decimal,
    pub delta_vs_previous: Decimal,
    pub delta_vs_previous_pct: Option<Decimal>,
    pub delta_vs_average: Decimal,
    pub delta_vs_average_pct: Option<Decimal>,
    /// Newest first
    pub history: Vec<MonthlySpend>,
}

type YearMonth = (i32, u32);

fn month_key(date: NaiveDate) -> YearMonth {
    (date.year(), date.month())
}

fn previous_month((year, month): YearMonth) -> YearMonth {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn format_month((year, month): YearMonth) -> String {
    format!("{:04}-{:02}", year, month)
}

fn percent_change(delta: Decimal, base: Decimal) -> Option<Decimal> {
    if base > Decimal::ZERO {
        Some((delta / base * Decimal::ONE_HUNDRED).round_dp(1))
    } else {
        None
    }
}

pub fn monthly_analysis(rows: &[AnalysisRow], today: NaiveDate) -> MonthlyAnalysis {
    let mut by_month: BTreeMap<YearMonth, Decimal> = BTreeMap::new();
    for row in rows {
        if let Some(date) = row.receipt_date {
            *by_month.entry(month_key(date)).or_insert(Decimal::ZERO) += row.total_price;
        }
    }

    let current = month_key(today);
    let previous = previous_month(current);

    let current_month_spend = by_month.get(&current).copied().unwrap_or(Decimal::ZERO);
    let previous_month_spend = by_month.get(&previous).copied().unwrap_or(Decimal::ZERO);

    let historical: Vec<Decimal> = by_month.range(..current).map(|(_, total)| *total).collect();
    let average_monthly_spend = if historical.is_empty() {
        Decimal::ZERO
    } else {
        (historical.iter().copied().sum::<Decimal>() / Decimal::from(historical.len())).round_dp(2)
    };

    let delta_vs_previous = current_month_spend - previous_month_spend;
    let delta_vs_average = current_month_spend - average_monthly_spend;

    MonthlyAnalysis {
        current_month: format_month(current),
        current_month_spend,
        previous_month: format_month(previous),
        previous_month_spend,
        average_monthly_spend,
        delta_vs_previous,
        delta_vs_previous_pct: percent_change(delta_vs_previous, previous_month_spend),
        delta_vs_average,
        delta_vs_average_pct: percent_change(delta_vs_average, average_monthly_spend),
        history: by_month
            .into_iter()
            .rev()
            .map(|(month, total)| MonthlySpend {
                month: format_month(month),
                total,
            })
            .collect(),
    }
}

// ============================================================================
// DASHBOARD
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub filter: Filter,
    pub available: FilterOptions,
    pub kpis: Kpis,
    pub by_category: Vec<CategorySpend>,
    pub daily: Vec<DailySpend>,
    pub merchants: Vec<MerchantStat>,
    pub receipts: Vec<ReceiptSummary>,
}

/// Everything the dashboard shows for one filter
pub fn build_dashboard(rows: &[AnalysisRow], filter: Filter) -> Dashboard {
    let filtered = filter.apply(rows);

    Dashboard {
        available: filter_options(rows),
        kpis: kpis(&filtered),
        by_category: spending_by_category(&filtered),
        daily: daily_spending(&filtered),
        merchants: merchant_stats(&filtered),
        receipts: receipt_summaries(&filtered),
        filter,
    }
}

// ============================================================================
// TESTS
// ============================================================================
