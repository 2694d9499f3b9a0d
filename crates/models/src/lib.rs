use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A calendar month in `YYYYMM` form.
///
/// Keys sort lexicographically, which is date order by construction, so
/// they can be used directly in ordered maps and column lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonthKey(String);

impl MonthKey {
    /// Builds a month key from an activation-month field.
    ///
    /// Ledger exports write the field as a number, sometimes with a
    /// fractional suffix ("202301.0"). Everything before the first '.'
    /// is kept and left-padded to six characters. An empty field yields
    /// no key.
    pub fn from_activation_field(raw: &str) -> Option<MonthKey> {
        let head = raw.trim().split('.').next().unwrap_or("");
        if head.is_empty() {
            return None;
        }
        Some(MonthKey(format!("{:0>6}", head)))
    }

    /// Builds a month key from a payment date in `YYYY-MM[-DD...]` form.
    ///
    /// Only the first two '-'-delimited segments are used; the month
    /// segment is left-padded to two digits ("2023-7-15" -> "202307").
    /// Fields with fewer than two segments yield no key.
    pub fn from_payment_date(raw: &str) -> Option<MonthKey> {
        let mut parts = raw.trim().split('-');
        let year = parts.next()?;
        let month = parts.next()?;
        Some(MonthKey(format!("{}{:0>2}", year, month)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized distribution-channel value: trimmed and lower-cased at
/// construction, so equality is case- and whitespace-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelValue(String);

impl ChannelValue {
    pub fn normalize(raw: &str) -> ChannelValue {
        ChannelValue(raw.trim().to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel allow-list. An empty filter matches every row.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    allowed: HashSet<ChannelValue>,
}

impl ChannelFilter {
    /// Builds a filter from user-supplied channel strings; the values
    /// are normalized so matching is case-insensitive.
    pub fn new<I, S>(channels: I) -> ChannelFilter
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ChannelFilter {
            allowed: channels
                .into_iter()
                .map(|c| ChannelValue::normalize(c.as_ref()))
                .collect(),
        }
    }

    pub fn matches(&self, channel: &ChannelValue) -> bool {
        self.allowed.is_empty() || self.allowed.contains(channel)
    }
}

/// One installment payment attributed to an invoice activation month.
/// Produced per surviving slot during a scan and folded straight into
/// the accumulator; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub activation_month: MonthKey,
    pub payment_month: MonthKey,
    pub amount: f64,
}

/// A structural failure attached to one input source. Row- and
/// slot-level data problems are tolerated silently and never appear
/// here.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

/// One rendered report row: an activation month, its per-payment-month
/// sums (dense over the table's column set, rounded to 2 decimals) and
/// the row total.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub act_month: MonthKey,
    pub cells: Vec<f64>,
    pub total: f64,
}

/// The rendered pivot report: every observed payment month as a column
/// (ascending), one row per activation month (ascending), every cell
/// populated. `rows[i].cells` is aligned with `payment_months`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportTable {
    pub payment_months: Vec<MonthKey>,
    pub rows: Vec<ReportRow>,
}

impl ReportTable {
    pub const ACT_MONTH_COLUMN: &'static str = "Act_Month";
    pub const TOTAL_COLUMN: &'static str = "Total";

    /// Full ordered column list: `Act_Month`, payment months, `Total`.
    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::with_capacity(self.payment_months.len() + 2);
        cols.push(Self::ACT_MONTH_COLUMN.to_string());
        cols.extend(self.payment_months.iter().map(|m| m.to_string()));
        cols.push(Self::TOTAL_COLUMN.to_string());
        cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
