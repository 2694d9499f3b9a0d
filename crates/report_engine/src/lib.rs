use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use models::{LedgerEntry, MonthKey, ReportRow, ReportTable};

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Running sums keyed by (activation month, payment month), plus the
/// set of every payment month ever inserted. Ordered maps make the
/// read-back sorted without a separate sort pass.
///
/// Folding is commutative and associative: the final state does not
/// depend on the order entries or sources arrive in.
#[derive(Debug, Default)]
pub struct Accumulator {
    sums: BTreeMap<MonthKey, BTreeMap<MonthKey, f64>>,
    payment_months: BTreeSet<MonthKey>,
}

impl Accumulator {
    pub fn new() -> Accumulator {
        Accumulator::default()
    }

    /// Adds one entry's amount into its (activation, payment) cell,
    /// initializing to zero on first touch. Entries carry non-zero
    /// amounts at insertion time, but sums may cancel back to zero.
    pub fn add(&mut self, entry: &LedgerEntry) {
        self.payment_months.insert(entry.payment_month.clone());
        *self
            .sums
            .entry(entry.activation_month.clone())
            .or_default()
            .entry(entry.payment_month.clone())
            .or_insert(0.0) += entry.amount;
    }

    pub fn extend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = LedgerEntry>,
    {
        for entry in entries {
            self.add(&entry);
        }
    }

    /// Folds another accumulator in; used when sources are scanned
    /// independently.
    pub fn merge(&mut self, other: Accumulator) {
        self.payment_months.extend(other.payment_months);
        for (act, cells) in other.sums {
            let row = self.sums.entry(act).or_default();
            for (pm, sum) in cells {
                *row.entry(pm).or_insert(0.0) += sum;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Renders the dense pivot table: one row per activation month
    /// (ascending), one column per observed payment month (ascending),
    /// every cell populated (0.00 when no entry exists).
    ///
    /// Cells are rounded to 2 decimals for display; each row's `Total`
    /// sums the unrounded cell values first and rounds once, so it
    /// matches re-summing the rounded cells to within a cent.
    pub fn render(&self) -> ReportTable {
        let payment_months: Vec<MonthKey> = self.payment_months.iter().cloned().collect();

        let rows = self
            .sums
            .iter()
            .map(|(act_month, cells)| {
                let mut total = 0.0;
                let dense: Vec<f64> = payment_months
                    .iter()
                    .map(|pm| {
                        let sum = cells.get(pm).copied().unwrap_or(0.0);
                        total += sum;
                        round2(sum)
                    })
                    .collect();
                ReportRow {
                    act_month: act_month.clone(),
                    cells: dense,
                    total: round2(total),
                }
            })
            .collect();

        ReportTable {
            payment_months,
            rows,
        }
    }
}

/// Writes the table as delimited text with the stable column order,
/// amounts formatted to 2 decimal places.
pub fn write_csv<W: Write>(table: &ReportTable, writer: W) -> Result<()> {
    let mut w = csv::Writer::from_writer(writer);
    w.write_record(table.columns())
        .context("Writing report header")?;
    for row in &table.rows {
        let mut record = Vec::with_capacity(table.payment_months.len() + 2);
        record.push(row.act_month.to_string());
        record.extend(row.cells.iter().map(|c| format!("{c:.2}")));
        record.push(format!("{:.2}", row.total));
        w.write_record(&record).context("Writing report row")?;
    }
    w.flush().context("Flushing report")?;
    Ok(())
}

/// The table as an array of JSON objects, one per row, with fields in
/// column order (`Act_Month`, payment months, `Total`).
pub fn table_to_json_rows(table: &ReportTable) -> Vec<Value> {
    table
        .rows
        .iter()
        .map(|row| {
            let mut obj = Map::new();
            obj.insert(
                ReportTable::ACT_MONTH_COLUMN.to_string(),
                Value::String(row.act_month.to_string()),
            );
            for (pm, cell) in table.payment_months.iter().zip(&row.cells) {
                obj.insert(pm.to_string(), json_number(*cell));
            }
            obj.insert(ReportTable::TOTAL_COLUMN.to_string(), json_number(row.total));
            Value::Object(obj)
        })
        .collect()
}

fn json_number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_scanner::{scan_batch, ChannelClassifier};
    use models::ChannelFilter;

    fn entry(act: &str, pay: &str, amount: f64) -> LedgerEntry {
        LedgerEntry {
            activation_month: MonthKey::from_activation_field(act).unwrap(),
            payment_month: MonthKey::from_payment_date(pay).unwrap(),
            amount,
        }
    }

    #[test]
    fn test_fold_is_order_independent() {
        let entries = vec![
            entry("202301", "2023-02-01", 10.0),
            entry("202301", "2023-03-01", 20.0),
            entry("202302", "2023-03-01", 5.0),
            entry("202301", "2023-02-01", 2.5),
        ];

        let mut forward = Accumulator::new();
        forward.extend(entries.clone());
        let mut reversed = Accumulator::new();
        reversed.extend(entries.into_iter().rev());

        let a = forward.render();
        let b = reversed.render();
        assert_eq!(a.payment_months, b.payment_months);
        assert_eq!(a.rows.len(), b.rows.len());
        for (ra, rb) in a.rows.iter().zip(&b.rows) {
            assert_eq!(ra.act_month, rb.act_month);
            assert_eq!(ra.cells, rb.cells);
            assert_eq!(ra.total, rb.total);
        }
    }

    #[test]
    fn test_merge_matches_single_fold() {
        let mut left = Accumulator::new();
        left.extend(vec![entry("202301", "2023-02-01", 10.0)]);
        let mut right = Accumulator::new();
        right.extend(vec![
            entry("202301", "2023-02-01", 5.0),
            entry("202302", "2023-04-01", 7.0),
        ]);
        left.merge(right);

        let mut whole = Accumulator::new();
        whole.extend(vec![
            entry("202301", "2023-02-01", 10.0),
            entry("202301", "2023-02-01", 5.0),
            entry("202302", "2023-04-01", 7.0),
        ]);

        assert_eq!(left.render().rows[0].cells, whole.render().rows[0].cells);
        assert_eq!(left.render().rows[1].total, whole.render().rows[1].total);
    }

    #[test]
    fn test_render_is_dense_across_payment_months() {
        let mut acc = Accumulator::new();
        acc.extend(vec![
            entry("202301", "2023-05-01", 10.0),
            entry("202302", "2023-06-01", 20.0),
        ]);
        let table = acc.render();

        assert_eq!(table.columns(), vec!["Act_Month", "202305", "202306", "Total"]);
        // 202301 never saw a 202306 payment; the cell is still there.
        assert_eq!(table.rows[0].cells, vec![10.0, 0.0]);
        assert_eq!(table.rows[1].cells, vec![0.0, 20.0]);
    }

    #[test]
    fn test_row_totals_match_cell_sums_after_rounding() {
        let mut acc = Accumulator::new();
        acc.extend(vec![
            entry("202301", "2023-02-01", 10.004),
            entry("202301", "2023-03-01", 20.004),
            entry("202301", "2023-04-01", 0.011),
        ]);
        let table = acc.render();

        for row in &table.rows {
            let resummed: f64 = row.cells.iter().sum();
            assert!(
                (row.total - resummed).abs() <= 0.01,
                "total {} vs resummed {}",
                row.total,
                resummed
            );
        }
    }

    #[test]
    fn test_cancelled_sums_render_as_zero_cells() {
        let mut acc = Accumulator::new();
        acc.extend(vec![
            entry("202301", "2023-02-01", 75.0),
            entry("202301", "2023-02-01", -75.0),
        ]);
        let table = acc.render();
        // The cell was touched, so the row and column survive at 0.00.
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].cells, vec![0.0]);
        assert_eq!(table.rows[0].total, 0.0);
    }

    #[test]
    fn test_empty_accumulator_renders_no_data() {
        let acc = Accumulator::new();
        let table = acc.render();
        assert!(acc.is_empty());
        assert!(table.is_empty());
        assert_eq!(table.columns(), vec!["Act_Month", "Total"]);
    }

    #[test]
    fn test_csv_export_formats_two_decimals() {
        let mut acc = Accumulator::new();
        acc.extend(vec![entry("202301", "2023-02-01", 100.0)]);
        let mut out = Vec::new();
        write_csv(&acc.render(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Act_Month,202302,Total\n202301,100.00,100.00\n");
    }

    #[test]
    fn test_json_rows_follow_column_order() {
        let mut acc = Accumulator::new();
        acc.extend(vec![
            entry("202301", "2023-02-01", 100.0),
            entry("202301", "2023-03-01", 50.0),
        ]);
        let rows = table_to_json_rows(&acc.render());
        assert_eq!(rows.len(), 1);
        let keys: Vec<&String> = rows[0].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["Act_Month", "202302", "202303", "Total"]);
        assert_eq!(rows[0]["Total"], 150.0);
    }

    #[test]
    fn test_two_sources_with_different_channel_spellings() {
        let source_a = "Channel,Act_Month,InvAmt_M1,PaymentDt_Inv1\n\
                        Web,202301,100.00,2023-02-10\n";
        let source_b = "channel_name,Act_Month,InvAmt_M1,PaymentDt_Inv1\n\
                        Retail,202301,50,2023-02-01\n";
        let sources = vec![("a.csv", source_a.as_bytes()), ("b.csv", source_b.as_bytes())];

        let batch = scan_batch(
            sources,
            &ChannelClassifier::default(),
            &ChannelFilter::new(["web"]),
        );
        assert!(batch.failures.is_empty());

        let mut acc = Accumulator::new();
        acc.extend(batch.entries);
        let table = acc.render();

        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].act_month.as_str(), "202301");
        assert_eq!(table.columns(), vec!["Act_Month", "202302", "Total"]);
        assert_eq!(table.rows[0].cells, vec![100.0]);
        assert_eq!(table.rows[0].total, 100.0);
    }

    #[test]
    fn test_all_zero_ledger_yields_no_data() {
        let source = "Channel,Act_Month,InvAmt_M1,PaymentDt_Inv1\n\
                      Web,202301,0,2023-02-10\n\
                      Web,202302,0.0,2023-03-10\n";
        let batch = scan_batch(
            vec![("zeros.csv", source.as_bytes())],
            &ChannelClassifier::default(),
            &ChannelFilter::default(),
        );
        let mut acc = Accumulator::new();
        acc.extend(batch.entries);
        assert!(acc.is_empty());
        assert!(acc.render().is_empty());
    }
}
