use csv::StringRecord;
use encoding_rs::WINDOWS_1252;
use std::collections::BTreeSet;
use thiserror::Error;

use models::{ChannelFilter, ChannelValue, LedgerEntry, MonthKey, SourceFailure};

/// Accepted spellings of the channel column, in priority order. The
/// first candidate present in a header row wins.
pub const CHANNEL_HEADER_CANDIDATES: [&str; 5] =
    ["Channel", "channel", "CHANNEL", "Channel_Name", "channel_name"];

/// Column holding the invoice activation month.
pub const ACT_MONTH_HEADER: &str = "Act_Month";

/// The four installment slots: (amount column, payment-date column).
/// The arity is fixed by the ledger export format.
pub const PAYMENT_SLOTS: [(&str, &str); 4] = [
    ("InvAmt_M1", "PaymentDt_Inv1"),
    ("InvAmt_M2", "PaymentDt_Inv2"),
    ("InvAmt_M3", "PaymentDt_Inv3"),
    ("InvAmt_M4", "PaymentDt_Inv4"),
];

/// Structural failure of one source. Row- and slot-level data problems
/// never surface here; they are tolerated so a dirty ledger still
/// produces a partial report.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No headers found")]
    NoHeaders,
    #[error("Missing \"Channel\" column")]
    MissingChannelColumn,
    #[error("CSV read error: {0}")]
    Csv(#[from] csv::Error),
}

/// Locates the channel column among header-name variants and
/// normalizes per-row channel values.
#[derive(Debug, Clone)]
pub struct ChannelClassifier {
    candidates: Vec<String>,
}

impl Default for ChannelClassifier {
    fn default() -> Self {
        Self::new(CHANNEL_HEADER_CANDIDATES)
    }
}

impl ChannelClassifier {
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the index of the channel column, trying candidates in
    /// priority order. `None` is a classifiable outcome, not an error.
    pub fn find_channel_column(&self, headers: &StringRecord) -> Option<usize> {
        self.candidates
            .iter()
            .find_map(|name| headers.iter().position(|h| h == name))
    }

    /// Normalized channel value of one row; a missing field maps to
    /// the empty channel.
    pub fn channel_of(&self, record: &StringRecord, channel_idx: usize) -> ChannelValue {
        ChannelValue::normalize(record.get(channel_idx).unwrap_or(""))
    }
}

/// Everything one batch scan produces: the folded-ready entry stream
/// plus the per-source structural failures.
#[derive(Debug, Default)]
pub struct ScanBatch {
    pub entries: Vec<LedgerEntry>,
    pub failures: Vec<SourceFailure>,
}

/// Distinct channel values observed across a batch, with per-source
/// failures for sources that could not contribute any.
#[derive(Debug, Default)]
pub struct ChannelDiscovery {
    pub channels: Vec<ChannelValue>,
    pub failures: Vec<SourceFailure>,
}

/// Decodes raw source bytes to text: strict UTF-8 when valid,
/// otherwise Latin-1 lossily. Confidence-scored charset sniffing is
/// the caller's concern; this is the low-confidence fallback contract.
pub fn decode_text_lossy(buf: &[u8]) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = WINDOWS_1252.decode(buf);
            decoded.into_owned()
        }
    }
}

fn csv_reader(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

fn find_col(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

/// Scans one decoded CSV source and emits one `LedgerEntry` per
/// surviving (amount, payment-date) slot of each row matching the
/// channel filter.
///
/// Structural problems (no headers, no channel column, unreadable CSV
/// header) are returned as `ScanError`; unparsable rows and slots are
/// skipped silently.
pub fn scan_source(
    bytes: &[u8],
    classifier: &ChannelClassifier,
    filter: &ChannelFilter,
) -> Result<Vec<LedgerEntry>, ScanError> {
    let text = decode_text_lossy(bytes);
    let mut reader = csv_reader(&text);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(ScanError::NoHeaders);
    }

    let channel_idx = classifier
        .find_channel_column(&headers)
        .ok_or(ScanError::MissingChannelColumn)?;
    let act_idx = find_col(&headers, ACT_MONTH_HEADER);
    let slot_cols: Vec<(Option<usize>, Option<usize>)> = PAYMENT_SLOTS
        .iter()
        .map(|(amt, date)| (find_col(&headers, amt), find_col(&headers, date)))
        .collect();

    let mut entries = Vec::new();
    for result in reader.records() {
        // A malformed record is row-level dirt, not a source failure.
        let Ok(record) = result else { continue };

        let channel = classifier.channel_of(&record, channel_idx);
        if !filter.matches(&channel) {
            continue;
        }

        let Some(act_idx) = act_idx else { continue };
        let Some(activation_month) =
            MonthKey::from_activation_field(record.get(act_idx).unwrap_or(""))
        else {
            continue;
        };

        for &(amt_idx, date_idx) in &slot_cols {
            let (Some(amt_idx), Some(date_idx)) = (amt_idx, date_idx) else {
                continue;
            };
            let amt_raw = record.get(amt_idx).unwrap_or("");
            let date_raw = record.get(date_idx).unwrap_or("");
            if amt_raw.is_empty() || date_raw.is_empty() {
                continue;
            }
            let Ok(amount) = amt_raw.parse::<f64>() else { continue };
            if amount == 0.0 {
                continue;
            }
            let Some(payment_month) = MonthKey::from_payment_date(date_raw) else {
                continue;
            };
            entries.push(LedgerEntry {
                activation_month: activation_month.clone(),
                payment_month,
                amount,
            });
        }
    }

    tracing::debug!(entries = entries.len(), "scanned ledger source");
    Ok(entries)
}

/// Scans a batch of named sources. A failing source is recorded and
/// excluded; the remaining sources still contribute, so the batch
/// never aborts as a whole.
pub fn scan_batch<'a, I>(sources: I, classifier: &ChannelClassifier, filter: &ChannelFilter) -> ScanBatch
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut batch = ScanBatch::default();
    for (name, bytes) in sources {
        match scan_source(bytes, classifier, filter) {
            Ok(entries) => batch.entries.extend(entries),
            Err(e) => {
                tracing::warn!(source = name, error = %e, "skipping ledger source");
                batch.failures.push(SourceFailure {
                    source: name.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
    batch
}

/// Collects the distinct non-empty channel values across a batch of
/// sources, sorted ascending. A source with no headers, no channel
/// column, or no usable channel value is reported as failed.
pub fn discover_channels<'a, I>(sources: I, classifier: &ChannelClassifier) -> ChannelDiscovery
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut channels: BTreeSet<ChannelValue> = BTreeSet::new();
    let mut failures = Vec::new();

    for (name, bytes) in sources {
        match channels_of_source(bytes, classifier) {
            Ok(found) if found.is_empty() => failures.push(SourceFailure {
                source: name.to_string(),
                error: "No valid \"Channel\" values found".to_string(),
            }),
            Ok(found) => channels.extend(found),
            Err(e) => {
                tracing::warn!(source = name, error = %e, "skipping ledger source");
                failures.push(SourceFailure {
                    source: name.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    ChannelDiscovery {
        channels: channels.into_iter().collect(),
        failures,
    }
}

fn channels_of_source(
    bytes: &[u8],
    classifier: &ChannelClassifier,
) -> Result<BTreeSet<ChannelValue>, ScanError> {
    let text = decode_text_lossy(bytes);
    let mut reader = csv_reader(&text);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(ScanError::NoHeaders);
    }
    let channel_idx = classifier
        .find_channel_column(&headers)
        .ok_or(ScanError::MissingChannelColumn)?;

    let mut found = BTreeSet::new();
    for result in reader.records() {
        let Ok(record) = result else { continue };
        let channel = classifier.channel_of(&record, channel_idx);
        if !channel.is_empty() {
            found.insert(channel);
        }
    }
    Ok(found)
}
