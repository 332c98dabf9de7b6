//! Response parsers for each endpoint kind
//!
//! Parsers turn a validated payload into normalized rows. A payload whose
//! shape does not match yields `FetchError::MalformedResponse`; a payload that
//! matches but carries no data yields zero rows.

use crate::crawler::FetchError;
use crate::storage::Record;
use serde_json::{Number, Value};

/// Column order of quote-list rows
pub const QUOTE_COLUMNS: [&str; 15] = [
    "symbol",
    "name",
    "current",
    "chg",
    "percent",
    "last_close",
    "open",
    "high",
    "low",
    "volume",
    "amount",
    "market_capital",
    "pe_ttm",
    "high52w",
    "low52w",
];

/// Text fields copied from `tqCompInfo`
pub const COMPANY_FIELDS: [&str; 15] = [
    "compname",
    "engname",
    "founddate",
    "regcapital",
    "chairman",
    "manager",
    "leconstant",
    "accfirm",
    "regaddr",
    "officeaddr",
    "compintro",
    "bizscope",
    "majorbiz",
    "compsname",
    "region",
];

/// Long text fields in which double quotes are replaced with spaces
const SCRUBBED_FIELDS: [&str; 3] = ["compintro", "bizscope", "majorbiz"];

fn malformed(what: impl Into<String>) -> FetchError {
    FetchError::MalformedResponse(what.into())
}

fn number_or_zero(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Number(n)) => Value::Number(n.clone()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0)),
        _ => Value::from(0),
    }
}

fn text_or_empty(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn round2(value: Option<&Value>) -> Value {
    let x = value.and_then(Value::as_f64).unwrap_or(0.0);
    Number::from_f64((x * 100.0).round() / 100.0)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}

/// Total row count reported by a quote-list page
pub fn quote_list_count(body: &Value) -> Result<u64, FetchError> {
    let count = body
        .get("count")
        .or_else(|| body.get("data").and_then(|d| d.get("count")))
        .ok_or_else(|| malformed("quote list without count"))?;

    match count {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| malformed(format!("invalid quote list count {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| malformed(format!("invalid quote list count {:?}", s))),
        _ => Err(malformed("invalid quote list count")),
    }
}

/// One row per instrument in a quote-list page
pub fn parse_quote_list(body: &Value, stock_type: &str) -> Result<Vec<Record>, FetchError> {
    let rows = match body.get("data") {
        Some(Value::Array(rows)) => rows,
        Some(Value::Object(inner)) => match inner.get("list") {
            Some(Value::Array(rows)) => rows,
            _ => return Err(malformed("quote list data is not an array")),
        },
        None | Some(Value::Null) => return Ok(Vec::new()),
        _ => return Err(malformed("quote list data is not an array")),
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| malformed("quote list row is not an array"))?;

        let symbol = text_or_empty(cells.first());
        if symbol.is_empty() {
            tracing::debug!("Skipping quote list row without symbol");
            continue;
        }

        let mut record = Record::new();
        record.insert("symbol".to_string(), Value::String(symbol));
        record.insert("name".to_string(), Value::String(text_or_empty(cells.get(1))));
        for (index, column) in QUOTE_COLUMNS.iter().enumerate().skip(2) {
            record.insert(column.to_string(), number_or_zero(cells.get(index)));
        }
        record.insert(
            "stock_type".to_string(),
            Value::String(stock_type.to_string()),
        );
        records.push(record);
    }

    Ok(records)
}

/// Zero or one profile row for `symbol`
pub fn parse_company_profile(body: &Value, symbol: &str) -> Result<Vec<Record>, FetchError> {
    let info = match body.get("tqCompInfo") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(info)) if info.is_empty() => return Ok(Vec::new()),
        Some(Value::Object(info)) => info,
        Some(_) => return Err(malformed("tqCompInfo is not an object")),
    };

    let mut record = Record::new();
    record.insert("compcode".to_string(), Value::String(symbol.to_string()));
    for field in COMPANY_FIELDS {
        let mut text = text_or_empty(info.get(field));
        if SCRUBBED_FIELDS.contains(&field) {
            text = text.replace('"', " ");
        }
        record.insert(field.to_string(), Value::String(text));
    }

    Ok(vec![record])
}

/// Per-period entries: `list` at the top level, or under `data` (as the
/// array itself or `data.list`)
fn report_entries<'a>(body: &'a Value, what: &str) -> Result<&'a [Value], FetchError> {
    let list = body.get("list").filter(|v| !v.is_null()).or_else(|| {
        body.get("data").and_then(|data| match data {
            Value::Object(inner) => inner.get("list"),
            other => Some(other),
        })
    });
    match list {
        None | Some(Value::Null) => Ok(Default::default()),
        Some(Value::Array(entries)) => Ok(entries),
        Some(_) => Err(malformed(format!("{} list is not an array", what))),
    }
}

/// One row per report period
pub fn parse_financial_indicators(body: &Value, symbol: &str) -> Result<Vec<Record>, FetchError> {
    let entries = report_entries(body, "finance")?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .as_object()
            .ok_or_else(|| malformed("finance entry is not an object"))?;

        let report_date = text_or_empty(fields.get("reportdate"));
        if report_date.is_empty() {
            tracing::warn!(symbol, "Skipping finance entry without reportdate");
            continue;
        }

        let mut record = Record::new();
        record.insert("compcode".to_string(), Value::String(symbol.to_string()));
        record.insert("reportdate".to_string(), Value::String(report_date));
        for (name, value) in fields {
            if name == "compcode" || name == "reportdate" {
                continue;
            }
            let cell = match value {
                Value::Null => Value::from(0),
                Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                scalar => scalar.clone(),
            };
            record.insert(name.clone(), cell);
        }
        records.push(record);
    }

    Ok(records)
}

/// One row per report period of one statement
///
/// Detailed responses carry each item as `[value, yoy]`; the value keeps the
/// item's name and the year-on-year change goes to `<name>_yoy`.
pub fn parse_financial_statement(
    body: &Value,
    symbol: &str,
    statement_type: &str,
) -> Result<Vec<Record>, FetchError> {
    let entries = report_entries(body, "statement")?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .as_object()
            .ok_or_else(|| malformed("statement entry is not an object"))?;

        let report_date = text_or_empty(fields.get("report_date").or_else(|| fields.get("reportdate")));
        if report_date.is_empty() {
            tracing::warn!(symbol, statement_type, "Skipping statement entry without report date");
            continue;
        }

        let mut record = Record::new();
        record.insert("symbol".to_string(), Value::String(symbol.to_string()));
        record.insert("report_date".to_string(), Value::String(report_date));
        record.insert(
            "statement_type".to_string(),
            Value::String(statement_type.to_string()),
        );
        for (name, value) in fields {
            if matches!(name.as_str(), "symbol" | "report_date" | "reportdate" | "statement_type") {
                continue;
            }
            match value {
                Value::Array(pair) if pair.len() <= 2 && pair.iter().all(is_scalar) => {
                    record.insert(name.clone(), scalar_or_zero(pair.first()));
                    if pair.len() == 2 {
                        record.insert(format!("{}_yoy", name), scalar_or_zero(pair.get(1)));
                    }
                }
                Value::Array(_) | Value::Object(_) => {
                    record.insert(name.clone(), Value::String(value.to_string()));
                }
                scalar => {
                    record.insert(name.clone(), scalar_or_zero(Some(scalar)));
                }
            }
        }
        records.push(record);
    }

    Ok(records)
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn scalar_or_zero(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::from(0),
        Some(v) => v.clone(),
    }
}

/// One row per bar
pub fn parse_kline(
    body: &Value,
    symbol: &str,
    period: &str,
    adjust: &str,
) -> Result<Vec<Record>, FetchError> {
    let items = match body.get("data").and_then(|d| d.get("item")) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(malformed("kline data.item is not an array")),
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let cells = item
            .as_array()
            .ok_or_else(|| malformed("kline bar is not an array"))?;
        let timestamp_ms = cells
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed("kline bar without timestamp"))?;

        let mut record = Record::new();
        record.insert("symbol".to_string(), Value::String(symbol.to_string()));
        record.insert("timestamp".to_string(), Value::from(timestamp_ms / 1000));
        record.insert("volume".to_string(), number_or_zero(cells.get(1)));
        record.insert("open".to_string(), round2(cells.get(2)));
        record.insert("high".to_string(), round2(cells.get(3)));
        record.insert("low".to_string(), round2(cells.get(4)));
        record.insert("close".to_string(), round2(cells.get(5)));
        record.insert("chg".to_string(), round2(cells.get(6)));
        record.insert("percent".to_string(), round2(cells.get(7)));
        record.insert("turnoverrate".to_string(), round2(cells.get(8)));
        record.insert("period".to_string(), Value::String(period.to_string()));
        record.insert("type".to_string(), Value::String(adjust.to_string()));
        records.push(record);
    }

    Ok(records)
}
