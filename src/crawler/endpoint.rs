//! Endpoint catalogue
//!
//! Each endpoint kind knows which host and path it lives on, how to build the
//! query for one item, where its rows are stored, and which columns identify
//! a row.

use crate::crawler::parser;
use crate::crawler::{FetchError, Payload};
use crate::state::ItemDescriptor;
use crate::storage::{Record, UniqueKey};
use std::fmt;
use std::str::FromStr;

/// Query parameters for one request, in order
pub type Params = Vec<(String, String)>;

/// Which configured host serves an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Base,
    Stock,
}

/// The three statements published per report period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Income,
    Balance,
    CashFlow,
}

impl StatementKind {
    pub const ALL: [StatementKind; 3] = [
        StatementKind::Income,
        StatementKind::Balance,
        StatementKind::CashFlow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Income => "income",
            StatementKind::Balance => "balance",
            StatementKind::CashFlow => "cash",
        }
    }

    /// Current API on the stock host
    pub fn path(&self) -> &'static str {
        match self {
            StatementKind::Income => "/v5/stock/finance/cn/income.json",
            StatementKind::Balance => "/v5/stock/finance/cn/balance.json",
            StatementKind::CashFlow => "/v5/stock/finance/cn/cash_flow.json",
        }
    }

    /// Older services API on the base host
    pub fn legacy_path(&self) -> &'static str {
        match self {
            StatementKind::Income => "/services/v10/stock/finance/lrb.json",
            StatementKind::Balance => "/services/v10/stock/finance/zcfz.json",
            StatementKind::CashFlow => "/services/v10/stock/finance/xjll.json",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            StatementKind::Income => "income_statement",
            StatementKind::Balance => "balance_sheet",
            StatementKind::CashFlow => "cash_flow_statement",
        }
    }
}

impl FromStr for StatementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown statement '{}' (expected income, balance or cash)", s))
    }
}

/// The fixed set of API surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    QuoteList,
    CompanyProfile,
    FinancialIndicator,
    FinancialStatement(StatementKind),
    Kline,
}

impl EndpointKind {
    pub fn host(&self) -> Host {
        match self {
            EndpointKind::Kline | EndpointKind::FinancialStatement(_) => Host::Stock,
            _ => Host::Base,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            EndpointKind::QuoteList => "/stock/quote_order.json",
            EndpointKind::CompanyProfile => "/stock/f10/compinfo.json",
            EndpointKind::FinancialIndicator => "/stock/f10/finmainindex.json",
            EndpointKind::FinancialStatement(kind) => kind.path(),
            EndpointKind::Kline => "/v5/stock/chart/kline.json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::QuoteList => "quote-list",
            EndpointKind::CompanyProfile => "company",
            EndpointKind::FinancialIndicator => "finance",
            EndpointKind::FinancialStatement(StatementKind::Income) => "statement:income",
            EndpointKind::FinancialStatement(StatementKind::Balance) => "statement:balance",
            EndpointKind::FinancialStatement(StatementKind::CashFlow) => "statement:cash",
            EndpointKind::Kline => "kline",
        }
    }

    pub fn all() -> [EndpointKind; 7] {
        [
            EndpointKind::QuoteList,
            EndpointKind::CompanyProfile,
            EndpointKind::FinancialIndicator,
            EndpointKind::FinancialStatement(StatementKind::Income),
            EndpointKind::FinancialStatement(StatementKind::Balance),
            EndpointKind::FinancialStatement(StatementKind::CashFlow),
            EndpointKind::Kline,
        ]
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(statement) = s.strip_prefix("statement:") {
            return statement.parse().map(EndpointKind::FinancialStatement);
        }
        EndpointKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown job '{}' (expected quote-list, company, finance, kline or statement:<income|balance|cash>)",
                    s
                )
            })
    }
}

/// Kline bar period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KlinePeriod {
    #[default]
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Min1,
    Min5,
    Min15,
    Min30,
    Min60,
    Min120,
}

impl KlinePeriod {
    const ALL: [KlinePeriod; 11] = [
        KlinePeriod::Day,
        KlinePeriod::Week,
        KlinePeriod::Month,
        KlinePeriod::Quarter,
        KlinePeriod::Year,
        KlinePeriod::Min1,
        KlinePeriod::Min5,
        KlinePeriod::Min15,
        KlinePeriod::Min30,
        KlinePeriod::Min60,
        KlinePeriod::Min120,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KlinePeriod::Day => "day",
            KlinePeriod::Week => "week",
            KlinePeriod::Month => "month",
            KlinePeriod::Quarter => "quarter",
            KlinePeriod::Year => "year",
            KlinePeriod::Min1 => "1m",
            KlinePeriod::Min5 => "5m",
            KlinePeriod::Min15 => "15m",
            KlinePeriod::Min30 => "30m",
            KlinePeriod::Min60 => "60m",
            KlinePeriod::Min120 => "120m",
        }
    }
}

impl FromStr for KlinePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown kline period '{}'", s))
    }
}

/// Price adjustment applied to kline bars
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdjustType {
    Before,
    #[default]
    After,
    Normal,
}

impl AdjustType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustType::Before => "before",
            AdjustType::After => "after",
            AdjustType::Normal => "normal",
        }
    }
}

impl FromStr for AdjustType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(AdjustType::Before),
            "after" => Ok(AdjustType::After),
            "normal" => Ok(AdjustType::Normal),
            other => Err(format!("unknown adjust type '{}'", other)),
        }
    }
}

/// Alternate location tried when the primary one rejects an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub host: Host,
    pub path: &'static str,
    pub params: Params,
}

/// Request building and response parsing for one endpoint kind
pub trait Endpoint: Send + Sync {
    fn kind(&self) -> EndpointKind;

    /// Ledger scope; items are tracked independently per job
    fn job_name(&self) -> String;

    /// Storage table receiving the parsed rows
    fn table(&self) -> &str;

    fn unique_key(&self) -> UniqueKey;

    fn params(&self, item: &ItemDescriptor) -> Params;

    fn fallback(&self, _item: &ItemDescriptor) -> Option<Fallback> {
        None
    }

    fn parse(&self, item: &ItemDescriptor, payload: &Payload) -> Result<Vec<Record>, FetchError>;
}

fn now_ms() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

fn param(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

/// Daily (or other period) price bars per symbol
#[derive(Debug, Clone, Copy, Default)]
pub struct KlineEndpoint {
    pub period: KlinePeriod,
    pub adjust: AdjustType,
}

impl KlineEndpoint {
    /// Earliest bar requested; the service clamps it to the listing date
    const BEGIN_MS: &'static str = "600000000000";

    pub fn new(period: KlinePeriod, adjust: AdjustType) -> Self {
        Self { period, adjust }
    }
}

impl Endpoint for KlineEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Kline
    }

    fn job_name(&self) -> String {
        format!("kline:{}:{}", self.period.as_str(), self.adjust.as_str())
    }

    fn table(&self) -> &str {
        "kline_data"
    }

    fn unique_key(&self) -> UniqueKey {
        UniqueKey::new(&["symbol", "timestamp", "period", "type"])
    }

    fn params(&self, item: &ItemDescriptor) -> Params {
        vec![
            param("symbol", item.symbol_or_id()),
            param("begin", Self::BEGIN_MS),
            param("end", now_ms()),
            param("period", self.period.as_str()),
            param("type", self.adjust.as_str()),
            param("indicator", "kline"),
        ]
    }

    fn parse(&self, item: &ItemDescriptor, payload: &Payload) -> Result<Vec<Record>, FetchError> {
        parser::parse_kline(
            &payload.body,
            item.symbol_or_id(),
            self.period.as_str(),
            self.adjust.as_str(),
        )
    }
}

/// Company profile (F10 compinfo) per symbol
#[derive(Debug, Clone, Copy, Default)]
pub struct CompanyProfileEndpoint;

impl Endpoint for CompanyProfileEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::CompanyProfile
    }

    fn job_name(&self) -> String {
        "company".to_string()
    }

    fn table(&self) -> &str {
        "company_profile"
    }

    fn unique_key(&self) -> UniqueKey {
        UniqueKey::single("compcode")
    }

    fn params(&self, item: &ItemDescriptor) -> Params {
        vec![
            param("symbol", item.symbol_or_id()),
            param("page", "1"),
            param("size", "4"),
            param("_", now_ms()),
        ]
    }

    fn parse(&self, item: &ItemDescriptor, payload: &Payload) -> Result<Vec<Record>, FetchError> {
        parser::parse_company_profile(&payload.body, item.symbol_or_id())
    }
}

/// Main financial indicators per report period, per symbol
#[derive(Debug, Clone, Copy, Default)]
pub struct FinancialIndicatorEndpoint;

impl Endpoint for FinancialIndicatorEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::FinancialIndicator
    }

    fn job_name(&self) -> String {
        "finance".to_string()
    }

    fn table(&self) -> &str {
        "financial_data"
    }

    fn unique_key(&self) -> UniqueKey {
        UniqueKey::new(&["compcode", "reportdate"])
    }

    fn params(&self, item: &ItemDescriptor) -> Params {
        vec![
            param("symbol", item.symbol_or_id()),
            param("page", "1"),
            param("size", "100"),
            param("_", now_ms()),
        ]
    }

    fn parse(&self, item: &ItemDescriptor, payload: &Payload) -> Result<Vec<Record>, FetchError> {
        parser::parse_financial_indicators(&payload.body, item.symbol_or_id())
    }
}

/// Income, balance or cash-flow statements per report period, per symbol
#[derive(Debug, Clone, Copy)]
pub struct FinancialStatementEndpoint {
    pub statement: StatementKind,
}

impl FinancialStatementEndpoint {
    const REPORT_COUNT: &'static str = "20";

    pub fn new(statement: StatementKind) -> Self {
        Self { statement }
    }
}

impl Endpoint for FinancialStatementEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::FinancialStatement(self.statement)
    }

    fn job_name(&self) -> String {
        format!("statement:{}", self.statement.as_str())
    }

    fn table(&self) -> &str {
        self.statement.table()
    }

    fn unique_key(&self) -> UniqueKey {
        UniqueKey::new(&["symbol", "report_date"])
    }

    fn params(&self, item: &ItemDescriptor) -> Params {
        vec![
            param("symbol", item.symbol_or_id()),
            param("type", "all"),
            param("is_detail", "true"),
            param("count", Self::REPORT_COUNT),
            param("timestamp", now_ms()),
        ]
    }

    fn fallback(&self, item: &ItemDescriptor) -> Option<Fallback> {
        Some(Fallback {
            host: Host::Base,
            path: self.statement.legacy_path(),
            params: vec![
                param("symbol", item.symbol_or_id()),
                param("page", "1"),
                param("size", Self::REPORT_COUNT),
                param("_", now_ms()),
            ],
        })
    }

    fn parse(&self, item: &ItemDescriptor, payload: &Payload) -> Result<Vec<Record>, FetchError> {
        parser::parse_financial_statement(&payload.body, item.symbol_or_id(), self.statement.as_str())
    }
}

/// Paged instrument list; items are `<stock type>:<page>`
#[derive(Debug, Clone, Copy)]
pub struct QuoteListEndpoint {
    pub page_size: u32,
}

impl QuoteListEndpoint {
    pub fn new(page_size: u32) -> Self {
        Self { page_size }
    }

    /// Query for one page of one stock type
    pub fn page_params(&self, stock_type: &str, page: u64) -> Params {
        vec![
            param("page", page.to_string()),
            param("size", self.page_size.to_string()),
            param("order", "asc"),
            param("exchange", "CN"),
            param("stockType", stock_type),
            param("column", parser::QUOTE_COLUMNS.join(",")),
            param("orderBy", "symbol"),
            param("_", now_ms()),
        ]
    }

    /// Pages needed for `count` rows, always at least one
    pub fn page_count(&self, count: u64) -> u64 {
        count / u64::from(self.page_size.max(1)) + 1
    }
}

impl Default for QuoteListEndpoint {
    fn default() -> Self {
        Self { page_size: 90 }
    }
}

impl Endpoint for QuoteListEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::QuoteList
    }

    fn job_name(&self) -> String {
        "quote-list".to_string()
    }

    fn table(&self) -> &str {
        "stock_list"
    }

    fn unique_key(&self) -> UniqueKey {
        UniqueKey::single("symbol")
    }

    fn params(&self, item: &ItemDescriptor) -> Params {
        let stock_type = item.get("stock_type").unwrap_or("sha");
        let page = item
            .get("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        self.page_params(stock_type, page)
    }

    fn parse(&self, item: &ItemDescriptor, payload: &Payload) -> Result<Vec<Record>, FetchError> {
        parser::parse_quote_list(&payload.body, item.get("stock_type").unwrap_or(""))
    }
}

/// Builds the endpoint for a job kind
pub fn endpoint_for(
    kind: EndpointKind,
    period: KlinePeriod,
    adjust: AdjustType,
    page_size: u32,
) -> Box<dyn Endpoint> {
    match kind {
        EndpointKind::QuoteList => Box::new(QuoteListEndpoint::new(page_size)),
        EndpointKind::CompanyProfile => Box::new(CompanyProfileEndpoint),
        EndpointKind::FinancialIndicator => Box::new(FinancialIndicatorEndpoint),
        EndpointKind::FinancialStatement(statement) => {
            Box::new(FinancialStatementEndpoint::new(statement))
        }
        EndpointKind::Kline => Box::new(KlineEndpoint::new(period, adjust)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param_value<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in EndpointKind::all() {
            assert_eq!(kind.as_str().parse::<EndpointKind>().unwrap(), kind);
        }
        assert!("bonds".parse::<EndpointKind>().is_err());
        assert_eq!(
            "statement:cash".parse::<EndpointKind>().unwrap(),
            EndpointKind::FinancialStatement(StatementKind::CashFlow)
        );
        assert!("statement:profit".parse::<EndpointKind>().is_err());
        assert_eq!(
            EndpointKind::FinancialStatement(StatementKind::Income).host(),
            Host::Stock
        );
        assert_eq!(EndpointKind::Kline.host(), Host::Stock);
        assert_eq!(EndpointKind::CompanyProfile.host(), Host::Base);
    }

    #[test]
    fn test_period_and_adjust_parsing() {
        assert_eq!("120m".parse::<KlinePeriod>().unwrap(), KlinePeriod::Min120);
        assert_eq!("quarter".parse::<KlinePeriod>().unwrap(), KlinePeriod::Quarter);
        assert!("2h".parse::<KlinePeriod>().is_err());
        assert_eq!("before".parse::<AdjustType>().unwrap(), AdjustType::Before);
        assert!("none".parse::<AdjustType>().is_err());
        assert_eq!(KlinePeriod::default(), KlinePeriod::Day);
        assert_eq!(AdjustType::default(), AdjustType::After);
    }

    #[test]
    fn test_kline_params_and_job() {
        let endpoint = KlineEndpoint::new(KlinePeriod::Week, AdjustType::Before);
        let params = endpoint.params(&ItemDescriptor::symbol("SZ000001"));

        assert_eq!(endpoint.job_name(), "kline:week:before");
        assert_eq!(param_value(&params, "symbol"), Some("SZ000001"));
        assert_eq!(param_value(&params, "period"), Some("week"));
        assert_eq!(param_value(&params, "type"), Some("before"));
        assert_eq!(param_value(&params, "indicator"), Some("kline"));
        assert_eq!(
            endpoint.unique_key().columns(),
            ["symbol", "timestamp", "period", "type"]
        );
    }

    #[test]
    fn test_quote_list_paging() {
        let endpoint = QuoteListEndpoint::new(90);
        assert_eq!(endpoint.page_count(0), 1);
        assert_eq!(endpoint.page_count(89), 1);
        assert_eq!(endpoint.page_count(181), 3);

        let item = ItemDescriptor::new("sza:2")
            .with("stock_type", "sza")
            .with("page", "2");
        let params = endpoint.params(&item);
        assert_eq!(param_value(&params, "page"), Some("2"));
        assert_eq!(param_value(&params, "stockType"), Some("sza"));
        assert_eq!(param_value(&params, "size"), Some("90"));
    }

    #[test]
    fn test_tables_and_keys() {
        assert_eq!(CompanyProfileEndpoint.table(), "company_profile");
        assert_eq!(CompanyProfileEndpoint.unique_key().columns(), ["compcode"]);
        assert_eq!(FinancialIndicatorEndpoint.table(), "financial_data");
        assert_eq!(
            FinancialIndicatorEndpoint.unique_key().columns(),
            ["compcode", "reportdate"]
        );
        assert_eq!(QuoteListEndpoint::default().table(), "stock_list");
    }

    #[test]
    fn test_statement_routes() {
        let endpoint = FinancialStatementEndpoint::new(StatementKind::Balance);
        let item = ItemDescriptor::symbol("SH600000");

        assert_eq!(endpoint.job_name(), "statement:balance");
        assert_eq!(endpoint.table(), "balance_sheet");
        assert_eq!(endpoint.unique_key().columns(), ["symbol", "report_date"]);
        assert_eq!(endpoint.kind().path(), "/v5/stock/finance/cn/balance.json");

        let params = endpoint.params(&item);
        assert_eq!(param_value(&params, "symbol"), Some("SH600000"));
        assert_eq!(param_value(&params, "type"), Some("all"));
        assert_eq!(param_value(&params, "is_detail"), Some("true"));

        let fallback = endpoint.fallback(&item).unwrap();
        assert_eq!(fallback.host, Host::Base);
        assert_eq!(fallback.path, "/services/v10/stock/finance/zcfz.json");
        assert_eq!(param_value(&fallback.params, "page"), Some("1"));
        assert!(KlineEndpoint::default().fallback(&item).is_none());
    }
}
