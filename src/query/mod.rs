//! Search request parameters and query construction
//!
//! Export counts and export scrolls are built from the same query so the
//! planned row total and the streamed rows agree.

pub mod filter;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::SearchQuery;
use crate::config::BackendConfig;
use crate::error::{ExecutionError, ExportError, Result};

pub use filter::{FilterNode, Operator, parse_filter};

/// Log category searched and exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Menu {
    Traffic,
    Threat,
    System,
}

impl Menu {
    pub fn as_str(&self) -> &'static str {
        match self {
            Menu::Traffic => "TRAFFIC",
            Menu::Threat => "THREAT",
            Menu::System => "SYSTEM",
        }
    }
}

impl fmt::Display for Menu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Menu {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRAFFIC" => Ok(Menu::Traffic),
            "THREAT" => Ok(Menu::Threat),
            "SYSTEM" => Ok(Menu::System),
            _ => Err(ExecutionError::InvalidParameters(format!("unknown menu '{s}'")).into()),
        }
    }
}

/// Parameters of a log search, as sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub time_from: String,
    pub time_to: String,
    pub menu: Menu,
    #[serde(default)]
    pub search_term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl SearchParams {
    pub fn new(menu: Menu, time_from: impl Into<String>, time_to: impl Into<String>) -> Self {
        Self {
            time_from: time_from.into(),
            time_to: time_to.into(),
            menu,
            search_term: String::new(),
            filter: None,
            current_page: None,
            limit: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_from.trim().is_empty() || self.time_to.trim().is_empty() {
            return Err(
                ExecutionError::InvalidParameters("timeFrom and timeTo are required".into()).into(),
            );
        }
        Ok(())
    }
}

/// Backend-specific knobs applied while building queries.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub time_zone: String,
    pub log_type_field: String,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for QueryOptions {
    fn from(config: &BackendConfig) -> Self {
        Self {
            time_zone: config.time_zone.clone(),
            log_type_field: config.log_type_field.clone(),
        }
    }
}

/// Build the search query for `params`.
pub fn build_query(params: &SearchParams, options: &QueryOptions) -> Result<SearchQuery> {
    params.validate()?;

    let mut must = vec![
        json!({
            "range": {
                "@timestamp": {
                    "gte": params.time_from,
                    "lte": params.time_to,
                    "format": "strict_date_optional_time",
                    "time_zone": options.time_zone,
                }
            }
        }),
        json!({ "match": { options.log_type_field.as_str(): params.menu.as_str() } }),
    ];

    let term = params.search_term.trim();
    if !term.is_empty() {
        must.push(json!({
            "multi_match": { "query": term, "fields": ["*"], "type": "phrase" }
        }));
    }

    if let Some(filter) = params.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        must.push(parse_filter(filter)?.to_query());
    }

    Ok(SearchQuery::new(json!({ "bool": { "must": Value::Array(must) } })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SearchParams {
        SearchParams::new(Menu::Traffic, "2024-01-01T00:00:00", "2024-01-02T00:00:00")
    }

    #[test]
    fn test_menu_parsing() {
        assert_eq!("traffic".parse::<Menu>().unwrap(), Menu::Traffic);
        assert_eq!("SYSTEM".parse::<Menu>().unwrap(), Menu::System);
        assert!("audit".parse::<Menu>().is_err());
    }

    #[test]
    fn test_search_params_json_is_camel_case() {
        let parsed: SearchParams = serde_json::from_value(json!({
            "timeFrom": "a",
            "timeTo": "b",
            "menu": "THREAT",
            "searchTerm": "deny"
        }))
        .unwrap();
        assert_eq!(parsed.menu, Menu::Threat);
        assert_eq!(parsed.search_term, "deny");
        assert_eq!(parsed.filter, None);
    }

    #[test]
    fn test_base_query() {
        let query = build_query(&params(), &QueryOptions::default()).unwrap();
        let must = query.query["bool"]["must"].as_array().unwrap();

        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["range"]["@timestamp"]["time_zone"], "+09:00");
        assert_eq!(must[1]["match"]["logType"], "TRAFFIC");
        assert_eq!(query.offset, 0);
    }

    #[test]
    fn test_search_term_and_filter() {
        let mut params = params();
        params.search_term = "  blocked  ".into();
        params.filter = Some("action = 'deny'".into());

        let query = build_query(&params, &QueryOptions::default()).unwrap();
        let must = query.query["bool"]["must"].as_array().unwrap();

        assert_eq!(must.len(), 4);
        assert_eq!(must[2]["multi_match"]["query"], "blocked");
        assert_eq!(must[3], json!({ "match": { "action": "deny" } }));
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        let mut params = params();
        params.filter = Some("action = deny".into());
        let err = build_query(&params, &QueryOptions::default()).unwrap_err();
        assert!(matches!(err, ExportError::Parse(_)));
    }

    #[test]
    fn test_missing_time_range() {
        let params = SearchParams::new(Menu::System, "", "2024-01-02");
        assert!(build_query(&params, &QueryOptions::default()).is_err());
    }
}
