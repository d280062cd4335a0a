//! Filtering policy pushed to the filter service

use crate::error::{Result, RestError};
use serde::{Deserialize, Serialize};

const PG_LEVELS: [u8; 3] = [0, 12, 18];
const RISK_LEVELS: [&str; 3] = ["possible", "medium", "high"];
const ILLEGAL_KINDS: [&str; 4] = ["content", "warez", "spyware", "copyright"];

/// DNS-level filtering settings for the current session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filter {
    #[serde(skip_serializing_if = "is_false")]
    pub ads: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub trackers: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub malware: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub malicious: bool,
    /// Parental guidance age (0 disables)
    #[serde(rename = "PG", skip_serializing_if = "is_zero")]
    pub pg: u8,
    #[serde(skip_serializing_if = "is_false")]
    pub safe_search: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risk: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub illegal: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub whitelist: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blacklist: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u8) -> bool {
    *value == 0
}

impl Filter {
    /// Validate the policy before it is sent
    pub fn check(&self) -> Result<()> {
        if !PG_LEVELS.contains(&self.pg) {
            return Err(RestError::Validation(format!(
                "PG must be one of {PG_LEVELS:?}, got {}",
                self.pg
            )));
        }
        if let Some(level) = self.risk.iter().find(|r| !RISK_LEVELS.contains(&r.as_str())) {
            return Err(RestError::Validation(format!("unknown risk level '{level}'")));
        }
        if let Some(kind) = self
            .illegal
            .iter()
            .find(|i| !ILLEGAL_KINDS.contains(&i.as_str()))
        {
            return Err(RestError::Validation(format!("unknown illegal kind '{kind}'")));
        }
        for domain in self.whitelist.iter().chain(self.blacklist.iter()) {
            if domain.is_empty() || domain.chars().any(char::is_whitespace) {
                return Err(RestError::Validation(format!(
                    "malformed filter domain '{domain}'"
                )));
            }
        }
        Ok(())
    }
}
