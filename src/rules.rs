use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use hyper::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Access rule as written in the configuration file. Every field is a
/// regular expression; an absent field always matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    pub method: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RuleConfig {
    pub fn compile(&self) -> Result<Rule> {
        let method = self
            .method
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("invalid method regex {:?}", self.method))?;
        let url = self
            .url
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("invalid url regex {:?}", self.url))?;
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, pattern) in &self.headers {
            let regex = Regex::new(pattern)
                .with_context(|| format!("invalid regex {pattern:?} for header {name}"))?;
            headers.push((name.clone(), regex));
        }
        Ok(Rule {
            method,
            url,
            headers,
        })
    }
}

/// Compiled access rule. Immutable after configuration load.
#[derive(Debug)]
pub struct Rule {
    method: Option<Regex>,
    url: Option<Regex>,
    headers: Vec<(String, Regex)>,
}

impl Rule {
    /// A rule matches iff every present regex matches. An absent header
    /// is tested against the empty string.
    pub fn matches(&self, method: &str, url: &str, headers: &HeaderMap) -> bool {
        if let Some(regex) = &self.method {
            if !regex.is_match(method) {
                return false;
            }
        }
        if let Some(regex) = &self.url {
            if !regex.is_match(url) {
                return false;
            }
        }
        for (name, regex) in &self.headers {
            let value = headers
                .get(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default();
            if !regex.is_match(&value) {
                return false;
            }
        }
        true
    }
}

/// Applies blacklist-then-whitelist rules to a request.
///
/// The blacklist is evaluated first: any match rejects. Then the whitelist:
/// if non-empty, at least one rule must match. An empty blacklist denies
/// nothing, an empty whitelist allows everything.
#[derive(Debug, Default)]
pub struct Validator {
    blacklist: Vec<Rule>,
    whitelist: Vec<Rule>,
}

impl Validator {
    /// Compile all rules. A regex compile failure is fatal and refuses the
    /// whole configuration.
    pub fn new(blacklist: &[RuleConfig], whitelist: &[RuleConfig]) -> Result<Self> {
        Ok(Self {
            blacklist: blacklist
                .iter()
                .map(RuleConfig::compile)
                .collect::<Result<_>>()
                .context("invalid blacklist")?,
            whitelist: whitelist
                .iter()
                .map(RuleConfig::compile)
                .collect::<Result<_>>()
                .context("invalid whitelist")?,
        })
    }

    pub fn validate(&self, method: &str, url: &str, headers: &HeaderMap) -> Result<()> {
        for rule in &self.blacklist {
            if rule.matches(method, url, headers) {
                return Err(anyhow!("destination is forbidden"));
            }
        }

        if !self.whitelist.is_empty()
            && !self
                .whitelist
                .iter()
                .any(|rule| rule.matches(method, url, headers))
        {
            return Err(anyhow!("destination is not allowed"));
        }

        Ok(())
    }
}
