//! User-agent and country based denial.

use color_eyre::{eyre::eyre, Result};
use regex::RegexSet;
use std::collections::HashSet;

use crate::config::EdgeConfig;
use crate::http::Request;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
  UserAgent(String),
  Country(String),
}

pub struct RequestBlocker {
  user_agents: RegexSet,
  countries: HashSet<String>,
  country_header: String,
}

impl RequestBlocker {
  pub fn from_config(config: &EdgeConfig) -> Result<Self> {
    let user_agents = RegexSet::new(&config.blocked_user_agents)
      .map_err(|e| eyre!("Invalid blocked user agent pattern: {}", e))?;

    Ok(Self {
      user_agents,
      countries: config
        .blocked_countries
        .iter()
        .map(|c| c.trim().to_uppercase())
        .collect(),
      country_header: config.country_header.to_lowercase(),
    })
  }

  /// Why the request must be refused, if it must. A missing user agent or
  /// country header never blocks.
  pub fn check(&self, request: &Request) -> Option<BlockReason> {
    if let Some(agent) = request.header_str("user-agent") {
      if self.user_agents.is_match(agent) {
        return Some(BlockReason::UserAgent(agent.to_string()));
      }
    }

    let country = request
      .header_str(&self.country_header)?
      .trim()
      .to_uppercase();
    if self.countries.contains(&country) {
      return Some(BlockReason::Country(country));
    }

    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::url;
  use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};

  fn with_agent(agent: &'static str) -> Request {
    Request::get(url("/")).with_header(USER_AGENT, HeaderValue::from_static(agent))
  }

  #[test]
  fn test_command_line_clients_are_blocked() {
    let blocker = RequestBlocker::from_config(&EdgeConfig::default()).unwrap();
    assert!(blocker.check(&with_agent("curl/8.4.0")).is_some());
    assert!(blocker.check(&with_agent("Wget/1.21")).is_some());
    assert!(blocker.check(&with_agent("python-requests/2.31")).is_some());
    assert!(blocker.check(&with_agent("SuperBot/1.0")).is_some());
  }

  #[test]
  fn test_browsers_and_missing_agent_pass() {
    let blocker = RequestBlocker::from_config(&EdgeConfig::default()).unwrap();
    assert!(blocker
      .check(&with_agent(
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Safari/604.1"
      ))
      .is_none());
    assert!(blocker.check(&Request::get(url("/"))).is_none());
  }

  #[test]
  fn test_country_blocklist_empty_by_default() {
    let blocker = RequestBlocker::from_config(&EdgeConfig::default()).unwrap();
    let request = Request::get(url("/")).with_header(
      HeaderName::from_static("x-vercel-ip-country"),
      HeaderValue::from_static("KP"),
    );
    assert!(blocker.check(&request).is_none());
  }

  #[test]
  fn test_configured_country_is_blocked() {
    let config = EdgeConfig {
      blocked_countries: vec!["kp".to_string()],
      ..EdgeConfig::default()
    };
    let blocker = RequestBlocker::from_config(&config).unwrap();
    let request = Request::get(url("/")).with_header(
      HeaderName::from_static("x-vercel-ip-country"),
      HeaderValue::from_static("KP"),
    );
    assert_eq!(
      blocker.check(&request),
      Some(BlockReason::Country("KP".to_string()))
    );
  }

  #[test]
  fn test_invalid_pattern_is_rejected() {
    let config = EdgeConfig {
      blocked_user_agents: vec!["(unclosed".to_string()],
      ..EdgeConfig::default()
    };
    assert!(RequestBlocker::from_config(&config).is_err());
  }
}
