// ABOUTME: Rule table backed by the iptables command line tool
// ABOUTME: Runs iptables against the filter table and parses its -S listing

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use super::{IsolationRule, RuleTable};
use crate::{ContainerError, Result};

const TABLE: &str = "filter";

/// Message iptables prints when a chain does not exist.
const NO_CHAIN: &str = "No chain/target/match by that name";

pub struct IptablesRuleTable {
    binary: String,
}

impl IptablesRuleTable {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<std::result::Result<String, String>> {
        debug!("{} -t {} {}", self.binary, TABLE, args.join(" "));

        let output = Command::new(&self.binary)
            .arg("-t")
            .arg(TABLE)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                error!("Failed to run {}: {}", self.binary, e);
                ContainerError::PacketFilter(format!("unable to run {}: {}", self.binary, e))
            })?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    async fn run_checked(&self, args: Vec<String>) -> Result<String> {
        self.run(&args).await?.map_err(|stderr| {
            ContainerError::PacketFilter(format!("{} {}: {}", self.binary, args.join(" "), stderr))
        })
    }
}

impl Default for IptablesRuleTable {
    fn default() -> Self {
        Self::new("iptables")
    }
}

/// Rules of `chain` in `-S` output, one per `-A` line so positions match the table's numbering.
fn parse_listing(listing: &str, chain: &str) -> Vec<IsolationRule> {
    listing
        .lines()
        .filter_map(|line| IsolationRule::parse(line, chain))
        .collect()
}

#[async_trait]
impl RuleTable for IptablesRuleTable {
    async fn list_rules(&self, chain: &str) -> Result<Option<Vec<IsolationRule>>> {
        let args = vec!["-S".to_string(), chain.to_string()];
        match self.run(&args).await? {
            Ok(listing) => Ok(Some(parse_listing(&listing, chain))),
            Err(stderr) if stderr.contains(NO_CHAIN) => Ok(None),
            Err(stderr) => Err(ContainerError::PacketFilter(format!(
                "unable to list {}: {}",
                chain, stderr
            ))),
        }
    }

    async fn new_chain(&self, chain: &str) -> Result<()> {
        self.run_checked(vec!["-N".to_string(), chain.to_string()])
            .await
            .map(|_| ())
    }

    async fn insert_rule(&self, chain: &str, position: usize, rule: &IsolationRule) -> Result<()> {
        let mut args = vec!["-I".to_string(), chain.to_string(), position.to_string()];
        args.extend(rule.to_args());
        self.run_checked(args).await.map(|_| ())
    }

    async fn delete_rule(&self, chain: &str, position: usize) -> Result<()> {
        self.run_checked(vec![
            "-D".to_string(),
            chain.to_string(),
            position.to_string(),
        ])
        .await
        .map(|_| ())
    }
}
