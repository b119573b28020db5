// ABOUTME: Default-deny network isolation for agreement containers
// ABOUTME: Rule model, chain maintenance over a rule table, and per-container policy application

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deployment::{Service, SINGLETON};
use crate::labels;
use crate::runtime::{ContainerDetail, ContainerSummary};
use crate::{ContainerError, Result};

pub mod iptables;
pub mod permit;

pub use iptables::IptablesRuleTable;
pub use permit::generate_permitted_string;

/// Chain holding every isolation rule.
pub const ISOLATION_CHAIN: &str = "EDGENODE-ISOLATION";

/// Host forwarding chain the isolation chain is spliced into.
pub const FORWARD_CHAIN: &str = "FORWARD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Accept,
    Reject,
    Return,
    Jump(String),
    /// `-g`: continue in `chain` without returning here.
    Goto(String),
    /// No target; the rule only counts matching packets.
    Unspecified,
}

impl RuleTarget {
    fn to_args(&self) -> Vec<String> {
        let (flag, name) = match self {
            RuleTarget::Accept => ("-j", "ACCEPT"),
            RuleTarget::Reject => ("-j", "REJECT"),
            RuleTarget::Return => ("-j", "RETURN"),
            RuleTarget::Jump(chain) => ("-j", chain.as_str()),
            RuleTarget::Goto(chain) => ("-g", chain.as_str()),
            RuleTarget::Unspecified => return Vec::new(),
        };
        vec![flag.to_string(), name.to_string()]
    }

    fn from_name(name: &str) -> Self {
        match name {
            "ACCEPT" => RuleTarget::Accept,
            "REJECT" => RuleTarget::Reject,
            "RETURN" => RuleTarget::Return,
            chain => RuleTarget::Jump(chain.to_string()),
        }
    }
}

/// One filter rule: optional source and destination match, a target and an optional comment tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationRule {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub target: RuleTarget,
    pub comment: Option<String>,
}

impl IsolationRule {
    pub fn new(target: RuleTarget) -> Self {
        Self {
            source: None,
            destination: None,
            target,
            comment: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Rule specification in iptables argument form.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(source) = &self.source {
            args.extend(["-s".to_string(), source.clone()]);
        }
        if let Some(destination) = &self.destination {
            args.extend(["-d".to_string(), destination.clone()]);
        }
        if let Some(comment) = &self.comment {
            args.extend([
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                comment.clone(),
            ]);
        }
        args.extend(self.target.to_args());
        args
    }

    /// Parse one `-A <chain> ...` line of `iptables -S` output.
    ///
    /// Every rule line of `chain` yields a rule, so list positions match the
    /// table's own numbering. Returns `None` for any other line.
    pub fn parse(line: &str, chain: &str) -> Option<Self> {
        let tokens = tokenize(line);
        let mut iter = tokens.iter().map(String::as_str);

        if iter.next() != Some("-A") || iter.next() != Some(chain) {
            return None;
        }

        let mut source = None;
        let mut destination = None;
        let mut comment = None;
        let mut target = RuleTarget::Unspecified;

        while let Some(token) = iter.next() {
            match token {
                "-s" => source = iter.next().map(str::to_string),
                "-d" => destination = iter.next().map(str::to_string),
                "--comment" => comment = iter.next().map(str::to_string),
                // target options such as --reject-with follow and are skipped
                "-j" => {
                    if let Some(name) = iter.next() {
                        target = RuleTarget::from_name(name);
                    }
                }
                "-g" => {
                    if let Some(chain) = iter.next() {
                        target = RuleTarget::Goto(chain.to_string());
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            source,
            destination,
            target,
            comment,
        })
    }

    /// True when every comma-separated component of `tag` appears in the comment.
    pub fn has_tag(&self, tag: &str) -> bool {
        let Some(comment) = &self.comment else {
            return false;
        };
        let components: Vec<&str> = comment.split(',').collect();
        tag.split(',').all(|wanted| components.contains(&wanted))
    }
}

/// Split on whitespace, keeping double-quoted sections together.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Comment tag put on every rule created for an agreement.
pub fn rule_tag(agreement_id: &str, shared: bool) -> String {
    if shared {
        format!(
            "{}={},{}={}",
            labels::AGREEMENT_ID,
            agreement_id,
            labels::SHARED_PATTERN,
            SINGLETON
        )
    } else {
        format!("{}={}", labels::AGREEMENT_ID, agreement_id)
    }
}

/// Raw access to one packet-filter table. Positions are 1-based.
#[async_trait]
pub trait RuleTable: Send + Sync {
    /// Rules of `chain` in order, or `None` when the chain does not exist.
    async fn list_rules(&self, chain: &str) -> Result<Option<Vec<IsolationRule>>>;

    async fn new_chain(&self, chain: &str) -> Result<()>;

    async fn insert_rule(&self, chain: &str, position: usize, rule: &IsolationRule) -> Result<()>;

    async fn delete_rule(&self, chain: &str, position: usize) -> Result<()>;
}

/// Chain-level operations the isolation engine needs.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Create `chain` if missing and make sure it ends in a RETURN rule.
    async fn ensure_chain(&self, chain: &str) -> Result<()>;

    /// Make the first rule of `from` a jump into `to`, removing older jumps.
    async fn ensure_default_jump(&self, from: &str, to: &str) -> Result<()>;

    /// Insert `rule` at the head of `chain`.
    async fn insert_rule(&self, chain: &str, rule: IsolationRule) -> Result<()>;

    /// Delete every rule of `chain` tagged with `tag`, returning how many went.
    async fn delete_rules_by_tag(&self, chain: &str, tag: &str) -> Result<usize>;
}

/// [`PacketFilter`] over any [`RuleTable`].
pub struct ChainFilter {
    table: Arc<dyn RuleTable>,
}

impl ChainFilter {
    pub fn new(table: Arc<dyn RuleTable>) -> Self {
        Self { table }
    }

    async fn delete_positions(&self, chain: &str, mut positions: Vec<usize>) -> Result<()> {
        // from the end so earlier positions stay valid
        positions.sort_unstable();
        for position in positions.into_iter().rev() {
            self.table.delete_rule(chain, position).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PacketFilter for ChainFilter {
    async fn ensure_chain(&self, chain: &str) -> Result<()> {
        let rules = match self.table.list_rules(chain).await? {
            Some(rules) => rules,
            None => {
                info!("Creating packet filter chain {}", chain);
                self.table.new_chain(chain).await?;
                Vec::new()
            }
        };

        if !rules.iter().any(|r| r.target == RuleTarget::Return) {
            debug!("Appending RETURN rule to {}", chain);
            self.table
                .insert_rule(chain, rules.len() + 1, &IsolationRule::new(RuleTarget::Return))
                .await?;
        }
        Ok(())
    }

    async fn ensure_default_jump(&self, from: &str, to: &str) -> Result<()> {
        let rules = self.table.list_rules(from).await?.ok_or_else(|| {
            ContainerError::PacketFilter(format!("chain {} does not exist", from))
        })?;

        let jump = RuleTarget::Jump(to.to_string());
        let existing: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.target == jump && r.source.is_none() && r.destination.is_none())
            .map(|(i, _)| i + 1)
            .collect();

        self.delete_positions(from, existing).await?;
        self.table
            .insert_rule(from, 1, &IsolationRule::new(jump))
            .await
    }

    async fn insert_rule(&self, chain: &str, rule: IsolationRule) -> Result<()> {
        self.table.insert_rule(chain, 1, &rule).await
    }

    async fn delete_rules_by_tag(&self, chain: &str, tag: &str) -> Result<usize> {
        let Some(rules) = self.table.list_rules(chain).await? else {
            return Ok(0);
        };

        let tagged: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_tag(tag))
            .map(|(i, _)| i + 1)
            .collect();

        let count = tagged.len();
        self.delete_positions(chain, tagged).await?;
        Ok(count)
    }
}

/// A container handed to post-create processing.
#[derive(Debug, Clone)]
pub enum PostCreateContainer {
    /// Created during this pass; fully inspected.
    New(ContainerDetail),
    /// Shared container that already existed and is being reused.
    Existing(ContainerSummary),
}

/// Computes and installs the isolation rules of an agreement's containers.
pub struct IsolationEngine {
    filter: Arc<dyn PacketFilter>,
}

impl IsolationEngine {
    pub fn new(filter: Arc<dyn PacketFilter>) -> Self {
        Self { filter }
    }

    /// Idempotent chain setup.
    pub async fn prepare(&self) -> Result<()> {
        self.filter.ensure_chain(ISOLATION_CHAIN).await?;
        self.filter
            .ensure_default_jump(FORWARD_CHAIN, ISOLATION_CHAIN)
            .await
    }

    /// Install rules for the containers processed while creating `agreement_id`.
    ///
    /// New containers with an outbound permit list get a REJECT for their own
    /// address and an ACCEPT above it for the permitted destinations, on every
    /// network they are attached to. Reused shared containers keep their rules;
    /// only ACCEPTs from the new private containers to them are added.
    pub async fn apply(
        &self,
        agreement_id: &str,
        containers: &[PostCreateContainer],
        services: &BTreeMap<String, Service>,
        environment_additions: &std::collections::HashMap<String, String>,
        config_payload: &[u8],
    ) -> Result<()> {
        self.prepare().await?;

        let account_specified =
            environment_additions.contains_key(&edgenode_config::ethereum_account_var());
        let mut new_private_ips = Vec::new();

        for container in containers {
            let PostCreateContainer::New(detail) = container else {
                continue;
            };

            let shared = labels::is_singleton(&detail.labels);
            if !shared {
                new_private_ips.extend(
                    detail
                        .networks
                        .values()
                        .filter(|n| !n.ip_address.is_empty())
                        .map(|n| n.ip_address.clone()),
                );
            }

            let Some(isolation) = labels::service_name(&detail.labels)
                .and_then(|name| services.get(name))
                .and_then(|service| service.network_isolation.as_ref())
                .filter(|isolation| isolation.outbound_permit_only.is_some())
            else {
                continue;
            };

            if isolation.ignores_when_account_specified() && account_specified {
                debug!(
                    "Skipping isolation of {}, blockchain account specified",
                    detail.name
                );
                continue;
            }

            let tag = rule_tag(agreement_id, shared);
            for (network_name, network) in &detail.networks {
                if network.ip_address.is_empty() {
                    warn!(
                        "Container {} has no address on {}, not isolating there",
                        detail.name, network_name
                    );
                    continue;
                }

                let permitted = generate_permitted_string(isolation, network, config_payload)?;
                debug!(
                    "Isolating {} on {}, permitted {}",
                    detail.name, network_name, permitted
                );

                self.filter
                    .insert_rule(
                        ISOLATION_CHAIN,
                        IsolationRule::new(RuleTarget::Reject)
                            .source(network.ip_address.clone())
                            .comment(tag.clone()),
                    )
                    .await?;
                self.filter
                    .insert_rule(
                        ISOLATION_CHAIN,
                        IsolationRule::new(RuleTarget::Accept)
                            .source(network.ip_address.clone())
                            .destination(permitted)
                            .comment(tag.clone()),
                    )
                    .await?;
            }
        }

        let tag = rule_tag(agreement_id, false);
        for container in containers {
            let PostCreateContainer::Existing(summary) = container else {
                continue;
            };

            for network in summary.networks.values() {
                if network.ip_address.is_empty() {
                    continue;
                }
                for source in &new_private_ips {
                    debug!(
                        "Permitting {} to reach shared container at {}",
                        source, network.ip_address
                    );
                    self.filter
                        .insert_rule(
                            ISOLATION_CHAIN,
                            IsolationRule::new(RuleTarget::Accept)
                                .source(source.clone())
                                .destination(network.ip_address.clone())
                                .comment(tag.clone()),
                        )
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Delete every rule tagged with `agreement_id`.
    pub async fn purge(&self, agreement_id: &str) -> Result<usize> {
        let removed = self
            .filter
            .delete_rules_by_tag(ISOLATION_CHAIN, &rule_tag(agreement_id, false))
            .await?;
        if removed > 0 {
            info!(
                "Removed {} isolation rules of agreement {}",
                removed, agreement_id
            );
        }
        Ok(removed)
    }
}
