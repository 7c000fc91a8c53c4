//! Installation, verification and teardown of the killswitch chain.

use tracing::{debug, info, warn};

use super::error::{KillswitchError, KillswitchResult};
use super::iptables::Rule;
use super::Firewall;

/// Name of the dedicated chain.
pub const CHAIN: &str = "PORTKEEPER-KS";

/// Staging chain used while swapping in a rebuilt rule set.
pub const STAGING_CHAIN: &str = "PORTKEEPER-KS-NEW";

/// Built-in chain holding the jump rule.
pub const PARENT_CHAIN: &str = "OUTPUT";

/// Whom to confine and where they may send traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillswitchPolicy {
    /// UID of the confined user.
    pub uid: u32,
    /// The only non-loopback interface the user may egress on.
    pub interface: String,
}

impl KillswitchPolicy {
    /// Resolve `user` to a UID.
    pub fn for_user(user: &str, interface: &str) -> KillswitchResult<Self> {
        let entry = nix::unistd::User::from_name(user)
            .map_err(|source| KillswitchError::UserLookup {
                user: user.to_string(),
                source,
            })?
            .ok_or_else(|| KillswitchError::UnknownUser(user.to_string()))?;
        Ok(Self {
            uid: entry.uid.as_raw(),
            interface: interface.to_string(),
        })
    }

    /// Canonical rules of the chain, in `iptables -S` form.
    pub fn rules(&self) -> Vec<Rule> {
        [
            vec!["-o", "lo", "-j", "ACCEPT"],
            vec![
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
            vec!["-o", self.interface.as_str(), "-j", "ACCEPT"],
            vec!["-j", "DROP"],
        ]
        .into_iter()
        .map(|rule| rule.into_iter().map(str::to_string).collect())
        .collect()
    }

    /// The rule in `OUTPUT` sending this user's traffic to `chain`.
    pub fn jump(&self, chain: &str) -> Rule {
        let uid = self.uid.to_string();
        ["-m", "owner", "--uid-owner", uid.as_str(), "-j", chain]
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// Whether `ensure_installed` had to change anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The canonical chain and jump were already in place.
    Unchanged,
    /// The chain was (re)built and swapped in.
    Installed,
}

/// Owns the one dedicated chain confining the application user.
pub struct KillswitchController<F> {
    firewall: F,
    policy: KillswitchPolicy,
}

impl<F: Firewall> KillswitchController<F> {
    /// Create a controller for `policy`.
    pub fn new(firewall: F, policy: KillswitchPolicy) -> Self {
        Self { firewall, policy }
    }

    /// The policy enforced.
    pub fn policy(&self) -> &KillswitchPolicy {
        &self.policy
    }

    /// Make sure the canonical chain and jump are in place.
    ///
    /// Leaves a correct installation untouched. Otherwise the rule set is
    /// staged in a separate chain, jumped to ahead of the old one, and then
    /// renamed into place, so the user is never without a terminal DROP
    /// once a chain has been installed.
    pub async fn ensure_installed(&mut self) -> KillswitchResult<InstallOutcome> {
        if self.verify().await? {
            debug!("Killswitch chain {} already canonical", CHAIN);
            return Ok(InstallOutcome::Unchanged);
        }

        info!(
            "Installing killswitch: uid {} may only egress via {}",
            self.policy.uid, self.policy.interface
        );
        self.remove_chain(STAGING_CHAIN).await?;

        self.firewall.create_chain(STAGING_CHAIN).await?;
        for rule in self.policy.rules() {
            self.firewall.append_rule(STAGING_CHAIN, &rule).await?;
        }
        self.firewall
            .insert_rule(PARENT_CHAIN, &self.policy.jump(STAGING_CHAIN))
            .await?;

        self.remove_chain(CHAIN).await?;
        // The jump follows the rename.
        self.firewall.rename_chain(STAGING_CHAIN, CHAIN).await?;

        Ok(InstallOutcome::Installed)
    }

    /// Whether the chain holds exactly the canonical rules and the jump to it
    /// is the first rule of `OUTPUT`.
    pub async fn verify(&mut self) -> KillswitchResult<bool> {
        let Some(rules) = self.firewall.chain_rules(CHAIN).await? else {
            debug!("Killswitch chain {} missing", CHAIN);
            return Ok(false);
        };
        if rules != self.policy.rules() {
            debug!("Killswitch chain {} diverges from canonical rules", CHAIN);
            return Ok(false);
        }
        let jump = self.policy.jump(CHAIN);
        let parent = self.firewall.chain_rules(PARENT_CHAIN).await?.unwrap_or_default();
        match parent.iter().position(|rule| *rule == jump) {
            Some(0) => Ok(true),
            Some(pos) => {
                debug!(
                    "Jump rule to {} is rule {} of {}, not the first",
                    CHAIN,
                    pos + 1,
                    PARENT_CHAIN
                );
                Ok(false)
            }
            None => {
                debug!("Jump rule to {} missing from {}", CHAIN, PARENT_CHAIN);
                Ok(false)
            }
        }
    }

    /// Remove the chain, the staging chain and every jump into them.
    ///
    /// Attempts every step and returns the first error.
    pub async fn teardown(&mut self) -> KillswitchResult<()> {
        info!("Removing killswitch");
        let staging = self.remove_chain(STAGING_CHAIN).await;
        let main = self.remove_chain(CHAIN).await;
        staging.and(main)
    }

    /// Drop every jump to `chain`, then flush and delete it.
    async fn remove_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        let jump = self.policy.jump(chain);
        while self.firewall.has_rule(PARENT_CHAIN, &jump).await? {
            self.firewall.delete_rule(PARENT_CHAIN, &jump).await?;
        }

        if self.firewall.chain_rules(chain).await?.is_none() {
            return Ok(());
        }
        if chain == STAGING_CHAIN {
            warn!("Removing stale staging chain {}", chain);
        }
        self.firewall.flush_chain(chain).await?;
        self.firewall.delete_chain(chain).await
    }
}
