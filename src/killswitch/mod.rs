//! Firewall killswitch confining the application user to the tunnel.
//!
//! The killswitch owns exactly one chain in the `filter` table:
//!
//! ```text
//! -A OUTPUT -m owner --uid-owner <uid> -j PORTKEEPER-KS
//! -A PORTKEEPER-KS -o lo -j ACCEPT
//! -A PORTKEEPER-KS -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
//! -A PORTKEEPER-KS -o <tunnel> -j ACCEPT
//! -A PORTKEEPER-KS -j DROP
//! ```
//!
//! Requires `CAP_NET_ADMIN`.

mod controller;
mod error;
mod iptables;

pub use controller::{
    CHAIN, InstallOutcome, KillswitchController, KillswitchPolicy, PARENT_CHAIN, STAGING_CHAIN,
};
pub use error::{KillswitchError, KillswitchResult};
pub use iptables::{Iptables, Rule, parse_chain_listing};

/// Low-level operations on the `filter` table.
///
/// Rules are argument vectors in `iptables -S` form without `-A <chain>`.
#[allow(async_fn_in_trait)]
pub trait Firewall {
    /// Rules of `chain`, or `None` if it does not exist.
    async fn chain_rules(&mut self, chain: &str) -> KillswitchResult<Option<Vec<Rule>>>;

    /// Whether `chain` contains `rule`.
    async fn has_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<bool>;

    /// Create an empty chain.
    async fn create_chain(&mut self, chain: &str) -> KillswitchResult<()>;

    /// Append `rule` to `chain`.
    async fn append_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()>;

    /// Insert `rule` at the head of `chain`.
    async fn insert_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()>;

    /// Delete one occurrence of `rule` from `chain`.
    async fn delete_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()>;

    /// Remove every rule of `chain`.
    async fn flush_chain(&mut self, chain: &str) -> KillswitchResult<()>;

    /// Delete an empty, unreferenced chain.
    async fn delete_chain(&mut self, chain: &str) -> KillswitchResult<()>;

    /// Rename a chain; references to it follow.
    async fn rename_chain(&mut self, from: &str, to: &str) -> KillswitchResult<()>;
}
