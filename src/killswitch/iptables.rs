//! iptables backend for the killswitch.
//!
//! Rules are handled as argument vectors in the normalized form printed by
//! `iptables -S` (without the leading `-A <chain>`), so the installed rule
//! set can be compared token for token with the canonical one.

use std::time::Duration;

use tracing::debug;

use super::error::KillswitchResult;
use super::Firewall;
use crate::process::{CommandOutput, run_command};

/// Table holding the killswitch.
const TABLE: &str = "filter";

/// A rule as its argument tokens.
pub type Rule = Vec<String>;

/// Firewall driven through the `iptables` command.
#[derive(Debug, Clone)]
pub struct Iptables {
    timeout: Duration,
}

impl Iptables {
    /// Run each iptables call with `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, args: &[&str]) -> KillswitchResult<CommandOutput> {
        let mut full = vec!["-w", "-t", TABLE];
        full.extend_from_slice(args);
        Ok(run_command("iptables", &full, self.timeout).await?)
    }

    async fn run_checked(&self, args: &[&str]) -> KillswitchResult<()> {
        self.run(args).await?.check()?;
        Ok(())
    }
}

fn refs(rule: &[String]) -> Vec<&str> {
    rule.iter().map(String::as_str).collect()
}

impl Firewall for Iptables {
    async fn chain_rules(&mut self, chain: &str) -> KillswitchResult<Option<Vec<Rule>>> {
        let output = self.run(&["-S", chain]).await?;
        listing_result(chain, output)
    }

    async fn has_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<bool> {
        let mut args = vec!["-C", chain];
        args.extend(refs(rule));
        Ok(self.run(&args).await?.success())
    }

    async fn create_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        self.run_checked(&["-N", chain]).await
    }

    async fn append_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()> {
        let mut args = vec!["-A", chain];
        args.extend(refs(rule));
        self.run_checked(&args).await
    }

    async fn insert_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()> {
        let mut args = vec!["-I", chain, "1"];
        args.extend(refs(rule));
        self.run_checked(&args).await
    }

    async fn delete_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()> {
        let mut args = vec!["-D", chain];
        args.extend(refs(rule));
        self.run_checked(&args).await
    }

    async fn flush_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        self.run_checked(&["-F", chain]).await
    }

    async fn delete_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        self.run_checked(&["-X", chain]).await
    }

    async fn rename_chain(&mut self, from: &str, to: &str) -> KillswitchResult<()> {
        self.run_checked(&["-E", from, to]).await
    }
}

/// What iptables prints when asked about a chain that does not exist.
const NO_SUCH_CHAIN: &str = "No chain/target/match by that name";

/// Interpret `iptables -S <chain>`. Only a missing chain lists as `None`;
/// lock timeouts and permission errors are returned.
fn listing_result(chain: &str, output: CommandOutput) -> KillswitchResult<Option<Vec<Rule>>> {
    if !output.success() && output.stderr.contains(NO_SUCH_CHAIN) {
        debug!("Chain {} not present", chain);
        return Ok(None);
    }
    let output = output.check()?;
    Ok(Some(parse_chain_listing(chain, &output.stdout)))
}

/// Extract `chain`'s rules from `iptables -S <chain>` output.
pub fn parse_chain_listing(chain: &str, output: &str) -> Vec<Rule> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some("-A"), Some(name)) if name == chain => {
                    Some(tokens.map(str::to_string).collect())
                }
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::killswitch::KillswitchError;
    use crate::process::CommandError;

    #[test]
    fn test_parse_chain_listing() {
        let output = "-N PORTKEEPER-KS\n\
                      -A PORTKEEPER-KS -o lo -j ACCEPT\n\
                      -A PORTKEEPER-KS -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT\n\
                      -A PORTKEEPER-KS -o wg0 -j ACCEPT\n\
                      -A PORTKEEPER-KS -j DROP\n";

        let rules = parse_chain_listing("PORTKEEPER-KS", output);
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0], vec!["-o", "lo", "-j", "ACCEPT"]);
        assert_eq!(rules[3], vec!["-j", "DROP"]);
    }

    #[test]
    fn test_parse_empty_chain() {
        assert!(parse_chain_listing("PORTKEEPER-KS", "-N PORTKEEPER-KS\n").is_empty());
    }

    #[test]
    fn test_parse_ignores_other_chains() {
        let output = "-P OUTPUT ACCEPT\n-A OUTPUT -m owner --uid-owner 1000 -j PORTKEEPER-KS\n";
        assert!(parse_chain_listing("PORTKEEPER-KS", output).is_empty());
        assert_eq!(parse_chain_listing("OUTPUT", output).len(), 1);
    }

    fn exited(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            cmd: "iptables -w -t filter -S PORTKEEPER-KS".to_string(),
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_missing_chain_is_none() {
        let output = exited(1, "", "iptables: No chain/target/match by that name.\n");
        assert!(listing_result("PORTKEEPER-KS", output).unwrap().is_none());
    }

    #[test]
    fn test_lock_timeout_is_an_error() {
        let output = exited(
            4,
            "",
            "Another app is currently holding the xtables lock. Stopped waiting after 10s.\n",
        );
        let err = listing_result("PORTKEEPER-KS", output).unwrap_err();
        assert!(matches!(err, KillswitchError::Command(CommandError::Failed { code: 4, .. })));
    }

    #[test]
    fn test_permission_denied_is_an_error() {
        let output = exited(
            4,
            "",
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)\n",
        );
        assert!(listing_result("PORTKEEPER-KS", output).is_err());
    }

    #[test]
    fn test_listing_is_parsed() {
        let output = exited(0, "-N PORTKEEPER-KS\n-A PORTKEEPER-KS -j DROP\n", "");
        let rules = listing_result("PORTKEEPER-KS", output).unwrap().unwrap();
        assert_eq!(rules, vec![vec!["-j".to_string(), "DROP".to_string()]]);
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN and iptables"]
    async fn test_missing_chain_lists_as_none() {
        let mut fw = Iptables::new(Duration::from_secs(10));
        let rules = fw.chain_rules("PORTKEEPER-NOPE").await.unwrap();
        assert!(rules.is_none());
    }
}
