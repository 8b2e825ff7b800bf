//! Shell command builders for firewall operations

use wgmgr_common::shell::{ShellCommand, IP6TABLES_CMD, IPSET_CMD, IPTABLES_CMD};
use wgmgr_types::IpFamily;

/// Returns the iptables binary for an address family.
pub fn iptables_for(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => IPTABLES_CMD,
        IpFamily::V6 => IP6TABLES_CMD,
    }
}

/// Base iptables invocation. `-w` waits for the xtables lock instead of
/// failing when another process holds it.
fn iptables(family: IpFamily, table: &str) -> ShellCommand {
    ShellCommand::new(iptables_for(family)).args(["-w", "-t", table])
}

/// Build command listing every chain and rule of a table
pub fn build_list_table_cmd(family: IpFamily, table: &str) -> ShellCommand {
    iptables(family, table).arg("-S")
}

/// Build command listing the rules of one chain
///
/// The first line of the output is the chain creation line (`-N CHAIN`).
pub fn build_list_rules_cmd(family: IpFamily, table: &str, chain: &str) -> ShellCommand {
    iptables(family, table).arg("-S").arg(chain)
}

/// Build rule append command
pub fn build_append_rule_cmd(
    family: IpFamily,
    table: &str,
    chain: &str,
    rule: &[String],
) -> ShellCommand {
    iptables(family, table)
        .arg("-A")
        .arg(chain)
        .args(rule.iter().cloned())
}

/// Build rule deletion command
pub fn build_delete_rule_cmd(
    family: IpFamily,
    table: &str,
    chain: &str,
    rule: &[String],
) -> ShellCommand {
    iptables(family, table)
        .arg("-D")
        .arg(chain)
        .args(rule.iter().cloned())
}

/// Build command listing ipset names, one per line
pub fn build_list_sets_cmd() -> ShellCommand {
    ShellCommand::new(IPSET_CMD).args(["list", "-n"])
}
