#[cfg(test)]
mod filter_test;

use std::net::IpAddr;

use ipnet::IpNet;

/// Verdict of a single filter rule.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Action {
    Allow,
    Deny,
    /// No opinion; evaluation moves to the next rule.
    Pass,
}

/// A subnet membership test mapped to an [`Action`].
#[derive(Debug, Clone)]
pub struct Rule {
    pub subnet: IpNet,
    pub action: Action,
}

impl Rule {
    pub fn new(subnet: IpNet, action: Action) -> Self {
        Rule { subnet, action }
    }
}

/// Ordered rule list with a default action. The first rule whose subnet
/// contains the address and whose action is not [`Action::Pass`] decides;
/// otherwise the default does. A default of `Pass` behaves as `Allow`.
#[derive(Debug, Clone)]
pub struct Filter {
    rules: Vec<Rule>,
    default_action: Action,
}

impl Default for Filter {
    fn default() -> Self {
        Filter {
            rules: vec![],
            default_action: Action::Allow,
        }
    }
}

impl Filter {
    pub fn new(rules: Vec<Rule>, default_action: Action) -> Self {
        Filter {
            rules,
            default_action,
        }
    }

    /// `true` when `ip` may pass.
    pub fn allows(&self, ip: IpAddr) -> bool {
        for rule in &self.rules {
            if !rule.subnet.contains(&ip) {
                continue;
            }
            match rule.action {
                Action::Allow => return true,
                Action::Deny => return false,
                Action::Pass => continue,
            }
        }

        self.default_action != Action::Deny
    }
}
