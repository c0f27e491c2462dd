use std::str::FromStr;

use super::*;
use crate::error::Result;

fn subnet(s: &str) -> IpNet {
    IpNet::from_str(s).unwrap()
}

fn ip(s: &str) -> IpAddr {
    IpAddr::from_str(s).unwrap()
}

#[test]
fn test_filter_empty_defaults() -> Result<()> {
    assert!(Filter::default().allows(ip("10.0.0.1")));
    assert!(!Filter::new(vec![], Action::Deny).allows(ip("10.0.0.1")));
    assert!(Filter::new(vec![], Action::Pass).allows(ip("10.0.0.1")));

    Ok(())
}

#[test]
fn test_filter_first_match_wins() -> Result<()> {
    let f = Filter::new(
        vec![
            Rule::new(subnet("10.1.0.0/24"), Action::Allow),
            Rule::new(subnet("10.0.0.0/8"), Action::Deny),
        ],
        Action::Allow,
    );

    assert!(f.allows(ip("10.1.0.7")), "narrow allow listed first");
    assert!(!f.allows(ip("10.2.0.7")), "wider deny catches the rest");
    assert!(f.allows(ip("192.168.1.1")), "unmatched falls to default");

    Ok(())
}

#[test]
fn test_filter_pass_continues() -> Result<()> {
    let f = Filter::new(
        vec![
            Rule::new(subnet("0.0.0.0/0"), Action::Pass),
            Rule::new(subnet("172.16.0.0/12"), Action::Deny),
        ],
        Action::Allow,
    );

    assert!(!f.allows(ip("172.16.5.5")), "pass must not shadow later rules");
    assert!(f.allows(ip("8.8.8.8")));

    Ok(())
}

#[test]
fn test_filter_ipv6() -> Result<()> {
    let f = Filter::new(
        vec![Rule::new(subnet("fd00::/8"), Action::Deny)],
        Action::Allow,
    );

    assert!(!f.allows(ip("fd12::1")));
    assert!(f.allows(ip("2001:db8::1")));

    Ok(())
}
