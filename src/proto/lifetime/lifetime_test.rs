use super::*;
use crate::error::Result;

#[test]
fn test_lifetime_string() -> Result<()> {
    let l = Lifetime(Duration::from_secs(10));
    assert_eq!(l.to_string(), "10s", "bad string {l}");
    Ok(())
}

#[test]
fn test_lifetime_add_to() -> Result<()> {
    let mut m = Message::new();
    let l = Lifetime(Duration::from_secs(600));
    l.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut life = Lifetime::default();
    life.get_from(&decoded)?;
    assert_eq!(life, l, "{life} != {l}");

    let m = Message::new();
    let mut life = Lifetime::default();
    assert!(
        life.get_from(&m).is_err(),
        "should fail on an empty message"
    );

    Ok(())
}

#[test]
fn test_lifetime_clamped() -> Result<()> {
    let max = Duration::from_secs(3600);

    let l = Lifetime(Duration::from_secs(7200));
    assert_eq!(l.clamped(max), max, "should clamp to max");

    let l = Lifetime(Duration::from_secs(60));
    assert_eq!(l.clamped(max), Duration::from_secs(60), "should pass through");

    let l = Lifetime(Duration::from_secs(0));
    assert_eq!(l.clamped(max), Duration::from_secs(0), "zero stays zero");

    Ok(())
}
