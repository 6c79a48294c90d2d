//! Charset selection for recipient addresses.
//!
//! Japanese mobile carriers expect their own Shift_JIS variants, so
//! recipients on those domains get a separate DATA transmission.

use crate::types::Address;

/// Charset used for every address outside the carrier domains.
pub const DEFAULT_CHARSET: &str = "UTF-8";

const DOCOMO: &[&str] = &[
    "docomo.ne.jp",
    "dwmail.jp",
    "pdx.ne.jp",
    "willcom.com",
    "emnet.ne.jp",
];
const SOFTBANK: &[&str] = &[
    "softbank.ne.jp",
    "vodafone.ne.jp",
    "disney.ne.jp",
    "vertuclub.ne.jp",
];
const KDDI: &[&str] = &["ezweb.ne.jp", "ido.ne.jp"];

/// Returns the carrier variant name for an address, if any.
#[must_use]
pub fn jis_variant(address: &str) -> Option<&'static str> {
    let in_any = |domains: &[&str]| domains.iter().any(|d| is_in_domain(address, d));
    if in_any(DOCOMO) {
        Some("docomo")
    } else if in_any(SOFTBANK) {
        Some("softbank")
    } else if in_any(KDDI) {
        Some("kddi")
    } else {
        None
    }
}

/// Returns the charset the message should use for this recipient.
#[must_use]
pub fn charset_for_address(address: &Address) -> String {
    jis_variant(address.as_str()).map_or_else(
        || DEFAULT_CHARSET.to_string(),
        |variant| format!("x-{variant}-shift_jis-2007"),
    )
}

/// Splits recipients into charset groups, keeping first-seen order.
#[must_use]
pub fn group_by_charset(addresses: Vec<Address>) -> Vec<(String, Vec<Address>)> {
    let mut groups: Vec<(String, Vec<Address>)> = Vec::new();
    for address in addresses {
        let charset = charset_for_address(&address);
        match groups.iter_mut().find(|(c, _)| *c == charset) {
            Some((_, members)) => members.push(address),
            None => groups.push((charset, vec![address])),
        }
    }
    groups
}

/// `address` is `domain` itself or sits in a subdomain of it.
fn is_in_domain(address: &str, domain: &str) -> bool {
    let address = address.to_ascii_lowercase();
    let Some(index) = address.len().checked_sub(domain.len() + 1) else {
        return false;
    };
    matches!(address.as_bytes()[index], b'@' | b'.') && address.ends_with(domain)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_default_charset() {
        assert_eq!(charset_for_address(&addr("user@example.com")), "UTF-8");
    }

    #[test]
    fn test_carrier_domains() {
        assert_eq!(
            charset_for_address(&addr("taro@docomo.ne.jp")),
            "x-docomo-shift_jis-2007"
        );
        assert_eq!(
            charset_for_address(&addr("taro@mail.softbank.ne.jp")),
            "x-softbank-shift_jis-2007"
        );
        assert_eq!(
            charset_for_address(&addr("taro@EZWEB.NE.JP")),
            "x-kddi-shift_jis-2007"
        );
    }

    #[test]
    fn test_lookalike_domain_is_not_a_carrier() {
        assert_eq!(jis_variant("taro@notdocomo.ne.jp"), None);
        assert_eq!(jis_variant("ne.jp"), None);
    }

    #[test]
    fn test_grouping_keeps_order() {
        let groups = group_by_charset(vec![
            addr("a@example.com"),
            addr("b@docomo.ne.jp"),
            addr("c@example.org"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "UTF-8");
        assert_eq!(
            groups[0].1,
            vec![addr("a@example.com"), addr("c@example.org")]
        );
        assert_eq!(groups[1].0, "x-docomo-shift_jis-2007");
        assert_eq!(groups[1].1, vec![addr("b@docomo.ne.jp")]);
    }

    #[test]
    fn test_empty_grouping() {
        assert!(group_by_charset(Vec::new()).is_empty());
    }
}
