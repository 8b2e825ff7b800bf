//! Comparison helpers for WireGuard allowed-IP sets.

use wgmgr_types::IpPrefix;

/// Returns true if two allowed-IP sets contain the same prefixes, ignoring
/// order. Prefixes are compared in network form, so `10.99.0.1/24` equals
/// the `10.99.0.0/24` the kernel reports.
///
/// `None` stands for a peer whose allowed IPs are unknown and only equals
/// another `None`; in particular it never equals an empty set. Sorting is
/// done on owned copies, the inputs are left untouched.
pub fn equal_prefix_sets(a: Option<&[IpPrefix]>, b: Option<&[IpPrefix]>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.len() != b.len() {
                return false;
            }
            sorted(a) == sorted(b)
        }
        _ => false,
    }
}

fn sorted(prefixes: &[IpPrefix]) -> Vec<IpPrefix> {
    let mut owned: Vec<IpPrefix> = prefixes.iter().map(IpPrefix::network).collect();
    owned.sort_unstable();
    owned
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prefixes(items: &[&str]) -> Vec<IpPrefix> {
        items.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_order_does_not_matter() {
        let a = prefixes(&["10.99.0.1/32", "fc00::1/128"]);
        let b = prefixes(&["fc00::1/128", "10.99.0.1/32"]);
        assert!(equal_prefix_sets(Some(&a), Some(&b)));
    }

    #[test]
    fn test_mask_is_compared() {
        let a = prefixes(&["10.99.0.1/32"]);
        let b = prefixes(&["10.99.0.1/24"]);
        assert!(!equal_prefix_sets(Some(&a), Some(&b)));
    }

    #[test]
    fn test_host_bits_are_ignored() {
        let desired = prefixes(&["10.99.0.1/24", "fc00::1/64"]);
        let kernel = prefixes(&["fc00::/64", "10.99.0.0/24"]);
        assert!(equal_prefix_sets(Some(&desired), Some(&kernel)));
        assert!(equal_prefix_sets(Some(&kernel), Some(&desired)));
    }

    #[test]
    fn test_length_mismatch() {
        let a = prefixes(&["10.99.0.1/32", "fc00::1/128"]);
        let b = prefixes(&["10.99.0.1/32"]);
        assert!(!equal_prefix_sets(Some(&a), Some(&b)));
        assert!(!equal_prefix_sets(Some(&b), Some(&a)));
    }

    #[test]
    fn test_different_address() {
        let a = prefixes(&["10.99.0.1/32", "fc00::1/128"]);
        let b = prefixes(&["10.99.0.2/32", "fc00::1/128"]);
        assert!(!equal_prefix_sets(Some(&a), Some(&b)));
    }

    #[test]
    fn test_none_only_equals_none() {
        assert!(equal_prefix_sets(None, None));
        assert!(!equal_prefix_sets(None, Some(&[])));
        assert!(!equal_prefix_sets(Some(&[]), None));
        assert!(equal_prefix_sets(Some(&[]), Some(&[])));
    }

    #[test]
    fn test_inputs_not_reordered() {
        let a = prefixes(&["fc00::1/128", "10.99.0.1/32"]);
        let b = prefixes(&["10.99.0.1/32", "fc00::1/128"]);
        let before = a.clone();
        assert!(equal_prefix_sets(Some(&a), Some(&b)));
        assert_eq!(a, before);
    }
}
