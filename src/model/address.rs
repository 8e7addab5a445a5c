//! Email address parsing (RFC 5322 §3.4) and normalization for
//! participant comparison.

use std::collections::BTreeSet;

/// A parsed email address.
///
/// # Examples
/// - `"Site Manager <PM@Builder.co.uk>"` → `display_name = "Site Manager"`, `address = "PM@Builder.co.uk"`
/// - `"user@example.com"` → `display_name = ""`, `address = "user@example.com"`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EmailAddress {
    /// Human-readable display name (may be empty).
    pub display_name: String,
    /// The bare email address (`user@domain`), as written.
    pub address: String,
}

impl EmailAddress {
    /// Parse a single email address from a header value.
    ///
    /// Supported formats:
    /// - `"user@domain.com"`
    /// - `"<user@domain.com>"`
    /// - `"Display Name <user@domain.com>"`
    /// - `"\"Display, Name\" <user@domain.com>"`
    ///
    /// If parsing fails, the raw string is stored as `address`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
            if close > open {
                return Self {
                    display_name: strip_quotes(&trimmed[..open]),
                    address: trimmed[open + 1..close].trim().to_string(),
                };
            }
        }

        Self {
            display_name: String::new(),
            address: trimmed.to_string(),
        }
    }

    /// Parse a comma- or semicolon-separated list of addresses.
    ///
    /// Separators inside quotes or angle brackets are ignored:
    /// `"Last, First" <a@b.com>; other@c.com`
    pub fn parse_list(raw: &str) -> Vec<Self> {
        let mut results = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for ch in raw.chars() {
            match ch {
                '"' => {
                    in_quotes = !in_quotes;
                    current.push(ch);
                }
                '<' if !in_quotes => {
                    in_angle = true;
                    current.push(ch);
                }
                '>' if !in_quotes => {
                    in_angle = false;
                    current.push(ch);
                }
                ',' | ';' if !in_quotes && !in_angle => {
                    let addr = Self::parse(&current);
                    if !addr.address.is_empty() {
                        results.push(addr);
                    }
                    current.clear();
                }
                _ => current.push(ch),
            }
        }

        let addr = Self::parse(&current);
        if !addr.address.is_empty() {
            results.push(addr);
        }

        results
    }

    /// Normalized identity of this address: trimmed, lowercased, with
    /// `mailto:` and stray quotes removed. `None` when nothing remains.
    pub fn normalized(&self) -> Option<String> {
        let mut addr = self.address.trim().trim_matches('"').trim().to_lowercase();
        if let Some(rest) = addr.strip_prefix("mailto:") {
            addr = rest.to_string();
        }
        if addr.is_empty() {
            None
        } else {
            Some(addr)
        }
    }
}

/// Normalize a sequence of raw address strings (each may itself be a list)
/// into an ordered set.
pub fn address_set<S: AsRef<str>>(values: &[S]) -> BTreeSet<String> {
    values
        .iter()
        .flat_map(|v| EmailAddress::parse_list(v.as_ref()))
        .filter_map(|a| a.normalized())
        .collect()
}

/// Jaccard overlap of two address sets. Two empty sets are identical.
pub fn overlap_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f64 / union as f64
}

/// Strip surrounding double-quotes and trim whitespace.
fn strip_quotes(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} <{}>", self.display_name, self.address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_and_address() {
        let addr = EmailAddress::parse("Site Manager <PM@Builder.co.uk>");
        assert_eq!(addr.address, "PM@Builder.co.uk");
        assert_eq!(addr.display_name, "Site Manager");
        assert_eq!(addr.normalized().as_deref(), Some("pm@builder.co.uk"));
    }

    #[test]
    fn test_parse_quoted_name() {
        let addr = EmailAddress::parse("\"Last, First\" <user@example.com>");
        assert_eq!(addr.address, "user@example.com");
        assert_eq!(addr.display_name, "Last, First");
    }

    #[test]
    fn test_parse_list_mixed_separators() {
        let list =
            EmailAddress::parse_list("\"Last, First\" <a@b.com>; User Two <c@d.com>, plain@addr.com");
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].display_name, "Last, First");
        assert_eq!(list[1].address, "c@d.com");
        assert_eq!(list[2].address, "plain@addr.com");
    }

    #[test]
    fn test_address_set_dedupes_case() {
        let set = address_set(&["A@X.com", "a@x.com, B <b@x.com>", "mailto:c@x.com"]);
        let v: Vec<&str> = set.iter().map(|s| s.as_str()).collect();
        assert_eq!(v, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_empty_address_is_dropped() {
        assert!(EmailAddress::parse("   ").normalized().is_none());
        assert!(address_set::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_overlap_ratio() {
        let a = address_set(&["a@x.com", "b@x.com"]);
        let b = address_set(&["b@x.com", "c@x.com"]);
        assert!((overlap_ratio(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(overlap_ratio(&BTreeSet::new(), &BTreeSet::new()), 1.0);
    }

    #[test]
    fn test_display() {
        let addr = EmailAddress::parse("Alice <alice@example.com>");
        assert_eq!(addr.to_string(), "Alice <alice@example.com>");
    }
}
