//! MX resolution for outbound delivery.

use hickory_resolver::{Name, TokioAsyncResolver};
use serde::Serialize;
use std::sync::LazyLock;

static RESOLVER: LazyLock<TokioAsyncResolver> = LazyLock::new(|| {
    TokioAsyncResolver::tokio_from_system_conf().expect("failed to configure DNS resolver")
});

/// The mail exchangers responsible for a domain, in preference order.
#[derive(Clone, Debug, Serialize)]
pub struct MailExchanger {
    pub domain_name: String,
    /// Exchange hostnames, best preference first. Hosts keep their FQDN
    /// form as returned by DNS (trailing dot included).
    pub hosts: Vec<String>,
}

impl MailExchanger {
    /// Look up the MX records for `domain_name`. An empty or absent
    /// RRset is an error: this relay delivers to explicit MX targets
    /// only, with no implicit fallback to the domain's address records.
    pub async fn resolve(domain_name: &str) -> anyhow::Result<Self> {
        let name = fully_qualify(domain_name)?;

        let mx_lookup = RESOLVER
            .mx_lookup(name.clone())
            .await
            .map_err(|err| anyhow::anyhow!("MX lookup for {domain_name} failed: {err:#}"))?;

        let mut records: Vec<(u16, String)> = mx_lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_lowercase().to_string()))
            .collect();

        if records.is_empty() {
            anyhow::bail!("no MX records found for {domain_name}");
        }

        records.sort();

        let mx = Self {
            domain_name: name.to_string(),
            hosts: records.into_iter().map(|(_, host)| host).collect(),
        };
        tracing::trace!("resolved {domain_name} -> {:?}", mx.hosts);
        Ok(mx)
    }

    /// The primary exchange hostname.
    pub fn primary_host(&self) -> Option<&str> {
        self.hosts.first().map(String::as_str)
    }
}

fn fully_qualify(domain_name: &str) -> anyhow::Result<Name> {
    let mut name = Name::from_str_relaxed(domain_name)
        .map_err(|err| anyhow::anyhow!("{domain_name} is not a valid DNS name: {err}"))?
        .to_lowercase();

    // Treat it as fully qualified
    name.set_fqdn(true);

    Ok(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn qualification_normalizes_case_and_dot() {
        let name = fully_qualify("Example.COM").unwrap();
        k9::assert_equal!(name.to_string(), "example.com.");
        // Labels are limited to 63 octets; longer ones must be rejected.
        let oversized = format!("{}.com", "a".repeat(64));
        assert!(fully_qualify(&oversized).is_err());
    }

    #[test]
    fn primary_host_is_best_preference() {
        let mx = MailExchanger {
            domain_name: "example.com.".to_string(),
            hosts: vec![
                "mx1.example.com.".to_string(),
                "mx2.example.com.".to_string(),
            ],
        };
        k9::assert_equal!(mx.primary_host(), Some("mx1.example.com."));
    }
}
