use crate::context::Submission;
use mailq::Envelope;
use std::collections::HashMap;

/// Split one submitted message into per-destination-host envelopes.
/// Recipients are bucketed by the text after the first `@`; within each
/// envelope they keep their submission order. The order of the envelopes
/// themselves is unspecified.
pub fn group_by_host(msg: &Submission) -> Vec<Envelope> {
    let mut hosts: HashMap<String, Vec<String>> = HashMap::new();

    for to in &msg.to {
        let Some((_, host)) = to.split_once('@') else {
            continue;
        };
        hosts.entry(host.to_string()).or_default().push(to.clone());
    }

    hosts
        .into_iter()
        .map(|(host, to)| Envelope::new(host, msg.from.clone(), to, msg.data.clone()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn submission(to: &[&str]) -> Submission {
        Submission {
            from: "s".to_string(),
            to: to.iter().map(|s| s.to_string()).collect(),
            data: b"body".to_vec(),
        }
    }

    #[test]
    fn buckets_by_host_preserving_recipient_order() {
        let grouped = group_by_host(&submission(&["a@h1", "b@h2", "c@h1"]));
        k9::assert_equal!(grouped.len(), 2);

        let by_host: HashMap<&str, &Envelope> =
            grouped.iter().map(|env| (env.host.as_str(), env)).collect();

        let h1 = by_host["h1"];
        k9::assert_equal!(h1.to, vec!["a@h1".to_string(), "c@h1".to_string()]);
        k9::assert_equal!(h1.from, "s");
        k9::assert_equal!(h1.data, b"body".to_vec());
        k9::assert_equal!(h1.retry, 0);

        let h2 = by_host["h2"];
        k9::assert_equal!(h2.to, vec!["b@h2".to_string()]);
        k9::assert_equal!(h2.from, "s");
        k9::assert_equal!(h2.data, b"body".to_vec());
    }

    #[test]
    fn single_host_yields_single_envelope() {
        let grouped = group_by_host(&submission(&["x@h", "y@h"]));
        k9::assert_equal!(grouped.len(), 1);
        k9::assert_equal!(grouped[0].to, vec!["x@h".to_string(), "y@h".to_string()]);
    }

    #[test]
    fn one_envelope_per_distinct_host() {
        let grouped = group_by_host(&submission(&["a@h1", "b@h2", "c@h3"]));
        let mut hosts: Vec<&str> = grouped.iter().map(|env| env.host.as_str()).collect();
        hosts.sort();
        k9::assert_equal!(hosts, vec!["h1", "h2", "h3"]);
    }
}
