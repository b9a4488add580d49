use std::sync::RwLock;

use log::warn;

/// Thread-safe, suffix-matched set of hostnames that must not be MITM'd.
/// Readers (the hot path, one check per CONNECT) proceed in parallel;
/// writers (startup bootstrap, self-healing on TLS failure) are
/// serialized against each other and briefly block readers. Entries are
/// never removed during the process lifetime, and duplicates are
/// tolerated rather than deduplicated on insert.
#[derive(Default)]
pub struct ExclusionSet {
    hosts: RwLock<Vec<String>>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(Vec::new()),
        }
    }

    /// True iff some stored entry is a suffix of `host`.
    pub fn contains(&self, host: &str) -> bool {
        let hosts = self.hosts.read().expect("exclusion set lock poisoned");
        hosts.iter().any(|entry| host.ends_with(entry.as_str()))
    }

    pub fn add(&self, host: impl Into<String>) {
        let mut hosts = self.hosts.write().expect("exclusion set lock poisoned");
        hosts.push(host.into());
    }

    pub fn len(&self) -> usize {
        self.hosts.read().expect("exclusion set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses an exclusion-list response body: trims whitespace, skips blank
/// lines and lines whose first non-space character is `#`, and returns
/// the remaining lines.
pub fn parse_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Fetches every configured URL concurrently and adds each parsed host to
/// `set`. Waits for all fetches to finish or fail; a failed fetch is
/// logged and otherwise ignored so the proxy still comes up.
pub async fn bootstrap(client: &reqwest::Client, urls: &[String], set: &ExclusionSet) {
    let fetches = urls.iter().map(|url| fetch_one(client, url, set));
    futures::future::join_all(fetches).await;
}

async fn fetch_one(client: &reqwest::Client, url: &str, set: &ExclusionSet) {
    let body = match client.get(url).send().await {
        Ok(resp) => match resp.error_for_status() {
            Ok(resp) => match resp.text().await {
                Ok(body) => body,
                Err(err) => {
                    warn!("failed to read exclusion list body from {url}: {err}");
                    return;
                }
            },
            Err(err) => {
                warn!("exclusion list fetch from {url} returned an error status: {err}");
                return;
            }
        },
        Err(err) => {
            warn!("failed to fetch exclusion list from {url}: {err}");
            return;
        }
    };

    for host in parse_list(&body) {
        set.add(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_match_contains() {
        let set = ExclusionSet::new();
        set.add("example.com");
        assert!(set.contains("www.example.com"));
        assert!(set.contains("example.com"));
        assert!(!set.contains("example.org"));
    }

    #[test]
    fn add_is_not_deduplicated() {
        let set = ExclusionSet::new();
        set.add("example.com");
        set.add("example.com");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parse_list_skips_blank_and_comment_lines() {
        let body = "# comment\nfoo.test\n\n  bar.test  \n";
        let hosts = parse_list(body);
        assert_eq!(hosts, vec!["foo.test".to_string(), "bar.test".to_string()]);
    }
}
