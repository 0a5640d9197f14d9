use regex::Regex;
use url::Url;

/// Decides which URLs the crawler may fetch.
///
/// A URL is fetchable when its host is allowed (an empty host list allows
/// every host), it matches every allow pattern and it matches no deny pattern.
#[derive(Debug, Clone, Default)]
pub struct FetchRules {
    allowed_hosts: Vec<String>,
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl FetchRules {
    pub fn new(allowed_hosts: Vec<String>, allow: Vec<Regex>, deny: Vec<Regex>) -> Self {
        let allowed_hosts = allowed_hosts
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            allowed_hosts,
            allow,
            deny,
        }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn allows(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if !self.allowed_hosts.is_empty()
            && !self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
        {
            return false;
        }

        let raw = url.as_str();
        self.allow.iter().all(|re| re.is_match(raw)) && !self.deny.iter().any(|re| re.is_match(raw))
    }
}
