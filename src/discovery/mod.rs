//! Resource discovery (WebFinger / host-meta)

pub mod webfinger;

use serde::{Deserialize, Serialize};

pub use webfinger::{WebFingerClient, WebFingerConfig};

/// JSON Resource Descriptor, the payload of WebFinger and host-meta
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jrd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<JrdLink>,
}

/// A link within a JRD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JrdLink {
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl Jrd {
    /// First link with the given rel carrying an href
    pub fn link(&self, rel: &str) -> Option<&JrdLink> {
        self.links.iter().find(|l| l.rel == rel && l.href.is_some())
    }

    /// All hrefs with the given rel, in document order
    pub fn hrefs(&self, rel: &str) -> Vec<String> {
        self.links
            .iter()
            .filter(|l| l.rel == rel)
            .filter_map(|l| l.href.clone())
            .collect()
    }
}
