//! Request Classifier
//!
//! Maps a request to the cache and strategy that serve it, or to a bypass.
//! Rules are evaluated in a fixed order and the first match wins:
//!
//! | # | Rule       | Predicate                                              | Result                          |
//! |---|------------|--------------------------------------------------------|---------------------------------|
//! | 1 | Passthrough| non-HTTP scheme or connection upgrade                  | bypass                          |
//! | 2 | Audio      | `/audio/` path segment, audio destination, signed token| audio, cache-first + TTL        |
//! | 3 | Html       | GET accepting `text/html`                              | html, network-first + offline   |
//! | 4 | Api        | configured path prefix or host                         | api, stale-while-revalidate     |
//! | 5 | Static     | image, font, style or script destination               | static, cache-first + TTL       |
//! | 6 | Default    | anything else                                          | default, network-first + cache  |
//!
//! A request that matches both the audio and the html rule is audio.

use crate::cache::CacheKind;
use crate::config::EngineConfig;
use crate::request::{Destination, Method, RequestDescriptor};
use crate::strategy::Strategy;

/// Classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Serve through a cache with a strategy
    Cached { cache: CacheKind, strategy: Strategy },
    /// Forward untouched to the network
    Bypass,
}

impl Classification {
    const fn cached(cache: CacheKind, strategy: Strategy) -> Self {
        Classification::Cached { cache, strategy }
    }

    /// Cache serving the request, if any
    pub fn cache(&self) -> Option<CacheKind> {
        match self {
            Classification::Cached { cache, .. } => Some(*cache),
            Classification::Bypass => None,
        }
    }
}

/// Ordered classification rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Passthrough,
    Audio,
    Html,
    Api,
    Static,
    Default,
}

impl Rule {
    /// Evaluation order
    pub const ORDER: [Rule; 6] = [
        Rule::Passthrough,
        Rule::Audio,
        Rule::Html,
        Rule::Api,
        Rule::Static,
        Rule::Default,
    ];

    /// Outcome when the rule matches
    pub const fn target(&self) -> Classification {
        match self {
            Rule::Passthrough => Classification::Bypass,
            Rule::Audio => Classification::cached(CacheKind::Audio, Strategy::CacheFirstWithTtl),
            Rule::Html => Classification::cached(
                CacheKind::Html,
                Strategy::NetworkFirstWithOfflineFallback,
            ),
            Rule::Api => Classification::cached(CacheKind::Api, Strategy::StaleWhileRevalidate),
            Rule::Static => Classification::cached(CacheKind::Static, Strategy::CacheFirstWithTtl),
            Rule::Default => Classification::cached(
                CacheKind::Default,
                Strategy::NetworkFirstWithCacheFallback,
            ),
        }
    }
}

/// Stateless request classifier
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    api_path_prefixes: Vec<String>,
    api_hosts: Vec<String>,
    signed_token_params: Vec<String>,
}

impl RequestClassifier {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_path_prefixes: config.api_path_prefixes.clone(),
            api_hosts: config
                .api_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            signed_token_params: config.signed_token_params.clone(),
        }
    }

    /// Classify a request
    pub fn classify(&self, request: &RequestDescriptor) -> Classification {
        self.matching_rule(request).target()
    }

    /// First rule matching the request
    pub fn matching_rule(&self, request: &RequestDescriptor) -> Rule {
        Rule::ORDER
            .into_iter()
            .find(|rule| self.matches(*rule, request))
            .unwrap_or(Rule::Default)
    }

    fn matches(&self, rule: Rule, request: &RequestDescriptor) -> bool {
        match rule {
            Rule::Passthrough => Self::is_passthrough(request),
            Rule::Audio => self.is_audio(request),
            Rule::Html => request.method == Method::Get && request.accepts_html(),
            Rule::Api => self.is_api(request),
            Rule::Static => request.destination.is_static_asset(),
            Rule::Default => true,
        }
    }

    fn is_passthrough(request: &RequestDescriptor) -> bool {
        let http = matches!(request.url.scheme(), "http" | "https");
        let upgrade = request
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        !http || upgrade
    }

    fn is_audio(&self, request: &RequestDescriptor) -> bool {
        let audio_segment = request
            .url
            .path_segments()
            .map(|mut segments| segments.any(|s| s == "audio"))
            .unwrap_or(false);
        let signed = request
            .url
            .query_pairs()
            .any(|(name, _)| self.signed_token_params.iter().any(|p| p == name.as_ref()));
        audio_segment || request.destination == Destination::Audio || signed
    }

    fn is_api(&self, request: &RequestDescriptor) -> bool {
        let path = request.url.path();
        if self
            .api_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return true;
        }
        match request.url.host_str() {
            Some(host) => {
                let host = host.to_ascii_lowercase();
                self.api_hosts
                    .iter()
                    .any(|api| host == *api || host.ends_with(&format!(".{}", api)))
            }
            None => false,
        }
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RequestClassifier {
        let config = EngineConfig {
            api_hosts: vec!["data.example.net".to_string()],
            ..Default::default()
        };
        RequestClassifier::new(&config)
    }

    fn get(url: &str) -> RequestDescriptor {
        RequestDescriptor::get(url).unwrap()
    }

    #[test]
    fn test_non_http_schemes_bypass() {
        let c = classifier();
        assert_eq!(c.classify(&get("chrome-extension://abc/script.js")), Classification::Bypass);
        assert_eq!(c.classify(&get("wss://example.com/socket")), Classification::Bypass);
    }

    #[test]
    fn test_websocket_upgrade_bypasses() {
        let req = get("https://example.com/live").with_header("Upgrade", "websocket");
        assert_eq!(classifier().classify(&req), Classification::Bypass);
    }

    #[test]
    fn test_signed_audio_url_ignores_accept_header() {
        let req = get("https://cdn.example.com/audio/clip1?token=abc").with_header("accept", "text/html");
        assert_eq!(
            classifier().classify(&req),
            Classification::Cached {
                cache: CacheKind::Audio,
                strategy: Strategy::CacheFirstWithTtl
            }
        );
    }

    #[test]
    fn test_audio_destination_and_token_param() {
        let c = classifier();
        let by_destination = get("https://cdn.example.com/media/1.mp3").with_destination(Destination::Audio);
        assert_eq!(c.matching_rule(&by_destination), Rule::Audio);

        let by_token = get("https://storage.example.com/object/sign/x.mp3?token=t0k");
        assert_eq!(c.matching_rule(&by_token), Rule::Audio);

        // "audio" must be a whole path segment
        let not_audio = get("https://example.com/audiobooks/list");
        assert_ne!(c.matching_rule(&not_audio), Rule::Audio);
    }

    #[test]
    fn test_html_navigation() {
        let req = RequestDescriptor::navigate("https://example.com/library").unwrap();
        assert_eq!(
            classifier().classify(&req),
            Classification::Cached {
                cache: CacheKind::Html,
                strategy: Strategy::NetworkFirstWithOfflineFallback
            }
        );
    }

    #[test]
    fn test_html_requires_get() {
        let req = RequestDescriptor::new(Method::Post, "https://example.com/form")
            .unwrap()
            .with_header("accept", "text/html");
        assert_eq!(classifier().matching_rule(&req), Rule::Default);
    }

    #[test]
    fn test_api_by_path_and_host() {
        let c = classifier();
        assert_eq!(c.matching_rule(&get("https://example.com/api/tracks")), Rule::Api);
        assert_eq!(c.matching_rule(&get("https://data.example.net/v1/rows")), Rule::Api);
        assert_eq!(c.matching_rule(&get("https://eu.data.example.net/v1/rows")), Rule::Api);
        assert_eq!(c.matching_rule(&get("https://notdata.example.net/v1/rows")), Rule::Default);
    }

    #[test]
    fn test_static_destinations() {
        let c = classifier();
        for destination in [Destination::Image, Destination::Font, Destination::Style, Destination::Script] {
            let req = get("https://example.com/assets/x").with_destination(destination);
            assert_eq!(
                c.classify(&req),
                Classification::Cached {
                    cache: CacheKind::Static,
                    strategy: Strategy::CacheFirstWithTtl
                }
            );
        }
    }

    #[test]
    fn test_default_rule() {
        assert_eq!(
            classifier().classify(&get("https://example.com/data.bin")),
            Classification::Cached {
                cache: CacheKind::Default,
                strategy: Strategy::NetworkFirstWithCacheFallback
            }
        );
    }

    #[test]
    fn test_api_path_wins_over_static_destination() {
        let req = get("https://example.com/api/avatar").with_destination(Destination::Image);
        assert_eq!(classifier().matching_rule(&req), Rule::Api);
    }
}
