//! Candidate parser for plain-text proxy lists

use crate::proxy::models::{Proxy, RawCandidate};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Regex pattern for `scheme://host:port` entries
static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks4a?|socks5h?)://([^:/\s]+):(\d{1,5})/?$")
        .expect("Invalid proxy URL regex")
});

/// Regex pattern to match IP:PORT patterns in free-form text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Parser turning text lists into raw candidates
pub struct CandidateParser;

impl CandidateParser {
    /// Parse a single line
    ///
    /// Supports formats:
    /// - HOST:PORT
    /// - scheme://HOST:PORT
    ///
    /// The port is kept as text; range checks happen when the candidate is
    /// converted into a [`Proxy`].
    pub fn parse_line(line: &str) -> Option<RawCandidate> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(caps) = URL_REGEX.captures(line) {
            return Some(RawCandidate::new(&caps[2], &caps[3]).with_protocol(&caps[1]));
        }

        let (host, port) = line.split_once(':')?;
        if host.is_empty() || port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(RawCandidate::new(host, port))
    }

    /// Parse candidates from a string (multiple lines)
    ///
    /// Falls back to scanning for `IPv4:port` pairs when no line parses on
    /// its own, which covers lists embedded in other text.
    pub fn parse_string(content: &str) -> Vec<RawCandidate> {
        let candidates: Vec<_> = content.lines().filter_map(Self::parse_line).collect();
        if candidates.is_empty() {
            Self::extract_with_regex(content)
        } else {
            candidates
        }
    }

    /// Parse candidates from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<RawCandidate>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse_string(&content))
    }

    /// Extract candidates using regex pattern matching
    pub fn extract_with_regex(content: &str) -> Vec<RawCandidate> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                let port = cap.get(2)?.as_str();

                let valid_octets = host
                    .split('.')
                    .all(|part| part.parse::<u8>().is_ok());
                if !valid_octets {
                    return None;
                }

                Some(RawCandidate::new(host, port))
            })
            .collect()
    }

    /// Render proxies as newline-delimited `host:port` text
    pub fn render(proxies: &[Proxy]) -> String {
        proxies
            .iter()
            .map(Proxy::full)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_format() {
        let raw = CandidateParser::parse_line("192.168.1.1:8080").unwrap();
        assert_eq!(raw.host, "192.168.1.1");
        assert_eq!(raw.port, "8080");
        assert!(raw.protocol.is_none());
    }

    #[test]
    fn test_parse_url_format_socks5() {
        let raw = CandidateParser::parse_line("socks5://192.168.1.1:1080").unwrap();
        assert_eq!(raw.host, "192.168.1.1");
        assert_eq!(raw.port, "1080");
        assert_eq!(raw.protocol.as_deref(), Some("socks5"));
    }

    #[test]
    fn test_parse_hostname() {
        let raw = CandidateParser::parse_line("proxy.example.com:3128").unwrap();
        assert_eq!(raw.host, "proxy.example.com");
    }

    #[test]
    fn test_parse_empty_and_comment_lines() {
        assert!(CandidateParser::parse_line("").is_none());
        assert!(CandidateParser::parse_line("# This is a comment").is_none());
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(CandidateParser::parse_line("invalid").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:abc").is_none());
        assert!(CandidateParser::parse_line("192.168.1.1:8080:user:pass").is_none());
    }

    #[test]
    fn test_parse_string() {
        let content = r#"
192.168.1.1:8080
# This is a comment
http://192.168.1.3:8080
"#;
        let candidates = CandidateParser::parse_string(content);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_parse_string_falls_back_to_regex() {
        let content = "<td>proxy</td> Some text with 10.0.0.1:3128 embedded, and 999.1.1.1:80";
        let candidates = CandidateParser::parse_string(content);
        assert_eq!(candidates, vec![RawCandidate::new("10.0.0.1", "3128")]);
    }

    #[test]
    fn test_render() {
        let proxies = vec![Proxy::new("1.1.1.1", 80), Proxy::new("2.2.2.2", 8080)];
        assert_eq!(CandidateParser::render(&proxies), "1.1.1.1:80\n2.2.2.2:8080");
    }
}
