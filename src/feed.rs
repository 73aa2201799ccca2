//! Parsers for the public blocklist feed formats accepted by `import`.

use std::path::Path;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeedFormat {
    /// `||domain^` filter lines.
    Adblock,
    /// `0.0.0.0 domain` hosts-file lines.
    Hosts,
}

impl FeedFormat {
    /// Guess the format from the file name: anything mentioning `hosts` is a
    /// hosts file, everything else is treated as an ad-block list.
    pub fn detect(path: &Path) -> Self {
        let is_hosts = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase().contains("hosts"))
            .unwrap_or(false);
        if is_hosts {
            FeedFormat::Hosts
        } else {
            FeedFormat::Adblock
        }
    }
}

pub fn extract_domains(format: FeedFormat, data: &str) -> Vec<String> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match format {
            FeedFormat::Adblock => parse_adblock_line(line),
            FeedFormat::Hosts => parse_hosts_line(line),
        })
        .map(str::to_string)
        .collect()
}

fn parse_adblock_line(line: &str) -> Option<&str> {
    if line.starts_with('!') || line.starts_with('[') {
        return None;
    }
    let line = line.strip_prefix("||").unwrap_or(line);
    let domain = match line.find('^') {
        Some(idx) => &line[..idx],
        None => line,
    };
    (!domain.is_empty()).then_some(domain)
}

fn parse_hosts_line(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    let addr = parts.next()?;
    let domain = parts.next()?;
    matches!(addr, "0.0.0.0" | "127.0.0.1").then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adblock_lines_lose_prefix_and_modifiers() {
        let data = "\
[Adblock Plus]
! Title: multi
# comment

||ads.example.com^
||tracker.example.net^$third-party
plain.example.org
||^
";
        assert_eq!(
            extract_domains(FeedFormat::Adblock, data),
            vec!["ads.example.com", "tracker.example.net", "plain.example.org"]
        );
    }

    #[test]
    fn hosts_lines_need_a_null_route_address() {
        let data = "\
# hosts
127.0.0.1 localhost
0.0.0.0\tads.example.com
0.0.0.0 tracker.example.net # inline
192.168.1.1 router.lan
0.0.0.0
";
        assert_eq!(
            extract_domains(FeedFormat::Hosts, data),
            vec!["localhost", "ads.example.com", "tracker.example.net"]
        );
    }

    #[test]
    fn crlf_input_is_handled() {
        let data = "||a.example.com^\r\n||b.example.com^\r\n";
        assert_eq!(
            extract_domains(FeedFormat::Adblock, data),
            vec!["a.example.com", "b.example.com"]
        );
    }

    #[test]
    fn detect_by_file_name() {
        assert_eq!(FeedFormat::detect(Path::new("/tmp/StevenBlack-hosts")), FeedFormat::Hosts);
        assert_eq!(FeedFormat::detect(Path::new("multi.txt")), FeedFormat::Adblock);
    }
}
