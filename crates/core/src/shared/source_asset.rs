use std::fmt;
use std::path::PathBuf;

use reqwest::Url;

/// Where the bytes of an input video live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceAsset {
    /// A file on the local filesystem.
    File(PathBuf),
    /// An `http://` or `https://` resource whose bytes must be fetched first.
    Remote(String),
    /// A URI with a scheme nothing here knows how to resolve to bytes.
    Unresolvable(String),
}

impl SourceAsset {
    /// Classifies a user-supplied location.
    ///
    /// `file://` URLs become paths, with percent-escapes decoded and a
    /// `localhost` host accepted. File URLs naming another host, and any
    /// other non-HTTP `scheme://`, stay unresolvable so materialization can
    /// reject them.
    pub fn parse(location: &str) -> Self {
        let lower = location.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return SourceAsset::Remote(location.to_string());
        }
        if lower.starts_with("file://") {
            return match Url::parse(location).map(|url| url.to_file_path()) {
                Ok(Ok(path)) => SourceAsset::File(path),
                _ => SourceAsset::Unresolvable(location.to_string()),
            };
        }
        if has_scheme(location) {
            return SourceAsset::Unresolvable(location.to_string());
        }
        SourceAsset::File(PathBuf::from(location))
    }
}

impl From<PathBuf> for SourceAsset {
    fn from(path: PathBuf) -> Self {
        SourceAsset::File(path)
    }
}

impl fmt::Display for SourceAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceAsset::File(path) => write!(f, "{}", path.display()),
            SourceAsset::Remote(url) | SourceAsset::Unresolvable(url) => write!(f, "{url}"),
        }
    }
}

/// `scheme://` with an RFC 3986 scheme. Windows drive letters have no `//`.
fn has_scheme(location: &str) -> bool {
    let Some((scheme, _)) = location.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain_path("clips/a.mov", SourceAsset::File(PathBuf::from("clips/a.mov")))]
    #[case::absolute_path("/tmp/a.mp4", SourceAsset::File(PathBuf::from("/tmp/a.mp4")))]
    #[case::file_url("file:///tmp/a.mp4", SourceAsset::File(PathBuf::from("/tmp/a.mp4")))]
    #[case::file_url_escaped(
        "file:///tmp/my%20clip.mov",
        SourceAsset::File(PathBuf::from("/tmp/my clip.mov"))
    )]
    #[case::file_url_localhost(
        "file://localhost/tmp/a.mov",
        SourceAsset::File(PathBuf::from("/tmp/a.mov"))
    )]
    #[case::file_url_remote_host(
        "file://nas/share/a.mov",
        SourceAsset::Unresolvable("file://nas/share/a.mov".into())
    )]
    #[case::http("http://host/a.mp4", SourceAsset::Remote("http://host/a.mp4".into()))]
    #[case::https_upper("HTTPS://host/a.mp4", SourceAsset::Remote("HTTPS://host/a.mp4".into()))]
    #[case::cloud("icloud://library/123", SourceAsset::Unresolvable("icloud://library/123".into()))]
    #[case::windows_drive(r"C:\clips\a.mov", SourceAsset::File(PathBuf::from(r"C:\clips\a.mov")))]
    fn test_parse(#[case] input: &str, #[case] expected: SourceAsset) {
        assert_eq!(SourceAsset::parse(input), expected);
    }

    #[test]
    fn test_display_round_trips_location() {
        assert_eq!(
            SourceAsset::parse("https://host/a.mp4").to_string(),
            "https://host/a.mp4"
        );
        assert_eq!(SourceAsset::from(PathBuf::from("a.mov")).to_string(), "a.mov");
    }
}
