//! FFmpeg profile resolver.
//!
//! Selects the argv template for a (stream, client kind) pair and performs
//! `[URL]` substitution. The resolver never invents arguments; every token the
//! operator wrote survives bit-for-bit except the exact `[URL]` placeholder.

use axum::http::HeaderMap;

use crate::db::models::{ClientKind, ClientProfile, Stream};
use crate::db::{Repository, RepositoryError};

use super::detect::UpstreamKind;

/// Error types for template resolution.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("bad template: {0}")]
    BadTemplate(String),

    #[error("no usable client entry in any profile")]
    NoClientEntry,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Detect the Plex client family from request headers.
///
/// Plex clients identify themselves through `X-Plex-*` headers and the
/// user agent; anything unrecognized is treated as a web browser.
pub fn detect_client_kind(headers: &HeaderMap) -> ClientKind {
    let signal = [
        "user-agent",
        "x-plex-product",
        "x-plex-platform",
        "x-plex-device-name",
    ]
    .iter()
    .filter_map(|name| headers.get(*name))
    .filter_map(|v| v.to_str().ok())
    .collect::<Vec<_>>()
    .join(" ")
    .to_ascii_lowercase();

    if !signal.contains("plex") {
        return ClientKind::WebBrowser;
    }

    if signal.contains("android") {
        if signal.contains("tv") || signal.contains("androidtv") || signal.contains("bravia") {
            return ClientKind::AndroidTv;
        }
        return ClientKind::AndroidMobile;
    }

    if signal.contains("tvos") || signal.contains("appletv") || signal.contains("apple tv") {
        return ClientKind::AppleTv;
    }

    if signal.contains("ios") || signal.contains("iphone") || signal.contains("ipad") {
        return ClientKind::IosMobile;
    }

    ClientKind::WebBrowser
}

/// Pick the template entry for a stream and client kind.
///
/// Lookup order: the stream's assigned profile, then the default profile's
/// entry for this client, then the default profile's web_browser entry.
pub fn resolve_client_entry(
    repo: &Repository,
    stream: &Stream,
    client: ClientKind,
) -> Result<ClientProfile, ProfileError> {
    if let Some(profile_id) = stream.profile_id {
        match repo.get_ffmpeg_profile(profile_id) {
            Ok(profile) => {
                if let Ok(map) = profile.client_map() {
                    if let Some(entry) = map.get(&client) {
                        return Ok(entry.clone());
                    }
                }
            }
            Err(RepositoryError::NotFound) => {
                tracing::warn!(
                    stream_id = stream.id,
                    profile_id,
                    "assigned profile missing, falling back to default"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    let default = repo.get_default_profile()?;
    let map = default
        .client_map()
        .map_err(|e| ProfileError::BadTemplate(format!("default profile clients: {}", e)))?;

    map.get(&client)
        .or_else(|| map.get(&ClientKind::WebBrowser))
        .cloned()
        .ok_or(ProfileError::NoClientEntry)
}

/// Build the final argv for FFmpeg from a template entry.
///
/// The template is tokenized with shell-style quoting, every token exactly
/// `[URL]` is replaced by the resolved upstream URL, and for HLS upstreams the
/// entry's `hls_args` tokens are inserted right after the `-i <url>` pair.
pub fn build_argv(
    entry: &ClientProfile,
    url: &str,
    upstream: UpstreamKind,
) -> Result<Vec<String>, ProfileError> {
    let tokens = tokenize_template(&entry.ffmpeg_args)?;
    if tokens.is_empty() {
        return Err(ProfileError::BadTemplate("empty ffmpeg_args".into()));
    }

    let mut argv = substitute_url(tokens, url);

    if upstream == UpstreamKind::Hls && !entry.hls_args.trim().is_empty() {
        let extra = tokenize_template(&entry.hls_args)?;
        let insert_at = argv
            .iter()
            .position(|t| t == "-i")
            .map(|i| (i + 2).min(argv.len()))
            .unwrap_or(argv.len());
        for (offset, token) in extra.into_iter().enumerate() {
            argv.insert(insert_at + offset, token);
        }
    }

    Ok(argv)
}

/// Replace every token that is exactly `[URL]` with the resolved URL. All
/// other tokens pass through untouched, including tokens that merely contain
/// the placeholder.
pub fn substitute_url(tokens: Vec<String>, url: &str) -> Vec<String> {
    tokens
        .into_iter()
        .map(|t| if t == "[URL]" { url.to_string() } else { t })
        .collect()
}

/// Tokenize a template by whitespace respecting shell-style quoting.
///
/// Double quotes group and honor backslash escapes; single quotes group
/// literally; an unterminated quote is an operator error.
pub fn tokenize_template(template: &str) -> Result<Vec<String>, ProfileError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ProfileError::BadTemplate(
                                "unterminated single quote".into(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(ProfileError::BadTemplate(
                                    "dangling backslash in double quote".into(),
                                ))
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ProfileError::BadTemplate(
                                "unterminated double quote".into(),
                            ))
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => {
                    has_token = true;
                    current.push(escaped);
                }
                None => return Err(ProfileError::BadTemplate("dangling backslash".into())),
            },
            c if c.is_whitespace() => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            other => {
                has_token = true;
                current.push(other);
            }
        }
    }

    if has_token {
        tokens.push(current);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    // ========================================================================
    // Tokenizer tests
    // ========================================================================

    #[test]
    fn test_tokenize_plain_whitespace() {
        let tokens = tokenize_template("-i [URL]  -c:v copy\t-f mpegts").unwrap();
        assert_eq!(tokens, vec!["-i", "[URL]", "-c:v", "copy", "-f", "mpegts"]);
    }

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize_template(r#"-metadata title="My Channel" -i '[URL]'"#).unwrap();
        assert_eq!(
            tokens,
            vec!["-metadata", "title=My Channel", "-i", "[URL]"]
        );
    }

    #[test]
    fn test_tokenize_escapes() {
        let tokens = tokenize_template(r#"a\ b "c \"d\"""#).unwrap();
        assert_eq!(tokens, vec!["a b", "c \"d\""]);
    }

    #[test]
    fn test_tokenize_unterminated_quote_errors() {
        assert!(tokenize_template("-i \"oops").is_err());
        assert!(tokenize_template("-i 'oops").is_err());
        assert!(tokenize_template("trailing\\").is_err());
    }

    #[test]
    fn test_tokenize_empty_quoted_token() {
        let tokens = tokenize_template(r#"-user_agent "" -i [URL]"#).unwrap();
        assert_eq!(tokens, vec!["-user_agent", "", "-i", "[URL]"]);
    }

    // ========================================================================
    // Substitution tests
    // ========================================================================

    #[test]
    fn test_substitute_exact_token_only() {
        let tokens = vec![
            "-i".to_string(),
            "[URL]".to_string(),
            "prefix[URL]".to_string(),
            "[url]".to_string(),
        ];
        let out = substitute_url(tokens, "http://example/live.m3u8");
        assert_eq!(
            out,
            vec!["-i", "http://example/live.m3u8", "prefix[URL]", "[url]"]
        );
    }

    #[test]
    fn test_substitute_every_occurrence() {
        let tokens = vec!["[URL]".to_string(), "-x".to_string(), "[URL]".to_string()];
        let out = substitute_url(tokens, "u");
        assert_eq!(out, vec!["u", "-x", "u"]);
    }

    // ========================================================================
    // Argv assembly tests
    // ========================================================================

    fn entry(ffmpeg_args: &str, hls_args: &str) -> ClientProfile {
        ClientProfile {
            ffmpeg_args: ffmpeg_args.to_string(),
            hls_args: hls_args.to_string(),
        }
    }

    #[test]
    fn test_build_argv_plain() {
        let argv = build_argv(
            &entry("-hide_banner -i [URL] -f mpegts pipe:1", ""),
            "http://up/live.ts",
            UpstreamKind::Mpegts,
        )
        .unwrap();
        assert_eq!(
            argv,
            vec!["-hide_banner", "-i", "http://up/live.ts", "-f", "mpegts", "pipe:1"]
        );
    }

    #[test]
    fn test_build_argv_inserts_hls_args_after_input() {
        let argv = build_argv(
            &entry("-i [URL] -f mpegts pipe:1", "-live_start_index -3"),
            "http://up/master.m3u8",
            UpstreamKind::Hls,
        )
        .unwrap();
        assert_eq!(
            argv,
            vec![
                "-i",
                "http://up/master.m3u8",
                "-live_start_index",
                "-3",
                "-f",
                "mpegts",
                "pipe:1"
            ]
        );
    }

    #[test]
    fn test_build_argv_skips_hls_args_for_other_kinds() {
        let argv = build_argv(
            &entry("-i [URL] -f mpegts pipe:1", "-live_start_index -3"),
            "http://up/live.ts",
            UpstreamKind::Http,
        )
        .unwrap();
        assert_eq!(argv, vec!["-i", "http://up/live.ts", "-f", "mpegts", "pipe:1"]);
    }

    #[test]
    fn test_build_argv_rejects_empty_template() {
        assert!(build_argv(&entry("   ", ""), "u", UpstreamKind::Http).is_err());
    }

    // ========================================================================
    // Client-kind detection tests
    // ========================================================================

    #[test]
    fn test_detect_android_tv() {
        let h = headers(&[
            ("user-agent", "Plex/9.0 (Linux; Android 12)"),
            ("x-plex-device-name", "AndroidTV"),
        ]);
        assert_eq!(detect_client_kind(&h), ClientKind::AndroidTv);
    }

    #[test]
    fn test_detect_android_mobile() {
        let h = headers(&[("user-agent", "Plex/9.0 (Android 13; Pixel 7)")]);
        assert_eq!(detect_client_kind(&h), ClientKind::AndroidMobile);
    }

    #[test]
    fn test_detect_ios() {
        let h = headers(&[
            ("user-agent", "Plex/8.0"),
            ("x-plex-platform", "iOS"),
        ]);
        assert_eq!(detect_client_kind(&h), ClientKind::IosMobile);
    }

    #[test]
    fn test_detect_apple_tv() {
        let h = headers(&[
            ("user-agent", "Plex/8.0"),
            ("x-plex-platform", "tvOS"),
        ]);
        assert_eq!(detect_client_kind(&h), ClientKind::AppleTv);
    }

    #[test]
    fn test_detect_defaults_to_web_browser() {
        let h = headers(&[("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")]);
        assert_eq!(detect_client_kind(&h), ClientKind::WebBrowser);

        let empty = HeaderMap::new();
        assert_eq!(detect_client_kind(&empty), ClientKind::WebBrowser);
    }

    #[test]
    fn test_detect_non_plex_android_is_web() {
        // Without a Plex marker the platform signals are ignored.
        let h = headers(&[("user-agent", "Dalvik/2.1.0 (Android 13)")]);
        assert_eq!(detect_client_kind(&h), ClientKind::WebBrowser);
    }
}
