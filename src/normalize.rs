//! URL canonicalization applied to every submission before yt-dlp sees it.

use url::Url;

const SHORTS_MARKER: &str = "shorts/";
const WATCH_MARKER: &str = "watch?v=";

/// Rewrites Shorts links (`/shorts/<id>`) and `youtu.be/<id>` links into the
/// canonical `watch?v=<id>` form. Already canonical URLs, and anything that is
/// not a YouTube link, come back unchanged apart from trimming.
pub fn normalize_video_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(parsed) = Url::parse(trimmed) else {
        return trimmed.replacen(SHORTS_MARKER, WATCH_MARKER, 1);
    };
    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return trimmed.to_string();
    };

    let (base, id) = if host == "youtu.be" {
        let id = parsed.path().trim_matches('/');
        ("https://www.youtube.com".to_string(), id.to_string())
    } else if host == "youtube.com" || host.ends_with(".youtube.com") {
        match parsed.path().strip_prefix("/shorts/") {
            Some(rest) => (
                format!("{}://{}", parsed.scheme(), host),
                rest.trim_end_matches('/').to_string(),
            ),
            None => return trimmed.to_string(),
        }
    } else {
        return trimmed.to_string();
    };

    if id.is_empty() || id.contains('/') {
        return trimmed.to_string();
    }

    let mut canonical = format!("{base}/{WATCH_MARKER}{id}");
    for (key, value) in parsed.query_pairs() {
        if key == "v" {
            continue;
        }
        canonical.push('&');
        canonical.push_str(&key);
        if !value.is_empty() {
            canonical.push('=');
            canonical.push_str(&value);
        }
    }
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorts_url_becomes_watch_url() {
        assert_eq!(
            normalize_video_url("https://www.youtube.com/shorts/abc123XYZ"),
            "https://www.youtube.com/watch?v=abc123XYZ"
        );
    }

    #[test]
    fn shorts_url_keeps_query_parameters() {
        assert_eq!(
            normalize_video_url(" https://youtube.com/shorts/abc123?feature=share "),
            "https://youtube.com/watch?v=abc123&feature=share"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_video_url("https://m.youtube.com/shorts/q1w2e3");
        assert_eq!(once, "https://m.youtube.com/watch?v=q1w2e3");
        assert_eq!(normalize_video_url(&once), once);
        let canonical = "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42";
        assert_eq!(normalize_video_url(canonical), canonical);
    }

    #[test]
    fn youtu_be_links_are_expanded() {
        assert_eq!(
            normalize_video_url("https://youtu.be/dQw4w9WgXcQ?si=track"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&si=track"
        );
    }

    #[test]
    fn foreign_urls_are_left_alone() {
        assert_eq!(
            normalize_video_url("https://vimeo.com/shorts/123"),
            "https://vimeo.com/shorts/123"
        );
        assert_eq!(normalize_video_url("not a url shorts/x"), "not a url watch?v=x");
    }
}
