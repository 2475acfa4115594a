//! Subtitle sibling discovery.
//!
//! A sibling shares the video's stem and carries a recognized subtitle
//! extension, optionally with a language tag (`Movie.en.srt`,
//! `Movie.pt-br.ass`). Siblings follow their video between tiers.

use std::path::{Path, PathBuf};

const SUBTITLE_EXTENSIONS: [&str; 7] = ["srt", "ass", "ssa", "sub", "idx", "vtt", "smi"];

/// Language tags are short segments like "en", "eng", "pt-br".
fn is_language_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 8
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Whether `candidate` is a subtitle sibling of a video with `stem`.
fn matches_stem(candidate: &str, stem: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('.') else {
        return false;
    };

    let parts: Vec<&str> = rest.split('.').collect();
    match parts.as_slice() {
        [ext] => SUBTITLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        [lang, ext] => {
            is_language_tag(lang)
                && SUBTITLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => false,
    }
}

/// Subtitle files next to `video` that share its stem, sorted by name.
///
/// Errors listing the directory degrade to an empty result: a missing
/// sibling is never worth failing the video transfer for.
#[must_use]
pub fn find_siblings(video: &Path) -> Vec<PathBuf> {
    let Some(parent) = video.parent() else {
        return Vec::new();
    };
    let Some(stem) = video.file_stem().and_then(|s| s.to_str()) else {
        return Vec::new();
    };

    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %parent.display(), error = %e, "Could not list directory for siblings");
            return Vec::new();
        }
    };

    let mut siblings: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path() != video)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| matches_stem(name, stem))
        })
        .map(|entry| entry.path())
        .collect();
    siblings.sort();
    siblings
}
