//! Runtime configuration read once at startup: which consistency checks to
//! run (`CINNABAR_CHECK`) and the pack session's tail-window size
//! (`CINNABAR_PACK_WINDOW_SIZE`).

use bitflags::bitflags;

use crate::pack_session::DEFAULT_WINDOW_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CheckFlags: u8 {
        /// Recompute and compare Mercurial manifest node ids.
        const MANIFESTS = 0b01;
        /// Enable the helper's extra internal self-checks.
        const HELPER = 0b10;
    }
}

/// Parse `CINNABAR_CHECK`'s comma-separated token list.
///
/// `all` sets every flag; a bare helper/manifests token sets the matching
/// flag; unrecognized tokens are ignored, matching the original's tolerant
/// parsing (new check names can be added without breaking older scripts
/// that still set them).
pub fn parse_check_flags(value: &str) -> CheckFlags {
    let mut flags = CheckFlags::empty();
    for token in value.split(',') {
        match token.trim() {
            "all" => flags |= CheckFlags::all(),
            "manifests" => flags |= CheckFlags::MANIFESTS,
            "helper" => flags |= CheckFlags::HELPER,
            _ => {}
        }
    }
    flags
}

/// Read `CINNABAR_CHECK` from the environment.
pub fn check_flags_from_env() -> CheckFlags {
    std::env::var("CINNABAR_CHECK")
        .map(|v| parse_check_flags(&v))
        .unwrap_or_else(|_| CheckFlags::empty())
}

/// Parse `CINNABAR_PACK_WINDOW_SIZE`'s byte count, falling back to
/// [`DEFAULT_WINDOW_SIZE`] on anything unset or unparseable.
pub fn parse_window_size(value: &str) -> usize {
    value.trim().parse().unwrap_or(DEFAULT_WINDOW_SIZE)
}

pub fn window_size_from_env() -> usize {
    std::env::var("CINNABAR_PACK_WINDOW_SIZE")
        .map(|v| parse_window_size(&v))
        .unwrap_or(DEFAULT_WINDOW_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_yields_no_flags() {
        assert_eq!(parse_check_flags(""), CheckFlags::empty());
    }

    #[test]
    fn all_sets_every_flag() {
        assert_eq!(parse_check_flags("all"), CheckFlags::all());
    }

    #[test]
    fn individual_tokens_combine() {
        let flags = parse_check_flags("manifests,helper");
        assert!(flags.contains(CheckFlags::MANIFESTS));
        assert!(flags.contains(CheckFlags::HELPER));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        assert_eq!(parse_check_flags("bogus"), CheckFlags::empty());
        assert_eq!(
            parse_check_flags("manifests,bogus"),
            CheckFlags::MANIFESTS
        );
    }

    #[test]
    fn window_size_falls_back_on_garbage() {
        assert_eq!(parse_window_size("not-a-number"), DEFAULT_WINDOW_SIZE);
        assert_eq!(parse_window_size("4096"), 4096);
    }
}
