pub mod finding;
pub mod recording;
pub mod report;
pub mod scanner;

pub use finding::*;
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, Sanitizer,
    CORRELATION_ID_HEADER,
};
pub use report::{Report, REPORT_MARKER};
pub use scanner::{default_scanners, scan_all, ScanFailure, Scanner};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Version string shown in report footers and the health endpoint.
///
/// Release builds set `DEPWATCH_GIT_HASH`; the short hash is appended to the
/// crate version when it is available.
pub fn service_version() -> String {
    version_string(built_info::PKG_VERSION, option_env!("DEPWATCH_GIT_HASH"))
}

fn version_string(pkg_version: &str, git_hash: Option<&str>) -> String {
    match git_hash {
        Some(git_hash) if !git_hash.is_empty() => {
            let short: String = git_hash.chars().take(8).collect();
            format!("{} ({})", pkg_version, short)
        }
        _ => pkg_version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_shortens_hash() {
        assert_eq!(
            version_string("0.1.0", Some("0123456789abcdef0123456789abcdef01234567")),
            "0.1.0 (01234567)"
        );
        assert_eq!(version_string("0.1.0", Some("abc")), "0.1.0 (abc)");
    }

    #[test]
    fn test_version_string_without_hash() {
        assert_eq!(version_string("0.1.0", None), "0.1.0");
        assert_eq!(version_string("0.1.0", Some("")), "0.1.0");
    }

    #[test]
    fn test_version_string_counts_characters_not_bytes() {
        assert_eq!(
            version_string("0.1.0", Some("ééééééééé")),
            "0.1.0 (éééééééé)"
        );
    }

    #[test]
    fn test_service_version_starts_with_crate_version() {
        assert!(service_version().starts_with(env!("CARGO_PKG_VERSION")));
    }
}
