use log::debug;
use semver::Version;

use crate::registry::PublishedTag;

/// Parse a version the way it appears in tags and manifests.
///
/// `major.minor` is accepted and read as `major.minor.0`.
pub fn parse_version(version: &str) -> Option<Version> {
    let version = version.trim();
    Version::parse(version).ok().or_else(|| {
        let (major, minor) = version.split_once('.')?;
        Some(Version::new(major.parse().ok()?, minor.parse().ok()?, 0))
    })
}

/// Highest published version of `image_name`, or `0.0.0` if there is none.
/// Versions that do not parse are ignored.
pub fn latest_version(published: &[PublishedTag], image_name: &str) -> Version {
    published
        .iter()
        .filter(|tag| tag.name == image_name)
        .filter_map(|tag| parse_version(&tag.semver))
        .max()
        .unwrap_or_else(|| Version::new(0, 0, 0))
}

/// Decide whether `declared` warrants a new build.
///
/// Builds when the declared version is strictly greater than the latest
/// published one. A declared `0.0.0` always builds.
pub fn should_build(declared: &Version, published: &[PublishedTag], image_name: &str) -> bool {
    let zero = Version::new(0, 0, 0);
    let latest = latest_version(published, image_name);
    debug!("Latest published version of {image_name} is {latest}, declared {declared}");
    *declared == zero || *declared > latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::parse_tags;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn newer_version_builds() {
        let published = parse_tags(["svc-1.9.0"]);
        assert!(should_build(&v("2.0.0"), &published, "svc"));
    }

    #[test]
    fn same_version_skips() {
        let published = parse_tags(["svc-1.0.0"]);
        assert!(!should_build(&v("1.0.0"), &published, "svc"));
    }

    #[test]
    fn older_version_skips() {
        let published = parse_tags(["svc-1.0.0", "svc-1.2.0"]);
        assert!(!should_build(&v("1.1.0"), &published, "svc"));
    }

    #[test]
    fn zero_version_always_builds() {
        let published = parse_tags(["svc-0.0.0", "svc-3.0.0"]);
        assert!(should_build(&v("0.0.0"), &published, "svc"));
    }

    #[test]
    fn nothing_published_builds() {
        assert!(should_build(&v("0.0.1"), &[], "svc"));
    }

    #[test]
    fn numeric_not_lexicographic_ordering() {
        let published = parse_tags(["svc-9.0.0"]);
        assert!(should_build(&v("10.0.0"), &published, "svc"));

        let published = parse_tags(["svc-10.0.0", "svc-9.0.0"]);
        assert_eq!(latest_version(&published, "svc"), v("10.0.0"));
        assert!(!should_build(&v("9.5.0"), &published, "svc"));
    }

    #[test]
    fn other_images_are_ignored() {
        let published = parse_tags(["other-5.0.0", "svc-1.0.0"]);
        assert_eq!(latest_version(&published, "svc"), v("1.0.0"));
        assert!(should_build(&v("1.0.1"), &published, "svc"));
    }

    #[test]
    fn unparseable_versions_count_as_zero() {
        let published = parse_tags(["svc-latest", "svc-x.y"]);
        assert_eq!(latest_version(&published, "svc"), Version::new(0, 0, 0));
        assert!(should_build(&v("0.0.1"), &published, "svc"));
    }

    #[test]
    fn two_component_versions() {
        assert_eq!(parse_version("1.4"), Some(Version::new(1, 4, 0)));
        assert_eq!(parse_version("1"), None);
        assert_eq!(parse_version("one.two"), None);
    }
}
