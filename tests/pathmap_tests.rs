//! Tests for host ↔ executor path mapping.

use pocketlinx::{PathMapper, PathStyle};

fn windows() -> PathMapper {
    PathMapper::new(PathStyle::Windows)
}

#[test]
fn test_drive_letter_lowercased() {
    assert_eq!(windows().to_executor("D:\\Work").unwrap(), "/mnt/d/Work");
    assert_eq!(windows().to_executor("d:\\Work").unwrap(), "/mnt/d/Work");
}

#[test]
fn test_separators_normalized() {
    assert_eq!(
        windows().to_executor("C:\\a\\b\\c.txt").unwrap(),
        "/mnt/c/a/b/c.txt"
    );
    assert_eq!(
        windows().to_executor("C:/a/b/c.txt").unwrap(),
        "/mnt/c/a/b/c.txt"
    );
}

#[test]
fn test_unc_share() {
    assert_eq!(
        windows().to_executor("\\\\fileserver\\projects\\app").unwrap(),
        "/mnt/wsl/fileserver/projects/app"
    );
}

#[test]
fn test_case_of_path_body_preserved() {
    assert_eq!(
        windows().to_executor("C:\\Users\\Dev").unwrap(),
        "/mnt/c/Users/Dev"
    );
}

#[test]
fn test_empty_is_error_not_mangled() {
    assert!(windows().to_executor("").is_err());
    assert!(windows().from_executor("").is_err());
}

#[test]
fn test_relative_forms_rejected() {
    assert!(windows().to_executor("src\\main.rs").is_err());
    assert!(windows().to_executor("C:relative").is_err());
}

#[test]
fn test_identity_style() {
    let m = PathMapper::new(PathStyle::Identity);
    assert_eq!(m.to_executor("/var/lib/data").unwrap(), "/var/lib/data");
    assert_eq!(m.from_executor("/var/lib/data").unwrap(), "/var/lib/data");
    assert!(m.to_executor("relative/path").is_err());
}

// =============================================================================
// Round Trip
// =============================================================================

#[test]
fn test_round_trip_property() {
    // to_executor(from_executor(p)) == p for all valid /mnt/<letter>/ forms.
    let cases = [
        "/mnt/c/Users/dev/project",
        "/mnt/d/Data",
        "/mnt/x",
        "/mnt/wsl/nas/share/deep/path",
    ];
    let m = windows();
    for p in cases {
        let host = m.from_executor(p).unwrap();
        assert_eq!(m.to_executor(&host).unwrap(), p, "round trip of {p}");
    }
}

#[test]
fn test_host_round_trip() {
    let m = windows();
    for p in ["C:\\Users\\dev", "\\\\nas\\share\\x"] {
        let exec = m.to_executor(p).unwrap();
        let back = m.from_executor(&exec).unwrap();
        // Drive letters normalize to lowercase on the way through.
        assert_eq!(back.to_lowercase(), p.to_lowercase());
    }
}

#[test]
fn test_distro_internal_paths_have_no_host_form() {
    assert!(windows().from_executor("/var/lib/pocketlinx/images").is_err());
    assert!(windows().from_executor("/tmp/x").is_err());
}
