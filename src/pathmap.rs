//! # Host → Executor Path Mapping
//!
//! Translates host filesystem paths into paths visible inside the
//! executor, and back.
//!
//! | Host form            | Executor form            |
//! |----------------------|--------------------------|
//! | `C:\work\src`        | `/mnt/c/work/src`        |
//! | `\\host\share\data`  | `/mnt/wsl/host/share/data` |
//! | `/home/me/src` (Linux) | `/home/me/src` (identity) |
//!
//! Drive letters are lowercased and separators normalized. Failures
//! (empty input, relative forms) surface as [`Error::PathMapping`];
//! nothing is silently mangled.
//!
//! [`Error::PathMapping`]: crate::error::Error::PathMapping

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Which mapping rules apply between host and executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// Windows host driving a WSL2 distribution.
    Windows,
    /// Linux host acting as its own executor; paths pass through unchanged.
    Identity,
}

/// Stateless path translator between host and executor views.
#[derive(Debug, Clone, Copy)]
pub struct PathMapper {
    style: PathStyle,
}

impl PathMapper {
    /// Creates a mapper for the given style.
    pub fn new(style: PathStyle) -> Self {
        Self { style }
    }

    /// Returns the mapping style.
    pub fn style(&self) -> PathStyle {
        self.style
    }

    /// Converts a host path to the equivalent executor path.
    ///
    /// The input must already be absolute; callers absolutize against
    /// their own working directory first (the mapper has no CWD).
    pub fn to_executor(&self, path: &str) -> Result<String> {
        if path.is_empty() {
            return Err(Error::PathMapping {
                path: PathBuf::new(),
                reason: "empty path".to_string(),
            });
        }

        match self.style {
            PathStyle::Identity => {
                if !path.starts_with('/') {
                    return Err(Error::PathMapping {
                        path: PathBuf::from(path),
                        reason: "not an absolute path".to_string(),
                    });
                }
                Ok(path.to_string())
            }
            PathStyle::Windows => {
                // UNC: \\host\share\... -> /mnt/wsl/host/share/...
                if let Some(rest) = path.strip_prefix("\\\\") {
                    let joined = rest.replace('\\', "/");
                    return Ok(format!("/mnt/wsl/{}", joined.trim_end_matches('/')));
                }

                // Drive letter: C:\... or C:/...
                let bytes = path.as_bytes();
                if bytes.len() >= 3
                    && bytes[0].is_ascii_alphabetic()
                    && bytes[1] == b':'
                    && (bytes[2] == b'\\' || bytes[2] == b'/')
                {
                    let drive = (bytes[0] as char).to_ascii_lowercase();
                    let rest = path[3..].replace('\\', "/");
                    let rest = rest.trim_end_matches('/');
                    return if rest.is_empty() {
                        Ok(format!("/mnt/{}", drive))
                    } else {
                        Ok(format!("/mnt/{}/{}", drive, rest))
                    };
                }

                Err(Error::PathMapping {
                    path: PathBuf::from(path),
                    reason: "not an absolute drive-letter or UNC path".to_string(),
                })
            }
        }
    }

    /// Converts an executor path back to the host form.
    ///
    /// Only `/mnt/<letter>/…` and `/mnt/wsl/…` forms are reversible in
    /// Windows style; everything else lives purely inside the distro
    /// and has no host-side name.
    pub fn from_executor(&self, path: &str) -> Result<String> {
        if path.is_empty() {
            return Err(Error::PathMapping {
                path: PathBuf::new(),
                reason: "empty path".to_string(),
            });
        }

        match self.style {
            PathStyle::Identity => Ok(path.to_string()),
            PathStyle::Windows => {
                if let Some(rest) = path.strip_prefix("/mnt/wsl/") {
                    return Ok(format!("\\\\{}", rest.replace('/', "\\")));
                }

                let rest = path.strip_prefix("/mnt/").ok_or_else(|| Error::PathMapping {
                    path: PathBuf::from(path),
                    reason: "no host-visible mapping for this executor path".to_string(),
                })?;
                let mut parts = rest.splitn(2, '/');
                let drive = parts.next().unwrap_or_default();
                if drive.len() != 1 || !drive.as_bytes()[0].is_ascii_alphabetic() {
                    return Err(Error::PathMapping {
                        path: PathBuf::from(path),
                        reason: "not a /mnt/<drive>/ path".to_string(),
                    });
                }
                let drive = drive.to_ascii_lowercase();
                match parts.next() {
                    Some(tail) if !tail.is_empty() => {
                        Ok(format!("{}:\\{}", drive, tail.replace('/', "\\")))
                    }
                    _ => Ok(format!("{}:\\", drive)),
                }
            }
        }
    }

    /// Absolutizes a host path against the current working directory,
    /// then maps it into the executor.
    pub fn absolutize_to_executor(&self, path: &Path) -> Result<String> {
        let abs = std::path::absolute(path).map_err(|e| Error::PathMapping {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.to_executor(&abs.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn win() -> PathMapper {
        PathMapper::new(PathStyle::Windows)
    }

    #[test]
    fn test_drive_letter_mapping() {
        assert_eq!(win().to_executor("C:\\work\\src").unwrap(), "/mnt/c/work/src");
        assert_eq!(win().to_executor("d:\\Data").unwrap(), "/mnt/d/Data");
        assert_eq!(win().to_executor("C:/already/slashed").unwrap(), "/mnt/c/already/slashed");
    }

    #[test]
    fn test_drive_root() {
        assert_eq!(win().to_executor("C:\\").unwrap(), "/mnt/c");
    }

    #[test]
    fn test_unc_mapping() {
        assert_eq!(
            win().to_executor("\\\\nas\\share\\projects").unwrap(),
            "/mnt/wsl/nas/share/projects"
        );
    }

    #[test]
    fn test_rejects_relative_and_empty() {
        assert!(win().to_executor("").is_err());
        assert!(win().to_executor("relative\\path").is_err());
        assert!(PathMapper::new(PathStyle::Identity).to_executor("relative").is_err());
    }

    #[test]
    fn test_identity_passthrough() {
        let m = PathMapper::new(PathStyle::Identity);
        assert_eq!(m.to_executor("/srv/data").unwrap(), "/srv/data");
        assert_eq!(m.from_executor("/srv/data").unwrap(), "/srv/data");
    }

    #[test]
    fn test_round_trip_mnt_forms() {
        // to_executor(from_executor(p)) == p for valid /mnt/<letter>/ forms
        for p in ["/mnt/c/work/src", "/mnt/d/Data", "/mnt/c", "/mnt/wsl/nas/share"] {
            let host = win().from_executor(p).unwrap();
            assert_eq!(win().to_executor(&host).unwrap(), p, "round trip of {}", p);
        }
    }

    #[test]
    fn test_from_executor_rejects_internal_paths() {
        assert!(win().from_executor("/var/lib/pocketlinx").is_err());
    }
}
