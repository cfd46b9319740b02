//! Locations on either side of a transfer: local filesystem paths and remote objects

use anyhow::anyhow;

pub const REMOTE_SCHEME: &str = "s3://";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LocationKind {
    Local,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    Local(std::path::PathBuf),
    /// `key` is an object key or, for roots, a prefix (empty or ending with `/`)
    Remote { bucket: String, key: String },
}

impl Location {
    /// Parses `s3://bucket/key` into a remote location, anything else is a local path.
    pub fn parse(path: &str) -> anyhow::Result<Self> {
        match path.strip_prefix(REMOTE_SCHEME) {
            Some(rest) => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(anyhow!("remote path {:?} is missing a bucket name", path));
                }
                Ok(Location::Remote {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            None => {
                if path.is_empty() {
                    return Err(anyhow!("empty local path"));
                }
                Ok(Location::Local(std::path::PathBuf::from(path)))
            }
        }
    }

    pub fn remote(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Location::Remote {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> LocationKind {
        match self {
            Location::Local(_) => LocationKind::Local,
            Location::Remote { .. } => LocationKind::Remote,
        }
    }

    #[must_use]
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Location::Local(_) => None,
            Location::Remote { bucket, .. } => Some(bucket),
        }
    }

    /// True if the location names a directory/prefix rather than a single item.
    #[must_use]
    pub fn is_dir_like(&self) -> bool {
        match self {
            Location::Local(path) => {
                let path = path.as_os_str().to_string_lossy();
                path.ends_with('/') || path.ends_with(std::path::MAIN_SEPARATOR)
            }
            Location::Remote { key, .. } => key.is_empty() || key.ends_with('/'),
        }
    }

    /// Normalizes a location so that it can be joined with relative keys.
    #[must_use]
    pub fn as_root(&self) -> Location {
        match self {
            Location::Local(_) => self.clone(),
            Location::Remote { bucket, key } => {
                if key.is_empty() || key.ends_with('/') {
                    self.clone()
                } else {
                    Location::remote(bucket.clone(), format!("{key}/"))
                }
            }
        }
    }

    /// Joins a `/` separated relative key onto this (root) location.
    #[must_use]
    pub fn join(&self, relative: &str) -> Location {
        match self {
            Location::Local(path) => {
                let mut joined = path.clone();
                for component in relative.split('/').filter(|c| !c.is_empty()) {
                    joined.push(component);
                }
                Location::Local(joined)
            }
            Location::Remote { bucket, key } => {
                Location::remote(bucket.clone(), format!("{key}{relative}"))
            }
        }
    }

    /// The last path segment, if any.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Location::Remote { key, .. } => key
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote { bucket, key } => write!(f, "{REMOTE_SCHEME}{bucket}/{key}"),
        }
    }
}

/// The combination of location kinds a command was given.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PathsType {
    LocalToRemote,
    RemoteToLocal,
    RemoteToRemote,
    LocalToLocal,
    Remote,
    Local,
}

impl PathsType {
    #[must_use]
    pub fn of(src: &Location, dest: Option<&Location>) -> Self {
        match (src.kind(), dest.map(Location::kind)) {
            (LocationKind::Local, Some(LocationKind::Remote)) => PathsType::LocalToRemote,
            (LocationKind::Remote, Some(LocationKind::Local)) => PathsType::RemoteToLocal,
            (LocationKind::Remote, Some(LocationKind::Remote)) => PathsType::RemoteToRemote,
            (LocationKind::Local, Some(LocationKind::Local)) => PathsType::LocalToLocal,
            (LocationKind::Remote, None) => PathsType::Remote,
            (LocationKind::Local, None) => PathsType::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_remote_and_local() {
        assert_eq!(
            Location::parse("s3://bucket/a/b.txt").unwrap(),
            Location::remote("bucket", "a/b.txt")
        );
        assert_eq!(
            Location::parse("s3://bucket").unwrap(),
            Location::remote("bucket", "")
        );
        assert_eq!(
            Location::parse("some/dir").unwrap(),
            Location::Local("some/dir".into())
        );
        assert!(Location::parse("s3:///key").is_err());
        assert!(Location::parse("").is_err());
    }

    #[test]
    fn display_round_trips_remote_paths() {
        let location = Location::parse("s3://bucket/prefix/").unwrap();
        assert_eq!(location.to_string(), "s3://bucket/prefix/");
        assert_eq!(Location::remote("bucket", "").to_string(), "s3://bucket/");
    }

    #[test]
    fn join_uses_canonical_separator() {
        let root = Location::parse("s3://bucket/prefix").unwrap().as_root();
        assert_eq!(root.join("a/b.txt"), Location::remote("bucket", "prefix/a/b.txt"));
        let local = Location::Local("/tmp/root".into());
        assert_eq!(
            local.join("a/b.txt"),
            Location::Local(std::path::Path::new("/tmp/root").join("a").join("b.txt"))
        );
    }

    #[test]
    fn dir_like_and_file_name() {
        assert!(Location::remote("b", "").is_dir_like());
        assert!(Location::remote("b", "dir/").is_dir_like());
        assert!(!Location::remote("b", "dir/x").is_dir_like());
        assert!(Location::Local("out/".into()).is_dir_like());
        assert_eq!(
            Location::remote("b", "dir/x.txt").file_name().as_deref(),
            Some("x.txt")
        );
        assert_eq!(Location::remote("b", "dir/").file_name(), None);
    }

    #[test]
    fn paths_type_from_kinds() {
        let local = Location::Local("a".into());
        let remote = Location::remote("b", "k");
        assert_eq!(PathsType::of(&local, Some(&remote)), PathsType::LocalToRemote);
        assert_eq!(PathsType::of(&remote, Some(&local)), PathsType::RemoteToLocal);
        assert_eq!(PathsType::of(&remote, Some(&remote)), PathsType::RemoteToRemote);
        assert_eq!(PathsType::of(&remote, None), PathsType::Remote);
    }
}
