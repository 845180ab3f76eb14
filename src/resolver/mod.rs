use reqwest::Url;

use crate::error::Error;
use crate::models::RepoRef;

/// Origin and mirror locations of one repository file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedUrls {
    pub origin: String,
    pub mirror: String,
}

/// Turns repository-relative paths into origin and mirror URLs.
///
/// Pure string composition against two fixed host templates; never touches
/// the network.
#[derive(Clone, Debug)]
pub struct UrlResolver {
    repo: RepoRef,
    origin_base: Url,
    mirror_base: Url,
}

impl UrlResolver {
    pub fn new(repo: RepoRef, origin_base: &str, mirror_base: &str) -> Result<Self, Error> {
        Ok(Self {
            repo,
            origin_base: parse_base(origin_base)?,
            mirror_base: parse_base(mirror_base)?,
        })
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    /// Resolve a file path such as `course/2023/final.pdf`.
    pub fn resolve(&self, path: &str) -> Result<ResolvedUrls, Error> {
        validate_path(path)?;
        let segments: Vec<&str> = path.split('/').collect();

        let origin = extend(
            &self.origin_base,
            [
                self.repo.owner.as_str(),
                self.repo.name.as_str(),
                self.repo.branch.as_str(),
            ]
            .into_iter()
            .chain(segments.iter().copied()),
        )?;
        let mirror = extend(&self.mirror_base, segments.iter().copied())?;

        Ok(ResolvedUrls { origin, mirror })
    }
}

fn parse_base(raw: &str) -> Result<Url, Error> {
    let url = Url::parse(raw.trim()).map_err(|e| Error::Config(format!("bad base URL {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(Error::Config(format!("base URL {raw:?} must be http(s)")));
    }
    Ok(url)
}

fn extend<'a>(base: &Url, segments: impl Iterator<Item = &'a str>) -> Result<String, Error> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("base URL {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.into())
}

/// Check a non-empty, forward-slash separated repository path.
pub fn validate_path(path: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::invalid_path(path, "path is empty"));
    }
    validate_tree_path(path)
}

/// Like [`validate_path`] but accepts the empty repository root.
pub fn validate_tree_path(path: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Ok(());
    }
    if path.contains('\\') {
        return Err(Error::invalid_path(path, "backslash separators are not allowed"));
    }
    if path.chars().any(char::is_control) {
        return Err(Error::invalid_path(path, "control characters are not allowed"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(Error::invalid_path(path, "empty path segment")),
            "." => return Err(Error::invalid_path(path, "'.' segments are not allowed")),
            ".." => return Err(Error::invalid_path(path, "'..' segments are not allowed")),
            _ => {}
        }
    }
    Ok(())
}

/// Append `name` to a parent directory path.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

/// Last segment of a path, or `fallback` for the root.
pub fn leaf_name<'a>(path: &'a str, fallback: &'a str) -> &'a str {
    path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(fallback)
}
