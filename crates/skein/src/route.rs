//! URL classification for dispatch.
//!
//! A request URL (or a stream event path) resolves to the entity service it
//! addresses, an optional trailing id, and the owning parent when the URL is
//! nested. The session resource is routed as its own variant so the
//! dispatcher can pattern-match instead of branching on string prefixes.

/// Where a URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The session resource (`/session...`).
    Session,
    /// A generic entity endpoint.
    Entity(UrlInfo),
}

/// Decomposed entity URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlInfo {
    pub service: String,
    pub id: Option<String>,
    pub parent: Option<ParentRef>,
}

/// Reference to the entity that owns the addressed collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub ty: String,
    pub id: String,
}

/// Classify a request URL.
pub fn classify(url: &str) -> Option<Route> {
    let info = url_info(url, 0)?;
    if info.service == "session" {
        Some(Route::Session)
    } else {
        Some(Route::Entity(info))
    }
}

/// Decompose a path into `{service, id, parent}`.
///
/// Segments alternate service/id pairs: `/network/<nid>/device/<did>` yields
/// service `device`, id `did`, parent `network/<nid>`. `skip` drops leading
/// segments first; stream event paths carry a version prefix that is not part
/// of the entity hierarchy.
pub fn url_info(path: &str, skip: usize) -> Option<UrlInfo> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip(skip)
        .collect();
    if segments.is_empty() {
        return None;
    }

    let mut pairs: Vec<(String, Option<String>)> = Vec::new();
    let mut i = 0;
    while i < segments.len() {
        let service = segments[i].to_string();
        let id = segments.get(i + 1).map(|s| s.to_string());
        pairs.push((service, id));
        i += 2;
    }

    let (service, id) = pairs.pop()?;
    let parent = pairs
        .pop()
        .and_then(|(ty, id)| id.map(|id| ParentRef { ty, id }));
    Some(UrlInfo {
        service,
        id,
        parent,
    })
}
