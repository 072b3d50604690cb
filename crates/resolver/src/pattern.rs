use std::collections::BTreeMap;
use std::fmt;

use crate::resolve::FileMatch;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

/// Canonical URL template for one function, e.g. `/users/:id`. Every
/// isolate is keyed by one pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutePattern {
    origin: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parses `/users/:id` or `/docs/*slug` style templates.
    pub fn parse(origin: impl Into<String>, pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|part| !part.is_empty())
            .map(|part| {
                if let Some(name) = part.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else if let Some(name) = part.strip_prefix('*') {
                    Segment::Wildcard(name.to_string())
                } else {
                    Segment::Literal(part.to_string())
                }
            })
            .collect();
        Self {
            origin: origin.into(),
            segments,
        }
    }

    /// Canonicalizes a resolved file: strips the extension, turns `[id]`
    /// into `:id` and `[...slug]` into `*slug`, and drops a trailing
    /// `index_name` segment.
    pub fn from_match(origin: impl Into<String>, found: &FileMatch, index_name: &str) -> Self {
        let raw = if found.match_path.is_empty() {
            &found.path
        } else {
            &found.match_path
        };
        let mut parts: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();

        if let Some(last) = parts.last_mut() {
            if let Some((stem, _)) = last.rsplit_once('.') {
                if !stem.is_empty() {
                    *last = stem;
                }
            }
        }
        if parts.last() == Some(&index_name) {
            parts.pop();
        }

        let segments = parts
            .into_iter()
            .map(|part| match part.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
                Some(inner) => match inner.strip_prefix("...") {
                    Some(rest) => Segment::Wildcard(rest.to_string()),
                    None => Segment::Param(inner.to_string()),
                },
                None => Segment::Literal(part.to_string()),
            })
            .collect();

        Self {
            origin: origin.into(),
            segments,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Literal(_)))
            .count()
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Wildcard(_)))
    }

    /// Ranking used to pick among several matching patterns: more literal
    /// segments first, then patterns without a wildcard, then longer ones.
    pub fn specificity(&self) -> (usize, bool, usize) {
        (self.literal_count(), !self.has_wildcard(), self.segments.len())
    }

    /// Matches a concrete path, returning the captured parameters.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let mut params = BTreeMap::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(expected) => {
                    if parts.get(index) != Some(&expected.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(index)?;
                    params.insert(name.clone(), value.to_string());
                }
                Segment::Wildcard(name) => {
                    if index >= parts.len() || index + 1 != self.segments.len() {
                        return None;
                    }
                    params.insert(name.clone(), parts[index..].join("/"));
                    return Some(params);
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(value) => write!(f, "/{}", value)?,
                Segment::Param(name) => write!(f, "/:{}", name)?,
                Segment::Wildcard(name) => write!(f, "/*{}", name)?,
            }
        }
        Ok(())
    }
}

/// Picks the most specific pattern matching `path`.
pub fn best_match<'a, I>(patterns: I, path: &str) -> Option<(&'a RoutePattern, BTreeMap<String, String>)>
where
    I: IntoIterator<Item = &'a RoutePattern>,
{
    patterns
        .into_iter()
        .filter_map(|pattern| pattern.matches(path).map(|params| (pattern, params)))
        .max_by(|(a, _), (b, _)| {
            a.specificity()
                .cmp(&b.specificity())
                .then_with(|| b.to_string().cmp(&a.to_string()))
        })
}
